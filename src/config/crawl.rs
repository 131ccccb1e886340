//! Crawl behavior configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default user agent for all captures
pub const DEFAULT_USER_AGENT: &str = "webarc/0.3 (+https://github.com/webarc/webarc)";

/// Crawl scope, limits, and HTTP tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Job name; the job directory is `<jobs_dir>/<job>`
    pub job: String,
    /// Parent directory for all job directories
    pub jobs_dir: PathBuf,
    /// Global in-flight item cap (the reactor token budget)
    pub workers: usize,
    /// Maximum outlink distance from a seed
    pub max_hops: u16,
    /// Maximum redirect chain depth
    pub max_redirect: u8,
    /// Parallel asset captures per item
    pub max_concurrent_assets: usize,
    /// Follow outlinks regardless of hop count
    pub domains_crawl: bool,
    /// Skip asset extraction and capture entirely
    pub disable_assets_capture: bool,
    /// Also capture `link rel=alternate` targets
    pub capture_alternate_pages: bool,
    /// If non-empty, only these hosts are kept
    #[serde(default)]
    pub included_hosts: Vec<String>,
    /// Hosts dropped from every extraction
    #[serde(default)]
    pub excluded_hosts: Vec<String>,
    /// URLs containing any of these substrings are dropped
    #[serde(default)]
    pub excluded_strings: Vec<String>,
    /// Use the local seencheck store (ignored when HQ is active)
    pub local_seencheck: bool,
    pub user_agent: String,
    /// Per-request HTTP timeout
    pub http_timeout_secs: u64,
    /// Concurrent captures allowed against one host
    pub max_concurrent_requests_per_domain: usize,
    /// Fixed delay between consecutive requests to the same host
    pub rate_limit_delay_ms: u64,
    /// Soft wall-clock limit; triggers a graceful stop. 0 = unlimited
    pub crawl_time_limit_secs: u64,
    /// Hard wall-clock limit; forces shutdown. 0 = unlimited
    pub max_crawl_time_limit_secs: u64,
    /// Pause the crawl when free disk space falls below this
    pub min_space_required_mib: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            job: "default".to_string(),
            jobs_dir: PathBuf::from("jobs"),
            workers: 8,
            max_hops: 0,
            max_redirect: 5,
            max_concurrent_assets: 8,
            domains_crawl: false,
            disable_assets_capture: false,
            capture_alternate_pages: false,
            included_hosts: Vec::new(),
            excluded_hosts: Vec::new(),
            excluded_strings: Vec::new(),
            local_seencheck: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 30,
            max_concurrent_requests_per_domain: 2,
            rate_limit_delay_ms: 50,
            crawl_time_limit_secs: 0,
            max_crawl_time_limit_secs: 0,
            min_space_required_mib: 1024,
        }
    }
}

impl CrawlConfig {
    pub fn job_dir(&self) -> PathBuf {
        self.jobs_dir.join(&self.job)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.job_dir().join("queue")
    }

    pub fn seencheck_dir(&self) -> PathBuf {
        self.job_dir().join("seencheck")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.job_dir().join("logs")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.job_dir().join("temp")
    }
}
