//! Configuration for webarc

mod api;
mod crawl;
mod hq;
mod logging;
mod queue;
mod warc;

pub use api::ApiConfig;
pub use crawl::{CrawlConfig, DEFAULT_USER_AGENT};
pub use hq::HqConfig;
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use queue::QueueConfig;
pub use warc::WarcConfig;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for a crawl
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Crawl scope and limits
    #[serde(default)]
    pub crawl: CrawlConfig,
    /// Persistent queue settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Crawl HQ work source
    #[serde(default)]
    pub hq: HqConfig,
    /// Admin HTTP API
    #[serde(default)]
    pub api: ApiConfig,
    /// WARC writer options
    #[serde(default)]
    pub warc: WarcConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together so the user
    /// can fix everything in one pass rather than playing whack-a-mole.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.crawl.job.is_empty() {
            errors.push("crawl job name must not be empty".to_string());
        }
        if self.crawl.jobs_dir.as_os_str().is_empty() {
            errors.push("jobs_dir must not be empty".to_string());
        }
        if self.crawl.workers == 0 {
            errors.push("workers must be positive".to_string());
        }
        if self.crawl.max_concurrent_assets == 0 {
            errors.push("max_concurrent_assets must be positive".to_string());
        }
        if self.crawl.max_concurrent_requests_per_domain == 0 {
            errors.push("max_concurrent_requests_per_domain must be positive".to_string());
        }
        if self.crawl.http_timeout_secs == 0 {
            errors.push("http_timeout_secs must be positive".to_string());
        }
        if self.crawl.user_agent.is_empty() {
            errors.push("user_agent must not be empty".to_string());
        }
        if self.crawl.max_crawl_time_limit_secs > 0
            && self.crawl.crawl_time_limit_secs > self.crawl.max_crawl_time_limit_secs
        {
            errors.push("crawl_time_limit_secs must not exceed max_crawl_time_limit_secs".to_string());
        }

        if self.queue.sync_every_ops == 0 {
            errors.push("sync_every_ops must be positive".to_string());
        }
        if self.queue.snapshot_interval_secs == 0 {
            errors.push("snapshot_interval_secs must be positive".to_string());
        }

        if self.hq.enabled && self.hq.address.is_empty() {
            errors.push("hq.address must be set when hq is enabled".to_string());
        }

        if self.api.enabled {
            if let Some(port_str) = self.api.listen_addr.rsplit(':').next() {
                match port_str.parse::<u32>() {
                    Ok(port) if port > 0 && port <= 65535 => {}
                    Ok(port) => {
                        errors.push(format!(
                            "API listen port must be between 1 and 65535, got {}",
                            port
                        ));
                    }
                    Err(_) => {
                        errors.push(format!("invalid API listen address '{}'", self.api.listen_addr));
                    }
                }
            }
        }

        if self.warc.prefix.is_empty() {
            errors.push("warc prefix must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}
