//! Crawl statistics
//!
//! Atomic counters and gauges shared across stages, plus a sliding-window
//! rate tracker for the URI/s figure and Prometheus text exposition for
//! the admin API.

use std::collections::VecDeque;
use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for thread-safe value tracking
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Events-per-second over a sliding window
#[derive(Debug)]
pub struct RateTracker {
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn mark(&self) {
        let now = Instant::now();
        let mut events = self.events.lock();
        events.push_back(now);
        while let Some(front) = events.front() {
            if now.duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current rate in events per second
    pub fn rate(&self) -> f64 {
        let now = Instant::now();
        let mut events = self.events.lock();
        while let Some(front) = events.front() {
            if now.duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        events.len() as f64 / self.window.as_secs_f64()
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Overall state of the crawl as reported by the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlState {
    Running,
    Paused,
    Finishing,
}

impl CrawlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finishing => "finishing",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Paused,
            2 => Self::Finishing,
            _ => Self::Running,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Paused => 1,
            Self::Finishing => 2,
        }
    }
}

/// All crawl metrics, shared across the stages
#[derive(Debug)]
pub struct CrawlStats {
    pub crawled_seeds: Counter,
    pub crawled_assets: Counter,
    pub failed_captures: Counter,
    pub queued: Gauge,
    pub uri_rate: RateTracker,

    // Per-stage in-flight task gauges
    pub preprocessor_routines: Gauge,
    pub archiver_routines: Gauge,
    pub postprocessor_routines: Gauge,
    pub finisher_routines: Gauge,

    pub seencheck_hits: Counter,

    started: Instant,
    state: AtomicU8,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self {
            crawled_seeds: Counter::new(),
            crawled_assets: Counter::new(),
            failed_captures: Counter::new(),
            queued: Gauge::new(),
            uri_rate: RateTracker::default(),
            preprocessor_routines: Gauge::new(),
            archiver_routines: Gauge::new(),
            postprocessor_routines: Gauge::new(),
            finisher_routines: Gauge::new(),
            seencheck_hits: Counter::new(),
            started: Instant::now(),
            state: AtomicU8::new(CrawlState::Running.as_u8()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn crawled_total(&self) -> u64 {
        self.crawled_seeds.get() + self.crawled_assets.get()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn state(&self) -> CrawlState {
        CrawlState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: CrawlState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    /// Export all metrics in Prometheus exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        write_counter(
            &mut out,
            "webarc_crawled_seeds_total",
            "Seeds and outlinks captured",
            self.crawled_seeds.get(),
        );
        write_counter(
            &mut out,
            "webarc_crawled_assets_total",
            "Page assets captured",
            self.crawled_assets.get(),
        );
        write_counter(
            &mut out,
            "webarc_failed_captures_total",
            "Captures that ended in a network error",
            self.failed_captures.get(),
        );
        write_counter(
            &mut out,
            "webarc_seencheck_hits_total",
            "URLs filtered out as already seen",
            self.seencheck_hits.get(),
        );
        write_gauge(&mut out, "webarc_queued", "Items waiting in the queue", self.queued.get());
        write_gauge(
            &mut out,
            "webarc_preprocessor_routines",
            "In-flight preprocessor tasks",
            self.preprocessor_routines.get(),
        );
        write_gauge(
            &mut out,
            "webarc_archiver_routines",
            "In-flight archiver tasks",
            self.archiver_routines.get(),
        );
        write_gauge(
            &mut out,
            "webarc_postprocessor_routines",
            "In-flight postprocessor tasks",
            self.postprocessor_routines.get(),
        );
        write_gauge(
            &mut out,
            "webarc_finisher_routines",
            "In-flight finisher tasks",
            self.finisher_routines.get(),
        );

        let _ = writeln!(out, "# HELP webarc_uri_per_second Capture rate over the last minute");
        let _ = writeln!(out, "# TYPE webarc_uri_per_second gauge");
        let _ = writeln!(out, "webarc_uri_per_second {:.3}", self.uri_rate.rate());
        let _ = writeln!(out);

        out
    }
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self::new()
    }
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

/// Format an uptime the way the admin API reports it
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
