//! Crawl HQ configuration

use serde::{Deserialize, Serialize};

/// Remote work-source settings. When enabled, HQ replaces the local queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HqConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the HQ service
    #[serde(default)]
    pub address: String,
    /// Project identifier sent with every call
    #[serde(default)]
    pub project: String,
    /// Feed batch size; 0 means half the worker count
    #[serde(default)]
    pub batch_size: usize,
    /// Keep pulling even when workers are nearly saturated
    #[serde(default)]
    pub continuous_pull: bool,
    /// Feed strategy hint passed through to HQ
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    "new".to_string()
}

impl Default for HqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            project: String::new(),
            batch_size: 0,
            continuous_pull: false,
            strategy: default_strategy(),
        }
    }
}
