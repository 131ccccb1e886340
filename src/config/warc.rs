//! WARC writer options, passed through to the external writer

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarcConfig {
    /// File name prefix: `<prefix>-<timestamp>-<seq>.warc.gz`
    pub prefix: String,
    /// Rotation size per WARC file
    pub max_size_mib: u64,
}

impl Default for WarcConfig {
    fn default() -> Self {
        Self {
            prefix: "WEBARC".to_string(),
            max_size_mib: 1024,
        }
    }
}
