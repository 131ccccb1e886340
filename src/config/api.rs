//! Admin HTTP API configuration

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Serve the admin API
    pub enabled: bool,
    /// Listen address, e.g. "127.0.0.1:9443"
    pub listen_addr: String,
    /// Expose Prometheus metrics at /metrics
    pub prometheus: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9443".to_string(),
            prometheus: true,
        }
    }
}
