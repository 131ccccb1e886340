//! Persistent queue configuration

use serde::{Deserialize, Serialize};

use crate::queue::SyncMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// WAL fsync policy
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Group-commit size when `sync_mode = "batch"`
    #[serde(default = "default_sync_every_ops")]
    pub sync_every_ops: u64,
    /// Seconds between index snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

fn default_sync_every_ops() -> u64 {
    64
}

fn default_snapshot_interval() -> u64 {
    60
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            sync_every_ops: default_sync_every_ops(),
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}
