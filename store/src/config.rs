//! Connection and protocol configuration for the store.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration recognized by [`crate::store::Store::open`], per the options table
/// in the design document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// DB location. `":memory:"` (or a `file::memory:` prefix) enables a
    /// shared-cache in-memory database. Empty is a configuration error.
    pub path: String,

    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,

    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,

    #[serde(default = "default_conn_max_lifetime")]
    pub conn_max_lifetime: Duration,

    #[serde(default = "default_conn_max_idle_time")]
    pub conn_max_idle_time: Duration,

    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: Duration,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: Duration,

    /// Cap on recursive-CTE depth for task-tree traversal. Overridable per request
    /// by callers that pass an explicit depth to
    /// [`crate::repositories::task::TaskRepository::get_task_tree`].
    #[serde(default = "default_max_task_context_depth")]
    pub max_task_context_depth: u32,

    /// Busy-retry attempt ceiling.
    #[serde(default = "default_max_transaction_retries")]
    pub max_transaction_retries: u32,
}

fn default_max_open_conns() -> u32 {
    25
}

fn default_max_idle_conns() -> u32 {
    5
}

fn default_conn_max_lifetime() -> Duration {
    Duration::from_secs(3600)
}

fn default_conn_max_idle_time() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_task_context_depth() -> u32 {
    100
}

fn default_max_transaction_retries() -> u32 {
    50
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            max_open_conns: default_max_open_conns(),
            max_idle_conns: default_max_idle_conns(),
            conn_max_lifetime: default_conn_max_lifetime(),
            conn_max_idle_time: default_conn_max_idle_time(),
            busy_timeout: default_busy_timeout(),
            ping_timeout: default_ping_timeout(),
            max_task_context_depth: default_max_task_context_depth(),
            max_transaction_retries: default_max_transaction_retries(),
        }
    }
}

impl StoreConfig {
    /// Build a configuration for a given database path, keeping all other
    /// defaults as-is.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Configuration for a transient, shared-cache, in-memory database.
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    pub(crate) fn is_memory(&self) -> bool {
        self.path == ":memory:" || self.path.starts_with("file::memory:")
    }
}
