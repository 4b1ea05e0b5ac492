//! Common types and configuration for the Courier dispatcher

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default number of units the pending queue holds before `push` suspends
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

/// Default number of units allowed to run at the same time
pub const DEFAULT_MAX_RUNNING: usize = 2048;

/// Configuration for a dispatcher.
///
/// Both limits are fixed when the dispatcher is constructed. Changing a
/// config value afterwards has no effect on an existing dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of units waiting in the pending queue
    pub queue_capacity: usize,

    /// Maximum number of units executing concurrently
    pub max_running: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_running: DEFAULT_MAX_RUNNING,
        }
    }
}

impl DispatcherConfig {
    /// Create a new dispatcher configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pending queue capacity
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> ConfigResult<Self> {
        if queue_capacity == 0 {
            return Err(ConfigError::invalid_queue_capacity(queue_capacity));
        }
        self.queue_capacity = queue_capacity;
        Ok(self)
    }

    /// Set the maximum number of concurrently running units
    pub fn with_max_running(mut self, max_running: usize) -> ConfigResult<Self> {
        if max_running == 0 {
            return Err(ConfigError::invalid_max_running(max_running));
        }
        self.max_running = max_running;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid_queue_capacity(self.queue_capacity));
        }
        if self.max_running == 0 {
            return Err(ConfigError::invalid_max_running(self.max_running));
        }
        Ok(())
    }

    /// Create a small configuration suited to tests
    pub fn for_testing() -> Self {
        Self {
            queue_capacity: 16,
            max_running: 4,
        }
    }
}

/// Snapshot of a dispatcher's queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Units sitting in the pending queue
    pub pending: usize,

    /// Producers suspended in `push` because the queue is full
    pub blocked: usize,

    /// Units currently holding a running slot
    pub running: usize,
}

impl DispatcherStats {
    /// Check if nothing is queued, blocked or running
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.blocked == 0 && self.running == 0
    }
}
