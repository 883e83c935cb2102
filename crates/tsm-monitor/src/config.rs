//! Engine configuration.
//!
//! Constructor-injected; every queue in the engine is bounded and every bound
//! lives here so tests can shrink them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-session output capture (bytes).
pub const DEFAULT_OUTPUT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Default analysis job queue depth.
pub const DEFAULT_JOB_QUEUE_CAPACITY: usize = 100;

/// Default number of analysis workers.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;

/// Default per-session mirror queue depth.
pub const DEFAULT_MIRROR_QUEUE_CAPACITY: usize = 100;

/// Tunable bounds and timeouts for the monitoring engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Capacity of each session's output ring buffer (bytes).
    pub output_buffer_capacity: usize,

    /// Bounded depth of the analysis job queue. A full queue drops jobs.
    pub job_queue_capacity: usize,

    /// Fixed number of concurrent analysis workers.
    pub worker_pool_size: usize,

    /// Bounded depth of each session's mirror queue. A full queue evicts
    /// the oldest entry (newest wins).
    pub mirror_queue_capacity: usize,

    /// Fallback completion: elapsed time after which a command with some
    /// observed output is considered finished.
    pub fallback_soft_timeout: Duration,

    /// Fallback completion: hard ceiling regardless of output.
    pub fallback_hard_timeout: Duration,

    /// How long `stop()`/`close()` wait for background tasks to drain.
    pub shutdown_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            output_buffer_capacity: DEFAULT_OUTPUT_BUFFER_CAPACITY,
            job_queue_capacity: DEFAULT_JOB_QUEUE_CAPACITY,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            mirror_queue_capacity: DEFAULT_MIRROR_QUEUE_CAPACITY,
            fallback_soft_timeout: Duration::from_millis(500),
            fallback_hard_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.output_buffer_capacity, 64 * 1024);
        assert_eq!(config.job_queue_capacity, 100);
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.mirror_queue_capacity, 100);
        assert_eq!(config.fallback_soft_timeout, Duration::from_millis(500));
        assert_eq!(config.fallback_hard_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{"worker_pool_size": 2}"#).expect("parse");
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.job_queue_capacity, DEFAULT_JOB_QUEUE_CAPACITY);
    }
}
