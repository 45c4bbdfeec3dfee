//! Controller configuration

use crate::error::{OperatorError, Result};
use crate::rate_limit::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_BUCKET_BURST, DEFAULT_BUCKET_QPS,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Tuning knobs of the reconciliation loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    #[validate(range(min = 1, max = 64, message = "workers must be between 1 and 64"))]
    pub workers: usize,

    /// How long to wait for the caches before starting workers anyway
    pub cache_sync_timeout_secs: u64,

    /// Interval at which every cached cluster is enqueued again (0 disables)
    pub resync_interval_secs: u64,

    /// Base delay of the per-cluster retry backoff
    #[validate(range(min = 1, message = "backoff base must be at least 1ms"))]
    pub backoff_base_ms: u64,

    /// Cap of the per-cluster retry backoff
    pub backoff_max_secs: u64,

    /// Overall requeue rate
    #[validate(range(exclusive_min = 0.0, message = "bucket qps must be positive"))]
    pub bucket_qps: f64,

    /// Overall requeue burst
    #[validate(range(min = 1, message = "bucket burst must be at least 1"))]
    pub bucket_burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            cache_sync_timeout_secs: 60,
            resync_interval_secs: 300,
            backoff_base_ms: DEFAULT_BACKOFF_BASE.as_millis() as u64,
            backoff_max_secs: DEFAULT_BACKOFF_MAX.as_secs(),
            bucket_qps: DEFAULT_BUCKET_QPS,
            bucket_burst: DEFAULT_BUCKET_BURST,
        }
    }
}

impl ControllerConfig {
    /// Check the configuration for values the controller cannot run with
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| OperatorError::InvalidConfig(e.to_string()))?;

        if self.backoff_base() > self.backoff_max() {
            return Err(OperatorError::InvalidConfig(format!(
                "backoff base ({:?}) exceeds backoff cap ({:?})",
                self.backoff_base(),
                self.backoff_max()
            )));
        }
        Ok(())
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    /// Resync period, `None` when periodic resync is disabled
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}
