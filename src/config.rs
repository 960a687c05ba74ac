//! Controller configuration

use std::time::Duration;

use crate::queue::RateLimitConfig;

/// Runtime settings for the controller process
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Requeue backoff and throttling
    pub rate_limit: RateLimitConfig,
    /// Period of the full cache re-announcement; `None` disables it
    pub resync_period: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            namespace: None,
            rate_limit: RateLimitConfig::default(),
            resync_period: Some(Duration::from_secs(30)),
        }
    }
}
