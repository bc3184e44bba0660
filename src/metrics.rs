//! Metrics seam
//!
//! Hooks at the points the request path actually crosses. The default sink
//! discards everything; embedders plug their own backend in through
//! [`crate::config::ConfigBuilder::metrics`].

use std::time::Duration;

/// Where execution metrics are reported.
pub trait Metrics: Send + Sync {
    /// A request acquired a free thread and was handed off.
    fn request_admitted(&self, _worker: &str) {}

    /// A request was rejected before dispatch (validation or caller-classified).
    fn request_rejected(&self, _status: u16) {}

    /// No thread became free within the configured wait window.
    fn dispatch_timeout(&self, _worker: &str) {}

    /// An execution finished without error. `elapsed` is measured from
    /// context creation.
    fn execution_succeeded(&self, _worker: &str, _elapsed: Duration) {}

    /// An execution ended in an error.
    fn execution_failed(&self, _worker: &str) {}
}

/// Discards all metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}
