//! Tunables shared by every controller

use std::time::Duration;

/// Polling and deadline settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Revisit interval while waiting for the source lock
    pub snapshot_retry_interval: Duration,
    /// Revisit interval while waiting for content deletion
    pub content_deletion_interval: Duration,
    /// How long a guest stays frozen before the agent thaws it on its own
    pub freeze_timeout: Duration,
    /// Failure deadline for snapshots that do not set one
    pub default_failure_deadline: Duration,
    /// Grace period for running restore targets
    pub default_grace_period: Duration,
    /// Revisit interval while a restore or clone waits on dependents
    pub requeue_in_progress: Duration,
    /// Requeue interval after a retryable reconcile error
    pub error_requeue: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            snapshot_retry_interval: Duration::from_secs(5),
            content_deletion_interval: Duration::from_secs(5),
            freeze_timeout: Duration::from_secs(5 * 60),
            default_failure_deadline: Duration::from_secs(5 * 60),
            default_grace_period: Duration::from_secs(5 * 60),
            requeue_in_progress: Duration::from_secs(15),
            error_requeue: Duration::from_secs(30),
        }
    }
}
