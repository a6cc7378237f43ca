//! Shared reconciler context and error policy

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::client::{KubeVirtClient, VirtClient};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::settings::ControllerSettings;
use crate::Error;

/// Everything a reconciler needs besides the object it reconciles
pub struct ControllerContext {
    /// Cluster access
    pub kube: Arc<dyn VirtClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Polling and deadline settings
    pub settings: ControllerSettings,
}

impl ControllerContext {
    /// Context backed by a live cluster
    pub fn new(client: Client, controller_name: &str, settings: ControllerSettings) -> Self {
        Self {
            kube: Arc::new(KubeVirtClient::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, controller_name)),
            settings,
        }
    }

    /// Context from explicit parts, used by tests
    pub fn from_parts(
        kube: Arc<dyn VirtClient>,
        events: Arc<dyn EventPublisher>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            kube,
            events,
            settings,
        }
    }
}

/// Requeue policy shared by every controller
///
/// Conflicts come from stale caches and are retried right away. Other
/// retryable errors back off by the configured interval. Errors that need a
/// spec change wait for the object to change.
pub fn default_error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<ControllerContext>) -> Action
where
    K: Resource,
{
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    if error.is_conflict() {
        debug!(%namespace, %name, %error, "conflict, requeueing");
        return Action::requeue(std::time::Duration::from_millis(500));
    }
    if error.is_retryable() {
        warn!(%namespace, %name, %error, "reconcile failed, will retry");
        Action::requeue(ctx.settings.error_requeue)
    } else {
        warn!(%namespace, %name, %error, "reconcile failed, waiting for a change");
        Action::await_change()
    }
}
