//! Controller runner - builds controller futures for each vertical slice
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. Secondary watches use the mappers in [`crate::mappers`],
//! looking primaries up in the controller's own reflector store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use virtsnap_common::crd::{
    DataVolume, VirtualMachine, VirtualMachineClone, VirtualMachineInstance,
    VirtualMachineRestore, VirtualMachineSnapshot, VirtualMachineSnapshotContent, VolumeSnapshot,
};
use virtsnap_common::{default_error_policy, ControllerContext, ControllerSettings};

use crate::mappers;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build snapshot controller futures (VirtualMachineSnapshot, content, volume capability)
pub fn build_snapshot_controllers(
    client: Client,
    settings: ControllerSettings,
    concurrency: u16,
) -> Vec<ControllerFuture> {
    let config = ControllerConfig::default().concurrency(concurrency);

    let snapshots: Api<VirtualMachineSnapshot> = Api::all(client.clone());
    let snapshot_ctx = Arc::new(ControllerContext::new(
        client.clone(),
        "virtualmachinesnapshot-controller",
        settings.clone(),
    ));
    let snapshot_ctrl = Controller::new(snapshots, watcher()).with_config(config.clone());
    let by_vm = snapshot_ctrl.store();
    let by_vmi = snapshot_ctrl.store();
    let snapshot_ctrl = snapshot_ctrl
        .watches(
            Api::<VirtualMachine>::all(client.clone()),
            watcher(),
            move |vm| mappers::snapshots_for_vm(&vm, &by_vm.state()),
        )
        .watches(
            Api::<VirtualMachineInstance>::all(client.clone()),
            watcher(),
            move |vmi| mappers::snapshots_for_vm(&vmi, &by_vmi.state()),
        )
        .watches(
            Api::<VirtualMachineSnapshotContent>::all(client.clone()),
            watcher(),
            |content| mappers::snapshot_for_content(&content),
        )
        .shutdown_on_signal()
        .run(
            virtsnap_snapshot::controller::reconcile,
            default_error_policy,
            snapshot_ctx,
        )
        .for_each(log_reconcile_result("Snapshot"));

    let contents: Api<VirtualMachineSnapshotContent> = Api::all(client.clone());
    let content_ctx = Arc::new(ControllerContext::new(
        client.clone(),
        "virtualmachinesnapshotcontent-controller",
        settings.clone(),
    ));
    let content_ctrl = Controller::new(contents, watcher())
        .with_config(config.clone())
        .owns(Api::<VolumeSnapshot>::all(client.clone()), watcher())
        .watches(
            Api::<VirtualMachineSnapshot>::all(client.clone()),
            watcher(),
            |snapshot| mappers::content_for_snapshot(&snapshot),
        )
        .shutdown_on_signal()
        .run(
            virtsnap_snapshot::content::reconcile,
            default_error_policy,
            content_ctx,
        )
        .for_each(log_reconcile_result("SnapshotContent"));

    let vms: Api<VirtualMachine> = Api::all(client.clone());
    let capability_ctx = Arc::new(ControllerContext::new(
        client,
        "vm-snapshot-capability-controller",
        settings,
    ));
    let capability_ctrl = Controller::new(vms, watcher())
        .with_config(config)
        .shutdown_on_signal()
        .run(
            virtsnap_snapshot::capability::reconcile,
            default_error_policy,
            capability_ctx,
        )
        .for_each(log_reconcile_result("VolumeSnapshotCapability"));

    tracing::info!("- VirtualMachineSnapshot controller");
    tracing::info!("- VirtualMachineSnapshotContent controller");
    tracing::info!("- VM volume snapshot capability controller");

    vec![
        Box::pin(snapshot_ctrl),
        Box::pin(content_ctrl),
        Box::pin(capability_ctrl),
    ]
}

/// Build the VirtualMachineRestore controller future
pub fn build_restore_controllers(
    client: Client,
    settings: ControllerSettings,
    concurrency: u16,
) -> Vec<ControllerFuture> {
    let restores: Api<VirtualMachineRestore> = Api::all(client.clone());
    let ctx = Arc::new(ControllerContext::new(
        client.clone(),
        "virtualmachinerestore-controller",
        settings,
    ));
    let ctrl = Controller::new(restores, watcher())
        .with_config(ControllerConfig::default().concurrency(concurrency));
    let by_vm = ctrl.store();
    let by_vmi = ctrl.store();
    let by_snapshot = ctrl.store();
    let ctrl = ctrl
        .watches(
            Api::<VirtualMachine>::all(client.clone()),
            watcher(),
            move |vm| mappers::restores_for_target(&vm, &by_vm.state()),
        )
        .watches(
            Api::<VirtualMachineInstance>::all(client.clone()),
            watcher(),
            move |vmi| mappers::restores_for_target(&vmi, &by_vmi.state()),
        )
        .watches(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher(),
            |pvc| mappers::restore_for_volume(&pvc),
        )
        .watches(
            Api::<DataVolume>::all(client.clone()),
            watcher(),
            |dv| mappers::restore_for_volume(&dv),
        )
        .watches(
            Api::<VirtualMachineSnapshot>::all(client),
            watcher(),
            move |snapshot| mappers::restores_for_snapshot(&snapshot, &by_snapshot.state()),
        )
        .shutdown_on_signal()
        .run(virtsnap_restore::reconcile, default_error_policy, ctx)
        .for_each(log_reconcile_result("Restore"));

    tracing::info!("- VirtualMachineRestore controller");

    vec![Box::pin(ctrl)]
}

/// Build the VirtualMachineClone controller future
pub fn build_clone_controllers(
    client: Client,
    settings: ControllerSettings,
    concurrency: u16,
) -> Vec<ControllerFuture> {
    let clones: Api<VirtualMachineClone> = Api::all(client.clone());
    let ctx = Arc::new(ControllerContext::new(
        client.clone(),
        "virtualmachineclone-controller",
        settings,
    ));
    let ctrl = Controller::new(clones, watcher())
        .with_config(ControllerConfig::default().concurrency(concurrency));
    let store = ctrl.store();
    let ctrl = ctrl
        .owns(Api::<VirtualMachineSnapshot>::all(client.clone()), watcher())
        .owns(Api::<VirtualMachineRestore>::all(client.clone()), watcher())
        .watches(
            Api::<VirtualMachine>::all(client),
            watcher(),
            move |vm| mappers::clones_for_vm(&vm, &store.state()),
        )
        .shutdown_on_signal()
        .run(virtsnap_clone::reconcile, default_error_policy, ctx)
        .for_each(log_reconcile_result("Clone"));

    tracing::info!("- VirtualMachineClone controller");

    vec![Box::pin(ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
