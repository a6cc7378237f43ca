//! VM snapshot reconcilers
//!
//! - [`controller`]: VirtualMachineSnapshot, from lock to ready content
//! - [`content`]: VirtualMachineSnapshotContent, storage snapshots and freeze
//! - [`capability`]: per-volume snapshot capability on VirtualMachine status
//!
//! The source lock and freeze protocol lives in [`source`].

pub mod capability;
pub mod content;
pub mod controller;
pub mod source;
pub mod storage;

pub use controller::{
    compute_status, content_name, should_delete_content, snapshot_revision_name,
    volume_snapshot_name, SourceObservation,
};
pub use source::{resolve_source, SnapshotSource, VirtualMachineSource};
pub use storage::{snapshot_claim, volume_snapshot_class, volume_storage_class};
