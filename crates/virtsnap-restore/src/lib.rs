//! VM restore reconciler
//!
//! - [`controller`]: VirtualMachineRestore stages and status
//! - [`volumes`]: restored claims, ownership hand-over, backend storage
//! - [`target`]: the VM being restored onto
//! - [`revisions`]: instance type and preference revisions of the target

pub mod controller;
pub mod revisions;
pub mod target;
pub mod volumes;

pub use controller::reconcile;
pub use target::{apply_patches, resolve_target, restored_spec, RestoreTarget, VirtualMachineTarget};
pub use volumes::{destination_claim, plan_volume_restores, restore_claim_name};
