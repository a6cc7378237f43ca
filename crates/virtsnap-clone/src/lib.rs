//! VM clone reconciler
//!
//! - [`controller`]: VirtualMachineClone stages, from snapshot to target VM
//! - [`fsm`]: legal phase transitions
//! - [`patches`]: identity rewrites applied to the cloned VM

pub mod controller;
pub mod fsm;
pub mod patches;

pub use controller::{reconcile, restore_name, snapshot_name, target_name};
pub use fsm::{can_transition, transition, InvalidTransition};
pub use patches::{clone_patches, KeyFilter};
