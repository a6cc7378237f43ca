//! VM snapshot operator: controller wiring for the snapshot, restore and
//! clone reconcilers

#![deny(missing_docs)]

pub mod controller_runner;
pub mod mappers;
