//! Read-only VMDK virtual disk reader with snapshot chain resolution.

pub mod raw;
pub mod vmdk;

pub use vmdk::{DiskImage, ReadControl, ReadOutcome, VMDKError};
