//! Read-only access to VMware VMDK virtual disks.
//!
//! A disk is described by a text descriptor (or one embedded in a monolithic sparse file) listing its extents.
//! Sparse extents locate their data through a two-level grain index, and snapshot images defer every grain
//! they never wrote to their parent image.

pub mod control;
pub mod descriptor;
pub mod error;
pub mod extent;
pub mod extent_set;
pub mod grain;
pub mod handles;
pub mod image;
pub mod sparse;

#[cfg(test)]
mod fixtures;

pub use control::ReadControl;
pub use descriptor::{Descriptor, DescriptorHeader, ExtentDeclaration, ExtentType};
pub use error::{ReadOutcome, VMDKError};
pub use extent::{ConsumedGrain, Extent, GrainLocation};
pub use extent_set::ExtentSet;
pub use grain::GrainOffsets;
pub use image::{DiskImage, ImageState};
pub use sparse::SparseHeader;

pub const SECTOR_SIZE: u64 = 512;
