//! Error taxonomy for VMDK decoding and reads.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VMDKError {
    /// The sparse header cannot be decoded or its fields are inconsistent.
    #[error("Malformed sparse header in {extent}: {reason}")]
    MalformedHeader { extent: String, reason: String },

    /// A grain directory or grain table entry points outside the metadata region.
    #[error("Truncated grain index in {extent}: {reason}")]
    TruncatedIndex { extent: String, reason: String },

    /// A positioned read on an extent file failed or came back short.
    #[error("Error reading {extent} at offset {offset}: {cause}")]
    IoRead {
        extent: String,
        offset: u64,
        #[source]
        cause: io::Error,
    },

    #[error("Parent image with CID {parent_cid:08x} not found for {path}")]
    ParentNotFound { path: String, parent_cid: u32 },

    #[error("Cyclic parent chain detected at {0}")]
    CyclicParentChain(String),

    #[error("Disk image is not ready: {0}")]
    NotReady(&'static str),

    #[error("Invalid descriptor file {path}: {reason}")]
    InvalidDescriptor { path: String, reason: String },

    #[error("Unsupported extent {extent}: {reason}")]
    UnsupportedExtent { extent: String, reason: String },

    /// The extent could not be decoded when the image was processed; its bytes are unavailable.
    #[error("Extent {extent} is unavailable: {reason}")]
    ExtentUnavailable { extent: String, reason: String },

    /// The request extended past the end of the virtual disk.
    #[error("Short read: {requested} bytes requested, {available} bytes available")]
    ShortRead { requested: u64, available: u64 },

    #[error("Read cancelled: {0}")]
    Cancelled(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Bytes produced by a read together with every non-fatal problem met while producing them.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub issues: Vec<VMDKError>,
}

impl ReadOutcome {
    /// True when the data was read without any I/O error, missing extent, missing parent or truncation.
    pub fn is_complete(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn is_short(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| matches!(issue, VMDKError::ShortRead { .. }))
    }
}
