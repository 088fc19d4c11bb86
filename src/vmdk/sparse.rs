//! Sparse extent file header.
//!
//! See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#41-file-header

use serde::Serialize;

use super::{error::VMDKError, SECTOR_SIZE};

/// Size of the on-disk sparse header, padding included.
pub const SPARSE_HEADER_SIZE: usize = 512;
/// "KDMV" read as a little-endian u32.
pub const SPARSE_MAGIC_NUMBER: u32 = 0x564d444b;
pub const SPARSE_MAGIC_BYTES: &[u8; 4] = b"KDMV";

// Flags used in sparse extent file headers.
pub const FLAG_VALID_NEWLINE_DETECTION_TEST: u32 = 0x00000001;
pub const FLAG_USE_REDUNDANT_GRAIN_TABLE: u32 = 0x00000002;
pub const FLAG_HAS_COMPRESSED_GRAIN_DATA: u32 = 0x00010000;
pub const FLAG_HAS_METADATA: u32 = 0x00020000;

/// `gdOffset` value used by stream-optimized extents whose directory lives in the footer.
pub const GD_AT_END: u64 = u64::MAX;

/// Decoded 512-byte sparse extent header.
///
/// Sector fields are expressed in 512-byte units.
///
/// See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#41-file-header
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SparseHeader {
    /// "KDMV" read as a little-endian u32
    pub magic_number: u32,
    /// Version of the VMDK sparse format, 1, 2 or 3
    pub version: u32,
    /// Flags, see the `FLAG_*` constants
    pub flags: u32,
    /// Maximum data number of sectors
    pub capacity: u64,
    /// Grain number of sectors
    /// Usually a power of 2, 128 for disks created by VMware
    pub grain_size: u64,
    /// The sector number of the embedded descriptor file, or 0 if not set.
    pub descriptor_offset: u64,
    /// The number of sectors of the embedded descriptor in the extent data file.
    pub descriptor_size: u64,
    /// The number of grain table entries
    pub num_gtes_per_gt: u32,
    /// Secondary (redundant) grain directory sector number
    /// The value is relative from the start of the file or 0 if not set.
    pub rgd_offset: u64,
    /// Grain directory sector number
    /// The value is relative from the start of the file. -1 (see [`GD_AT_END`]) when the directory is in the footer.
    pub gd_offset: u64,
    /// Metadata (overhead) number of sectors, read in one go to decode the grain index.
    pub over_head: u64,
    /// Is dirty
    /// Value to determine if the extent data file was cleanly closed.
    pub unclean_shutdown: bool,
    /// Newline detection characters: '\n', ' ', '\r' and '\n'
    pub single_end_line_char: u8,
    pub non_end_line_char: u8,
    pub double_end_line_char1: u8,
    pub double_end_line_char2: u8,
    /// Compression method, 0 for none and 1 for deflate
    pub compress_algorithm: u16,
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl SparseHeader {
    /// Decodes a sparse header from the first 512 bytes of an extent file.
    ///
    /// `extent` only names the file in the returned error.
    ///
    /// # Errors
    ///
    /// Returns [`VMDKError::MalformedHeader`] when fewer than 512 bytes are given, when the magic number is wrong,
    /// when `capacity` is not an exact multiple of a non-zero `grainSize`, or when either does not fit in bytes.
    pub fn decode(extent: &str, header_data: &[u8]) -> Result<Self, VMDKError> {
        let malformed = |reason: String| VMDKError::MalformedHeader {
            extent: extent.to_string(),
            reason,
        };
        if header_data.len() < SPARSE_HEADER_SIZE {
            return Err(malformed(format!(
                "header is {} bytes long, expected {}",
                header_data.len(),
                SPARSE_HEADER_SIZE
            )));
        }
        let header = Self {
            magic_number: le_u32(header_data, 0),
            version: le_u32(header_data, 4),
            flags: le_u32(header_data, 8),
            capacity: le_u64(header_data, 12),
            grain_size: le_u64(header_data, 20),
            descriptor_offset: le_u64(header_data, 28),
            descriptor_size: le_u64(header_data, 36),
            num_gtes_per_gt: le_u32(header_data, 44),
            rgd_offset: le_u64(header_data, 48),
            gd_offset: le_u64(header_data, 56),
            over_head: le_u64(header_data, 64),
            unclean_shutdown: header_data[72] != 0,
            single_end_line_char: header_data[73],
            non_end_line_char: header_data[74],
            double_end_line_char1: header_data[75],
            double_end_line_char2: header_data[76],
            compress_algorithm: u16::from_le_bytes([header_data[77], header_data[78]]),
        };
        if header.magic_number != SPARSE_MAGIC_NUMBER {
            return Err(malformed(format!(
                "invalid magic number {:#010x}",
                header.magic_number
            )));
        }
        if header.grain_size == 0 {
            return Err(malformed("grain size is zero".to_string()));
        }
        if header.num_gtes_per_gt == 0 {
            return Err(malformed("grain tables have no entries".to_string()));
        }
        if header.grain_size.checked_mul(SECTOR_SIZE).is_none()
            || header.capacity.checked_mul(SECTOR_SIZE).is_none()
        {
            return Err(malformed(format!(
                "capacity {} or grain size {} overflows in bytes",
                header.capacity, header.grain_size
            )));
        }
        if header.capacity % header.grain_size != 0 {
            return Err(malformed(format!(
                "capacity {} is not a multiple of grain size {}",
                header.capacity, header.grain_size
            )));
        }
        Ok(header)
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Number of logical grains covered by the extent.
    pub fn grain_count(&self) -> u64 {
        self.capacity / self.grain_size
    }

    pub fn has_compressed_grains(&self) -> bool {
        self.flags & FLAG_HAS_COMPRESSED_GRAIN_DATA == FLAG_HAS_COMPRESSED_GRAIN_DATA
    }

    pub fn has_embedded_descriptor(&self) -> bool {
        self.descriptor_offset != 0 && self.descriptor_size != 0
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> [u8; SPARSE_HEADER_SIZE] {
        let mut data = [0u8; SPARSE_HEADER_SIZE];
        data[0..4].copy_from_slice(&self.magic_number.to_le_bytes());
        data[4..8].copy_from_slice(&self.version.to_le_bytes());
        data[8..12].copy_from_slice(&self.flags.to_le_bytes());
        data[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        data[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        data[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        data[36..44].copy_from_slice(&self.descriptor_size.to_le_bytes());
        data[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        data[48..56].copy_from_slice(&self.rgd_offset.to_le_bytes());
        data[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        data[64..72].copy_from_slice(&self.over_head.to_le_bytes());
        data[72] = self.unclean_shutdown as u8;
        data[73] = self.single_end_line_char;
        data[74] = self.non_end_line_char;
        data[75] = self.double_end_line_char1;
        data[76] = self.double_end_line_char2;
        data[77..79].copy_from_slice(&self.compress_algorithm.to_le_bytes());
        data
    }
}
