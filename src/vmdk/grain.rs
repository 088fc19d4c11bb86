//! Flattening of the grain directory and grain tables of a sparse extent.
//!
//! The grain directory holds the sector offsets of the grain tables, each grain table holds the sector offsets of
//! `numGTEsPerGT` grains. Both levels are collapsed here into one entry per logical grain.

use log::debug;

use super::{error::VMDKError, sparse::SparseHeader, SECTOR_SIZE};

const ENTRY_SIZE: u64 = 4;

/// Physical sector offset of every logical grain of a sparse extent, in logical order.
///
/// An entry of 0 marks an unallocated grain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GrainOffsets(Vec<u32>);

fn read_entry(extent: &str, overhead: &[u8], position: u64) -> Result<u32, VMDKError> {
    let start = usize::try_from(position).ok();
    let bytes = start
        .and_then(|start| overhead.get(start..start.checked_add(ENTRY_SIZE as usize)?))
        .ok_or_else(|| VMDKError::TruncatedIndex {
            extent: extent.to_string(),
            reason: format!(
                "entry at buffer offset {} is outside the {} bytes metadata region",
                position,
                overhead.len()
            ),
        })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl GrainOffsets {
    /// Builds the grain offsets from the metadata region read at `gdOffset`.
    ///
    /// `overhead` must start at byte `gdOffset * 512` of the extent file; grain table positions are translated
    /// relative to it. A grain directory entry of 0 means the whole grain table is unallocated.
    ///
    /// # Errors
    ///
    /// Returns [`VMDKError::TruncatedIndex`] if the directory and grain tables cannot fit in `overhead` or an entry
    /// falls outside it, and [`VMDKError::MalformedHeader`] if the header geometry overflows.
    pub fn build(extent: &str, header: &SparseHeader, overhead: &[u8]) -> Result<Self, VMDKError> {
        let truncated = |reason: &str| VMDKError::TruncatedIndex {
            extent: extent.to_string(),
            reason: reason.to_string(),
        };
        let malformed = |reason: &str| VMDKError::MalformedHeader {
            extent: extent.to_string(),
            reason: reason.to_string(),
        };
        let grain_count = header.grain_count();
        let gtes_per_gt = u64::from(header.num_gtes_per_gt);
        let gt_coverage = gtes_per_gt
            .checked_mul(header.grain_size)
            .ok_or_else(|| malformed("grain table coverage overflows"))?;
        let gd_entries = header.capacity.div_ceil(gt_coverage);
        let gd_start = header
            .gd_offset
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| truncated("grain directory offset overflows"))?;
        // The directory and every grain table it can point to live in the metadata region, which bounds the
        // number of grains decoded here.
        let gd_bytes = gd_entries
            .checked_mul(ENTRY_SIZE)
            .ok_or_else(|| truncated("grain directory size overflows"))?;
        let gt_bytes = gd_entries
            .checked_mul(gtes_per_gt)
            .and_then(|entries| entries.checked_mul(ENTRY_SIZE))
            .ok_or_else(|| truncated("grain tables size overflows"))?;
        let region = overhead.len() as u64;
        if gd_bytes > region || gt_bytes > region {
            return Err(VMDKError::TruncatedIndex {
                extent: extent.to_string(),
                reason: format!(
                    "{} grain directory entries of {} grains each do not fit in the {} bytes metadata region",
                    gd_entries, gtes_per_gt, region
                ),
            });
        }
        let mut offsets = Vec::with_capacity(grain_count as usize);
        for gd_entry in 0..gd_entries {
            let gt_offset = read_entry(extent, overhead, gd_entry * ENTRY_SIZE)?;
            let remaining = grain_count - offsets.len() as u64;
            let entries = gtes_per_gt.min(remaining);
            if gt_offset == 0 {
                offsets.extend(std::iter::repeat(0).take(entries as usize));
                continue;
            }
            let gt_start = (u64::from(gt_offset) * SECTOR_SIZE)
                .checked_sub(gd_start)
                .ok_or_else(|| truncated("grain table located before the grain directory"))?;
            for gt_entry in 0..entries {
                offsets.push(read_entry(
                    extent,
                    overhead,
                    gt_start + gt_entry * ENTRY_SIZE,
                )?);
            }
        }
        Ok(GrainOffsets(offsets))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sector offset of the given logical grain.
    pub fn get(&self, grain: usize) -> Option<u32> {
        self.0.get(grain).copied()
    }

    pub fn allocated_count(&self) -> usize {
        self.0.iter().filter(|&&offset| offset != 0).count()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmdk::fixtures::{sample_header, SparseFixture};

    fn overhead_of(image: &[u8], header: &SparseHeader) -> Vec<u8> {
        let start = (header.gd_offset * SECTOR_SIZE) as usize;
        let end = (start + (header.over_head * SECTOR_SIZE) as usize).min(image.len());
        image[start..end].to_vec()
    }

    #[test]
    fn test_build_matches_fixture_layout() {
        let mut fixture = SparseFixture::new(1024, 16, 8);
        fixture.set_grain(0, vec![0x11; 16 * 512]);
        fixture.set_grain(5, vec![0x22; 16 * 512]);
        fixture.set_grain(63, vec![0x33; 16 * 512]);
        let (image, expected) = fixture.build();
        let header = fixture.header();

        let offsets = GrainOffsets::build("fixture.vmdk", &header, &overhead_of(&image, &header)).unwrap();
        assert_eq!(offsets.len() as u64, header.capacity / header.grain_size);
        assert_eq!(offsets.as_slice(), expected.as_slice());
        assert_eq!(offsets.allocated_count(), 3);
        assert_eq!(offsets.get(1), Some(0));
        assert_ne!(offsets.get(5), Some(0));
    }

    #[test]
    fn test_build_partial_last_grain_table() {
        // 10 grains with 4 entries per table: the third table is only half used.
        let mut fixture = SparseFixture::new(10 * 8, 8, 4);
        fixture.set_grain(9, vec![0x44; 8 * 512]);
        let (image, expected) = fixture.build();
        let header = fixture.header();

        let offsets = GrainOffsets::build("fixture.vmdk", &header, &overhead_of(&image, &header)).unwrap();
        assert_eq!(offsets.len(), 10);
        assert_eq!(offsets.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_build_unallocated_grain_table() {
        let header = sample_header(64, 8, 4);
        // Grain directory with two entries, both unallocated.
        let overhead = vec![0u8; (header.over_head * SECTOR_SIZE) as usize];
        let offsets = GrainOffsets::build("empty.vmdk", &header, &overhead).unwrap();
        assert_eq!(offsets.len(), 8);
        assert_eq!(offsets.allocated_count(), 0);
    }

    #[test]
    fn test_build_truncated_region() {
        let mut fixture = SparseFixture::new(1024, 16, 8);
        fixture.set_grain(0, vec![0x11; 16 * 512]);
        let (image, _) = fixture.build();
        let header = fixture.header();
        let overhead = overhead_of(&image, &header);

        let err = GrainOffsets::build("fixture.vmdk", &header, &overhead[..600]).unwrap_err();
        assert!(matches!(err, VMDKError::TruncatedIndex { .. }));
        let err = GrainOffsets::build("fixture.vmdk", &header, &overhead[..2]).unwrap_err();
        assert!(matches!(err, VMDKError::TruncatedIndex { .. }));
    }

    #[test]
    fn test_build_rejects_capacity_beyond_metadata_region() {
        let mut header = sample_header(64, 8, 4);
        let overhead = vec![0u8; (header.over_head * SECTOR_SIZE) as usize];
        header.grain_size = 1;
        header.capacity = 1 << 50;
        let err = GrainOffsets::build("huge.vmdk", &header, &overhead).unwrap_err();
        assert!(matches!(err, VMDKError::TruncatedIndex { .. }));

        header.num_gtes_per_gt = u32::MAX;
        header.grain_size = 1 << 40;
        header.capacity = 1 << 40;
        let err = GrainOffsets::build("huge.vmdk", &header, &overhead).unwrap_err();
        assert!(matches!(err, VMDKError::MalformedHeader { .. }));
    }
}
