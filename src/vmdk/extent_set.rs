//! Ordered extents partitioning the logical address space of a disk.

use std::{cmp::min, path::Path};

use log::{debug, warn};

use super::{
    control::ReadControl,
    descriptor::ExtentDeclaration,
    error::VMDKError,
    extent::{ConsumedGrain, Extent, GrainLocation},
    handles::HandlePool,
    SECTOR_SIZE,
};

/// Bytes produced by [`ExtentSet::resolve`] and the grains they came from.
#[derive(Debug, Default)]
pub struct Resolved {
    /// Zero wherever no extent data was found. Shorter than requested when the read ran past the disk end.
    pub data: Vec<u8>,
    /// Consumed grains in logical order, covering `data` without gaps or overlaps.
    pub grains: Vec<ConsumedGrain>,
}

/// Extents laid end to end: extent `n` starts at the sum of the sector counts of extents `0..n`.
#[derive(Default)]
pub struct ExtentSet {
    extents: Vec<Extent>,
}

impl ExtentSet {
    /// Opens every declared extent relative to `base_dir`.
    pub fn open(declarations: &[ExtentDeclaration], base_dir: &Path, pool: &mut HandlePool) -> Self {
        let extents = declarations
            .iter()
            .map(|declaration| Extent::open(declaration.clone(), base_dir, pool))
            .collect();
        ExtentSet { extents }
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn total_sectors(&self) -> u64 {
        self.extents
            .iter()
            .map(Extent::sector_count)
            .fold(0, u64::saturating_add)
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors().saturating_mul(SECTOR_SIZE)
    }

    /// Extents that could not be decoded, with the reason.
    pub fn unavailable(&self) -> impl Iterator<Item = (&Extent, &VMDKError)> {
        self.extents
            .iter()
            .filter_map(|extent| extent.unavailable_reason().map(|e| (extent, e)))
    }

    /// Reads `length` bytes at disk offset `offset` across as many extents as needed.
    ///
    /// When the request extends past the last extent, the data holds only the available bytes and a
    /// [`VMDKError::ShortRead`] is pushed into `issues`. Other non-fatal problems are pushed there as well.
    ///
    /// # Errors
    ///
    /// Only cancellation through `control` aborts the read.
    pub fn resolve(
        &self,
        pool: &mut HandlePool,
        offset: u64,
        length: u64,
        control: &ReadControl,
        issues: &mut Vec<VMDKError>,
    ) -> Result<Resolved, VMDKError> {
        let available = min(length, self.size_bytes().saturating_sub(offset));
        let mut data = vec![0u8; available as usize];
        let mut grains = Vec::new();
        let mut position = 0usize;
        let mut extent_start = 0u64;

        for extent in &self.extents {
            if position == data.len() {
                break;
            }
            let extent_end = extent_start.saturating_add(extent.size_bytes());
            let cursor = offset + position as u64;
            if cursor >= extent_end {
                extent_start = extent_end;
                continue;
            }
            let relative_offset = cursor - extent_start;
            let chunk = min((data.len() - position) as u64, extent_end - cursor) as usize;
            debug!(
                "Reading {} bytes from extent {} at relative offset {}",
                chunk,
                extent.name(),
                relative_offset
            );
            let located = extent.locate_data(
                pool,
                &mut data[position..position + chunk],
                relative_offset,
                cursor,
                control,
                issues,
            )?;
            grains.extend(located.grains);
            if located.remaining > 0 {
                // The grain index is shorter than the declared extent size.
                let missing = located.remaining as usize;
                warn!(
                    "Extent {} has no grain for the last {} bytes of the request within its range",
                    extent.name(),
                    missing
                );
                grains.push(ConsumedGrain {
                    disk_offset: cursor + (chunk - missing) as u64,
                    length: missing,
                    location: GrainLocation::Unavailable,
                });
                issues.push(VMDKError::ExtentUnavailable {
                    extent: extent.name().to_string(),
                    reason: format!(
                        "sparse capacity ends before the declared {} sectors",
                        extent.sector_count()
                    ),
                });
            }
            position += chunk;
            extent_start = extent_end;
        }

        if available < length {
            warn!(
                "Read of {} bytes at offset {} runs past the end of the disk, {} bytes available",
                length, offset, available
            );
            issues.push(VMDKError::ShortRead {
                requested: length,
                available,
            });
        }
        Ok(Resolved { data, grains })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmdk::{
        descriptor::{AccessMode, ExtentType},
        fixtures::{pattern, write_file, SparseFixture},
    };

    fn declaration(extent_type: ExtentType, sectors: u64, file: Option<&str>) -> ExtentDeclaration {
        ExtentDeclaration {
            access_mode: AccessMode::Rw,
            sector_count: sectors,
            extent_type,
            file_name: file.map(str::to_string),
            file_offset_sectors: 0,
        }
    }

    #[test]
    fn test_flat_extents_match_concatenation() {
        let dir = tempfile::tempdir().unwrap();
        let sizes = [3u64, 1, 4];
        let mut concatenated = Vec::new();
        let mut declarations = Vec::new();
        for (i, sectors) in sizes.iter().enumerate() {
            let name = format!("disk-f00{}.vmdk", i + 1);
            let data = pattern((*sectors * SECTOR_SIZE) as usize, i as u8 * 40);
            write_file(dir.path(), &name, &data);
            concatenated.extend_from_slice(&data);
            declarations.push(declaration(ExtentType::Flat, *sectors, Some(&name)));
        }
        let mut pool = HandlePool::new();
        let set = ExtentSet::open(&declarations, dir.path(), &mut pool);
        assert_eq!(set.size_bytes(), concatenated.len() as u64);

        let total = concatenated.len() as u64;
        for &(offset, length) in &[(0u64, total), (0, 1), (1535, 2), (1536, 512), (100, 3000), (2047, 1)] {
            let mut issues = Vec::new();
            let resolved = set
                .resolve(&mut pool, offset, length, &ReadControl::new(), &mut issues)
                .unwrap();
            assert_eq!(
                resolved.data,
                &concatenated[offset as usize..(offset + length) as usize],
                "offset {} length {}",
                offset,
                length
            );
            assert!(issues.is_empty());
            let covered: usize = resolved.grains.iter().map(|g| g.length).sum();
            assert_eq!(covered as u64, length);
        }
    }

    #[test]
    fn test_short_read_past_disk_end() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(100 * 512, 9);
        write_file(dir.path(), "disk-flat.vmdk", &data);
        let mut pool = HandlePool::new();
        let set = ExtentSet::open(
            &[declaration(ExtentType::Flat, 100, Some("disk-flat.vmdk"))],
            dir.path(),
            &mut pool,
        );

        let mut issues = Vec::new();
        let resolved = set
            .resolve(&mut pool, 99 * 512, 1024, &ReadControl::new(), &mut issues)
            .unwrap();
        assert_eq!(resolved.data, &data[99 * 512..]);
        assert!(matches!(
            issues.as_slice(),
            [VMDKError::ShortRead {
                requested: 1024,
                available: 512
            }]
        ));

        let mut issues = Vec::new();
        let resolved = set
            .resolve(&mut pool, 200 * 512, 10, &ReadControl::new(), &mut issues)
            .unwrap();
        assert!(resolved.data.is_empty());
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_mixed_extents_with_capacity_shorter_than_declared() {
        let dir = tempfile::tempdir().unwrap();
        let grain = 8 * 512;
        let mut fixture = SparseFixture::new(16, 8, 4);
        fixture.set_grain(0, pattern(grain, 5));
        write_file(dir.path(), "disk-s001.vmdk", &fixture.build().0);
        let flat = pattern(512, 6);
        write_file(dir.path(), "disk-f002.vmdk", &flat);

        let mut pool = HandlePool::new();
        let set = ExtentSet::open(
            &[
                // The sparse file only holds 16 sectors.
                declaration(ExtentType::Sparse, 24, Some("disk-s001.vmdk")),
                declaration(ExtentType::Zero, 2, None),
                declaration(ExtentType::Flat, 1, Some("disk-f002.vmdk")),
            ],
            dir.path(),
            &mut pool,
        );
        assert_eq!(set.unavailable().count(), 0);

        let mut issues = Vec::new();
        let resolved = set
            .resolve(&mut pool, 0, set.size_bytes(), &ReadControl::new(), &mut issues)
            .unwrap();
        assert_eq!(&resolved.data[..grain], pattern(grain, 5).as_slice());
        assert!(resolved.data[grain..26 * 512].iter().all(|&b| b == 0));
        assert_eq!(&resolved.data[26 * 512..], flat.as_slice());
        let locations: Vec<GrainLocation> = resolved.grains.iter().map(|g| g.location).collect();
        assert_eq!(
            locations,
            vec![
                GrainLocation::Allocated(fixture.header().over_head * SECTOR_SIZE),
                GrainLocation::Unallocated,
                GrainLocation::Unavailable,
                GrainLocation::Zero,
                GrainLocation::Allocated(0),
            ]
        );
        assert!(matches!(
            issues.as_slice(),
            [VMDKError::ExtentUnavailable { .. }]
        ));
    }
}
