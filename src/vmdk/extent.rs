//! Extent files of a virtual disk and the translation of extent-relative offsets into file reads.

use std::{
    cmp::min,
    io,
    path::{Path, PathBuf},
};

use log::{debug, error, warn};
use serde::Serialize;

use super::{
    control::ReadControl,
    descriptor::{ExtentDeclaration, ExtentType},
    error::VMDKError,
    grain::GrainOffsets,
    handles::HandlePool,
    sparse::{SparseHeader, GD_AT_END, SPARSE_HEADER_SIZE},
    SECTOR_SIZE,
};

/// Where the bytes of a consumed chunk come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum GrainLocation {
    /// Stored in the extent file, at this byte offset.
    Allocated(u64),
    /// Not allocated in this image: zero in a base image, deferred to the parent in a snapshot.
    Unallocated,
    /// Part of a ZERO extent.
    Zero,
    /// Part of an extent that could not be decoded; the bytes are zero-filled.
    Unavailable,
}

/// A chunk of a read, at most one grain long, in the order it was produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumedGrain {
    /// Absolute byte offset of the chunk on the virtual disk.
    pub disk_offset: u64,
    pub length: usize,
    pub location: GrainLocation,
}

impl ConsumedGrain {
    pub fn is_allocated(&self) -> bool {
        matches!(self.location, GrainLocation::Allocated(_))
    }
}

/// Result of [`Extent::locate_data`].
#[derive(Debug, Default)]
pub struct LocatedData {
    /// Bytes of the request this extent could not provide.
    pub remaining: u64,
    pub grains: Vec<ConsumedGrain>,
}

/// Decoded metadata of a sparse extent.
#[derive(Clone, Debug)]
pub struct SparseIndex {
    pub header: SparseHeader,
    pub grain_offsets: GrainOffsets,
}

enum ExtentData {
    Flat,
    Zero,
    Sparse(SparseIndex),
    /// Decoding failed when the image was processed.
    Unavailable(VMDKError),
}

/// One extent of a disk image.
pub struct Extent {
    declaration: ExtentDeclaration,
    /// Name used in logs and errors.
    name: String,
    /// Resolved path of the backing file, if the extent has one.
    path: Option<PathBuf>,
    data: ExtentData,
}

impl Extent {
    /// Resolves the backing file of `declaration` relative to `base_dir` and decodes its metadata.
    ///
    /// This never fails: an extent whose header or grain index cannot be decoded is kept in an unavailable
    /// state so the remaining extents of the disk stay readable. See [`Extent::unavailable_reason`].
    pub fn open(declaration: ExtentDeclaration, base_dir: &Path, pool: &mut HandlePool) -> Extent {
        let name = declaration
            .file_name
            .clone()
            .unwrap_or_else(|| format!("<{:?} extent>", declaration.extent_type));
        let path = declaration.file_name.as_ref().map(|f| base_dir.join(f));
        let data = match Self::load(&declaration, &name, path.as_deref(), pool) {
            Ok(data) => data,
            Err(e) => {
                warn!("Extent {} is unusable: {}", name, e);
                ExtentData::Unavailable(e)
            }
        };
        Extent {
            declaration,
            name,
            path,
            data,
        }
    }

    fn load(
        declaration: &ExtentDeclaration,
        name: &str,
        path: Option<&Path>,
        pool: &mut HandlePool,
    ) -> Result<ExtentData, VMDKError> {
        let unsupported = |reason: String| VMDKError::UnsupportedExtent {
            extent: name.to_string(),
            reason,
        };
        match declaration.extent_type {
            ExtentType::Zero => Ok(ExtentData::Zero),
            ExtentType::Flat | ExtentType::Vmfs => {
                let path = path.ok_or_else(|| unsupported("flat extent without a file name".into()))?;
                pool.checkout(path)?;
                Ok(ExtentData::Flat)
            }
            ExtentType::Sparse => {
                let path =
                    path.ok_or_else(|| unsupported("sparse extent without a file name".into()))?;
                Ok(ExtentData::Sparse(Self::load_sparse_index(name, path, pool)?))
            }
            other => Err(unsupported(format!("{:?} extents are not supported", other))),
        }
    }

    /// Reads the sparse header and the metadata region, then flattens the grain index.
    fn load_sparse_index(
        name: &str,
        path: &Path,
        pool: &mut HandlePool,
    ) -> Result<SparseIndex, VMDKError> {
        let io_error = |offset: u64, cause: io::Error| VMDKError::IoRead {
            extent: name.to_string(),
            offset,
            cause,
        };
        let file = pool.checkout(path)?;
        let mut header_data = [0u8; SPARSE_HEADER_SIZE];
        let read = file
            .read_at(&mut header_data, 0)
            .map_err(|e| io_error(0, e))?;
        let header = SparseHeader::decode(name, &header_data[..read])?;
        debug!("Parsed sparse header of {}: {:?}", name, header);

        if header.has_compressed_grains() {
            return Err(VMDKError::UnsupportedExtent {
                extent: name.to_string(),
                reason: "compressed grains are not supported".to_string(),
            });
        }
        if header.gd_offset == GD_AT_END {
            return Err(VMDKError::UnsupportedExtent {
                extent: name.to_string(),
                reason: "grain directory stored in the footer is not supported".to_string(),
            });
        }
        let malformed = |reason: &str| VMDKError::MalformedHeader {
            extent: name.to_string(),
            reason: reason.to_string(),
        };
        let gd_start = header
            .gd_offset
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| malformed("grain directory offset overflows"))?;
        let overhead_size = header
            .over_head
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| malformed("metadata size overflows"))?;
        // The metadata region may run past the end of a file holding few grains.
        let available = file.size()?.saturating_sub(gd_start);
        let mut overhead = vec![0u8; min(overhead_size, available) as usize];
        let read = file
            .read_at(&mut overhead, gd_start)
            .map_err(|e| io_error(gd_start, e))?;
        overhead.truncate(read);

        let grain_offsets = GrainOffsets::build(name, &header, &overhead)?;
        debug!(
            "{}: {} grains, {} allocated",
            name,
            grain_offsets.len(),
            grain_offsets.allocated_count()
        );
        Ok(SparseIndex {
            header,
            grain_offsets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn declaration(&self) -> &ExtentDeclaration {
        &self.declaration
    }

    pub fn extent_type(&self) -> ExtentType {
        self.declaration.extent_type
    }

    pub fn sector_count(&self) -> u64 {
        self.declaration.sector_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.declaration.sector_count.saturating_mul(SECTOR_SIZE)
    }

    pub fn sparse_index(&self) -> Option<&SparseIndex> {
        match self.data {
            ExtentData::Sparse(ref index) => Some(index),
            _ => None,
        }
    }

    /// The decoding error that made this extent unusable, if any.
    pub fn unavailable_reason(&self) -> Option<&VMDKError> {
        match self.data {
            ExtentData::Unavailable(ref e) => Some(e),
            _ => None,
        }
    }

    /// Positioned read on the extent file.
    ///
    /// Reads are best effort: on a short read or an I/O failure the bytes obtained so far stay in `buf`,
    /// the error is logged and returned so the caller can report it alongside the data.
    pub fn read_at(
        &self,
        pool: &mut HandlePool,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), VMDKError> {
        let io_error = |cause: io::Error| VMDKError::IoRead {
            extent: self.name.clone(),
            offset,
            cause,
        };
        let err = match self.path.as_deref() {
            Some(path) => match pool.checkout(path).and_then(|file| file.read_at(buf, offset)) {
                Ok(read) if read == buf.len() => return Ok(()),
                Ok(read) => io_error(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read, {} of {} bytes", read, buf.len()),
                )),
                Err(cause) => io_error(cause),
            },
            None => io_error(io::Error::new(
                io::ErrorKind::NotFound,
                "extent has no backing file",
            )),
        };
        error!("{}", err);
        Err(err)
    }

    /// Fills `dest` with the extent data found at `relative_offset` bytes from the start of the extent.
    ///
    /// `disk_offset` is the absolute disk offset of `dest[0]`, recorded in the returned grains. Unallocated
    /// grains of a sparse extent are left as they are in `dest` and reported as [`GrainLocation::Unallocated`]
    /// at their exact position, so a snapshot can fill them from its parent. Reading stops early when the grain
    /// index is exhausted; the unfilled length is returned in [`LocatedData::remaining`].
    ///
    /// I/O failures do not abort the read, they are pushed into `issues`.
    pub fn locate_data(
        &self,
        pool: &mut HandlePool,
        dest: &mut [u8],
        relative_offset: u64,
        disk_offset: u64,
        control: &ReadControl,
        issues: &mut Vec<VMDKError>,
    ) -> Result<LocatedData, VMDKError> {
        control.check()?;
        let length = dest.len();
        let whole = |location: GrainLocation| LocatedData {
            remaining: 0,
            grains: vec![ConsumedGrain {
                disk_offset,
                length,
                location,
            }],
        };
        match self.data {
            ExtentData::Flat => {
                // Bounded when the declaration is parsed.
                let file_offset = (self.declaration.file_offset_sectors * SECTOR_SIZE)
                    .saturating_add(relative_offset);
                let located = whole(GrainLocation::Allocated(file_offset));
                if let Err(e) = self.read_at(pool, dest, file_offset) {
                    issues.push(e);
                }
                Ok(located)
            }
            ExtentData::Zero => {
                let located = whole(GrainLocation::Zero);
                dest.fill(0);
                Ok(located)
            }
            ExtentData::Unavailable(ref e) => {
                let located = whole(GrainLocation::Unavailable);
                dest.fill(0);
                issues.push(VMDKError::ExtentUnavailable {
                    extent: self.name.clone(),
                    reason: e.to_string(),
                });
                Ok(located)
            }
            ExtentData::Sparse(ref index) => {
                self.locate_sparse(index, pool, dest, relative_offset, disk_offset, control, issues)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn locate_sparse(
        &self,
        index: &SparseIndex,
        pool: &mut HandlePool,
        dest: &mut [u8],
        relative_offset: u64,
        disk_offset: u64,
        control: &ReadControl,
        issues: &mut Vec<VMDKError>,
    ) -> Result<LocatedData, VMDKError> {
        let grain_size = index.header.grain_size_bytes();
        let mut grain_id = relative_offset / grain_size;
        let mut offset_within_grain = relative_offset % grain_size;
        let mut written = 0usize;
        let mut grains = Vec::new();

        while written < dest.len() {
            control.check()?;
            let Some(sector) = usize::try_from(grain_id)
                .ok()
                .and_then(|grain| index.grain_offsets.get(grain))
            else {
                debug!("{}: grain index exhausted at grain {}", self.name, grain_id);
                break;
            };
            let grain_offset = u64::from(sector) * SECTOR_SIZE;
            let chunk = min(
                (dest.len() - written) as u64,
                grain_size - offset_within_grain,
            ) as usize;
            let location = if grain_offset != 0 {
                let chunk_dest = &mut dest[written..written + chunk];
                if let Err(e) = self.read_at(pool, chunk_dest, grain_offset + offset_within_grain) {
                    issues.push(e);
                }
                GrainLocation::Allocated(grain_offset)
            } else {
                GrainLocation::Unallocated
            };
            grains.push(ConsumedGrain {
                disk_offset: disk_offset + written as u64,
                length: chunk,
                location,
            });
            written += chunk;
            grain_id += 1;
            offset_within_grain = 0;
        }
        Ok(LocatedData {
            remaining: (dest.len() - written) as u64,
            grains,
        })
    }
}
