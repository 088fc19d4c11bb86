//! Disk images and copy-on-write resolution across snapshot chains.

use std::{
    collections::HashSet,
    fs,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use super::{
    control::ReadControl,
    descriptor::{Descriptor, DescriptorHeader},
    error::{ReadOutcome, VMDKError},
    extent::GrainLocation,
    extent_set::ExtentSet,
    handles::HandlePool,
    sparse::{SparseHeader, SPARSE_HEADER_SIZE, SPARSE_MAGIC_BYTES},
    SECTOR_SIZE,
};
use crate::raw::RAW;

/// Text descriptors larger than this are not considered when looking for a parent.
const MAX_DESCRIPTOR_FILE_SIZE: u64 = 64 * 1024;

/// Lifecycle of a [`DiskImage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Uninitialized,
    HeaderLoaded,
    ExtentsResolved,
    ParentLinked,
    NoParent,
}

/// Reads the descriptor at `path`, either a text file or the descriptor embedded in a monolithic sparse file.
///
/// Returns the descriptor and whether it was embedded.
fn read_descriptor(path: &Path, max_text_size: Option<u64>) -> Result<(Descriptor, bool), VMDKError> {
    let invalid = |reason: String| VMDKError::InvalidDescriptor {
        path: path.display().to_string(),
        reason,
    };
    let mut file = RAW::new(path)?;
    let mut header_data = [0u8; SPARSE_HEADER_SIZE];
    let read = file.read_at(&mut header_data, 0)?;

    if read >= SPARSE_MAGIC_BYTES.len() && &header_data[..4] == SPARSE_MAGIC_BYTES {
        debug!("Monolithic sparse VMDK detected, extracting the embedded descriptor");
        let name = path.display().to_string();
        let header = SparseHeader::decode(&name, &header_data[..read])?;
        if !header.has_embedded_descriptor() {
            return Err(invalid("sparse extent without an embedded descriptor".to_string()));
        }
        let (Some(offset), Some(size)) = (
            header.descriptor_offset.checked_mul(SECTOR_SIZE),
            header.descriptor_size.checked_mul(SECTOR_SIZE),
        ) else {
            return Err(invalid("embedded descriptor location overflows".to_string()));
        };
        if size > file.size()? {
            return Err(invalid("embedded descriptor is larger than the file".to_string()));
        }
        let mut buffer = vec![0u8; size as usize];
        let read = file.read_at(&mut buffer, offset)?;
        buffer.truncate(read);
        let descriptor: Descriptor = String::from_utf8_lossy(&buffer).parse().map_err(invalid)?;
        return Ok((descriptor, true));
    }

    if let Some(max) = max_text_size {
        if file.size()? > max {
            return Err(invalid(format!("larger than {} bytes", max)));
        }
    }
    let contents = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let descriptor: Descriptor = contents.parse().map_err(invalid)?;
    Ok((descriptor, false))
}

/// A VMDK virtual disk, optionally layered on top of the parent image it was snapshotted from.
pub struct DiskImage {
    path: PathBuf,
    state: ImageState,
    descriptor: Option<Descriptor>,
    extents: ExtentSet,
    handles: HandlePool,
    /// The parent this image defers unallocated grains to.
    parent: Option<Box<DiskImage>>,
    /// Cursor used by the `Read` and `Seek` implementations.
    position: u64,
}

impl DiskImage {
    /// Creates an image for the descriptor at `path`. Nothing is read until [`DiskImage::process`].
    pub fn new<P: AsRef<Path>>(path: P) -> DiskImage {
        DiskImage {
            path: path.as_ref().to_path_buf(),
            state: ImageState::Uninitialized,
            descriptor: None,
            extents: ExtentSet::default(),
            handles: HandlePool::new(),
            parent: None,
            position: 0,
        }
    }

    /// Opens, processes and links the whole snapshot chain of the image at `path`.
    ///
    /// A parent that cannot be found is not fatal: it is logged, and every read deferring to it reports
    /// [`VMDKError::ParentNotFound`].
    ///
    /// # Errors
    ///
    /// Errors if the descriptor of the image or of one of its ancestors is invalid, or if the chain loops.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DiskImage, VMDKError> {
        let mut image = DiskImage::new(path);
        image.process()?;
        match image.resolve_parent_chain() {
            Ok(()) => {}
            Err(e @ VMDKError::ParentNotFound { .. }) => warn!("{}", e),
            Err(e) => return Err(e),
        }
        Ok(image)
    }

    /// Loads the descriptor header and opens the extents.
    ///
    /// Extents that cannot be decoded do not make this fail; they are logged and reported by reads touching them.
    ///
    /// # Errors
    ///
    /// Errors if the descriptor cannot be read or parsed.
    pub fn process(&mut self) -> Result<(), VMDKError> {
        debug!("Opening and reading VMDK descriptor file: {}", self.path.display());
        let (mut descriptor, embedded) = read_descriptor(&self.path, None)?;
        if embedded && descriptor.extents.len() == 1 {
            // The embedded extent line may name the file differently from the file we opened.
            if let Some(file_name) = self.path.file_name() {
                descriptor.extents[0].file_name = Some(file_name.to_string_lossy().into_owned());
            }
        }
        debug!("Parsed descriptor: {:?}", descriptor);
        self.descriptor = Some(descriptor);
        self.state = ImageState::HeaderLoaded;

        let base_dir = self.base_dir();
        let declarations = self
            .descriptor
            .as_ref()
            .map(|d| d.extents.clone())
            .unwrap_or_default();
        self.extents = ExtentSet::open(&declarations, &base_dir, &mut self.handles);
        for (extent, e) in self.extents.unavailable() {
            warn!("Extent {} of {} is unavailable: {}", extent.name(), self.path.display(), e);
        }
        self.state = ImageState::ExtentsResolved;
        Ok(())
    }

    fn base_dir(&self) -> PathBuf {
        self.path.parent().unwrap_or(Path::new("")).to_path_buf()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    pub fn header(&self) -> Option<&DescriptorHeader> {
        self.descriptor.as_ref().map(|d| &d.header)
    }

    pub fn extents(&self) -> &ExtentSet {
        &self.extents
    }

    pub fn parent(&self) -> Option<&DiskImage> {
        self.parent.as_deref()
    }

    /// Number of linked ancestors.
    pub fn chain_depth(&self) -> usize {
        self.parent.as_ref().map_or(0, |p| 1 + p.chain_depth())
    }

    fn is_resolved(&self) -> bool {
        matches!(
            self.state,
            ImageState::ExtentsResolved | ImageState::ParentLinked | ImageState::NoParent
        )
    }

    /// Virtual disk size in bytes, as declared by the extents.
    pub fn get_virtual_disk_size_bytes(&self) -> Result<u64, VMDKError> {
        if !self.is_resolved() {
            return Err(VMDKError::NotReady("extents are not resolved"));
        }
        Ok(self.extents.size_bytes())
    }

    pub fn get_sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    /// True when the descriptor names a parent content identifier.
    pub fn has_parent(&self) -> bool {
        self.header().is_some_and(DescriptorHeader::has_parent)
    }

    /// Looks for the parent image next to this one.
    ///
    /// `parentFileNameHint` is tried first, then every `*.vmdk` file of the directory. A candidate matches when
    /// the CID of its descriptor equals the `parentCID` of this image. The returned image is not processed.
    ///
    /// # Errors
    ///
    /// [`VMDKError::NotReady`] before the header is loaded, [`VMDKError::ParentNotFound`] if no candidate matches.
    pub fn locate_parent(&self) -> Result<DiskImage, VMDKError> {
        let header = self
            .header()
            .ok_or(VMDKError::NotReady("descriptor header is not loaded"))?;
        let not_found = || VMDKError::ParentNotFound {
            path: self.path.display().to_string(),
            parent_cid: header.parent_cid,
        };
        if !header.has_parent() {
            return Err(not_found());
        }
        let base_dir = self.base_dir();
        let mut candidates = Vec::new();
        if let Some(ref hint) = header.parent_file_name_hint {
            candidates.push(base_dir.join(hint));
            // Hints often hold an absolute path from the machine that created the snapshot.
            if let Some(file_name) = Path::new(hint).file_name() {
                candidates.push(base_dir.join(file_name));
            }
        }
        let pattern = glob::Pattern::escape(&base_dir.to_string_lossy());
        let pattern = Path::new(&pattern).join("*.vmdk");
        match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => candidates.extend(paths.filter_map(Result::ok)),
            Err(e) => warn!("Unable to list {}: {}", base_dir.display(), e),
        }

        for candidate in candidates {
            if candidate == self.path || !candidate.is_file() {
                continue;
            }
            match read_descriptor(&candidate, Some(MAX_DESCRIPTOR_FILE_SIZE)) {
                Ok((descriptor, _)) if descriptor.header.cid == header.parent_cid => {
                    info!(
                        "Parent of {} located: {}",
                        self.path.display(),
                        candidate.display()
                    );
                    return Ok(DiskImage::new(candidate));
                }
                Ok(_) => {}
                Err(e) => debug!("Skipping parent candidate {}: {}", candidate.display(), e),
            }
        }
        Err(not_found())
    }

    /// Locates, processes and links every ancestor of this image.
    ///
    /// When an ancestor cannot be found, the images found so far stay linked and
    /// [`VMDKError::ParentNotFound`] is returned.
    ///
    /// # Errors
    ///
    /// Also fails with [`VMDKError::CyclicParentChain`] when an image of the chain is met twice.
    pub fn resolve_parent_chain(&mut self) -> Result<(), VMDKError> {
        let mut visited = HashSet::new();
        visited.insert(fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone()));
        self.link_parent_chain(&mut visited)
    }

    fn link_parent_chain(&mut self, visited: &mut HashSet<PathBuf>) -> Result<(), VMDKError> {
        if !self.is_resolved() {
            return Err(VMDKError::NotReady("extents are not resolved"));
        }
        if !self.has_parent() {
            self.state = ImageState::NoParent;
            return Ok(());
        }
        let mut parent = match self.locate_parent() {
            Ok(parent) => parent,
            Err(e) => {
                self.state = ImageState::NoParent;
                return Err(e);
            }
        };
        let key = fs::canonicalize(parent.path()).unwrap_or_else(|_| parent.path().to_path_buf());
        if !visited.insert(key) {
            return Err(VMDKError::CyclicParentChain(parent.path().display().to_string()));
        }
        parent.process()?;
        let chain = parent.link_parent_chain(visited);
        if matches!(chain, Ok(()) | Err(VMDKError::ParentNotFound { .. })) {
            self.parent = Some(Box::new(parent));
            self.state = ImageState::ParentLinked;
        }
        chain
    }

    /// Reads `length` bytes at `offset` of the virtual disk, resolving unallocated grains through the parent chain.
    ///
    /// # Errors
    ///
    /// [`VMDKError::NotReady`] if the image was not processed. Problems that leave the data incomplete are
    /// returned in [`ReadOutcome::issues`] instead.
    pub fn read(&mut self, offset: u64, length: u64) -> Result<ReadOutcome, VMDKError> {
        self.read_with(offset, length, &ReadControl::new())
    }

    /// Same as [`DiskImage::read`] with a deadline or cancellation flag.
    ///
    /// # Errors
    ///
    /// Also fails with [`VMDKError::Cancelled`] once `control` says so.
    pub fn read_with(
        &mut self,
        offset: u64,
        length: u64,
        control: &ReadControl,
    ) -> Result<ReadOutcome, VMDKError> {
        if !self.is_resolved() {
            return Err(VMDKError::NotReady("extents are not resolved"));
        }
        let mut issues = Vec::new();
        let resolved = self
            .extents
            .resolve(&mut self.handles, offset, length, control, &mut issues)?;
        let mut data = resolved.data;

        let deferred: Vec<_> = resolved
            .grains
            .iter()
            .filter(|grain| grain.location == GrainLocation::Unallocated)
            .collect();
        if let Some(parent) = self.parent.as_deref_mut() {
            for grain in deferred {
                control.check()?;
                let from_parent = parent.read_with(grain.disk_offset, grain.length as u64, control)?;
                let start = (grain.disk_offset - offset) as usize;
                data[start..start + from_parent.data.len()].copy_from_slice(&from_parent.data);
                // A parent smaller than its child leaves the remainder zero.
                issues.extend(
                    from_parent
                        .issues
                        .into_iter()
                        .filter(|issue| !matches!(issue, VMDKError::ShortRead { .. })),
                );
            }
        } else if self.has_parent() && !deferred.is_empty() {
            let parent_cid = self.header().map_or(0, |h| h.parent_cid);
            issues.push(VMDKError::ParentNotFound {
                path: self.path.display().to_string(),
                parent_cid,
            });
        }
        Ok(ReadOutcome { data, issues })
    }

    /// Closes the extent files of this image and of its ancestors.
    pub fn close(&mut self) {
        self.handles.close();
        if let Some(ref mut parent) = self.parent {
            parent.close();
        }
    }

    /// Logs the metadata of the image and its ancestors.
    pub fn print_info(&self) {
        info!("VMDK Disk Information: {}", self.path.display());
        if let Some(ref descriptor) = self.descriptor {
            info!("  Disk Type: {:?}", descriptor.header.create_type);
            info!("  Disk ID: {:08x}", descriptor.header.cid);
            info!("  Parent ID: {:08x}", descriptor.header.parent_cid);
            if let Some(ref hint) = descriptor.header.parent_file_name_hint {
                info!("  Parent file name hint: {}", hint);
            }
            if let Some(ref adapter) = descriptor.disk_database.adapter_type {
                info!("  Adapter type: {:?}", adapter);
            }
            if let Some(thin_provisioned) = descriptor.disk_database.thin_provisioned {
                info!("  Thin Provisioned: {}", thin_provisioned);
            }
        }
        info!("  Extent list:");
        for extent in self.extents.extents() {
            let allocation = extent
                .sparse_index()
                .map(|index| {
                    format!(
                        ", {} of {} grains allocated",
                        index.grain_offsets.allocated_count(),
                        index.grain_offsets.len()
                    )
                })
                .unwrap_or_default();
            info!(
                "    - {} ({:?}), {} sectors{}",
                extent.name(),
                extent.extent_type(),
                extent.sector_count(),
                allocation
            );
        }
        info!("  Virtual disk size: {} bytes", self.extents.size_bytes());
        if let Some(ref parent) = self.parent {
            parent.print_info();
        }
    }
}

impl Drop for DiskImage {
    fn drop(&mut self) {
        self.handles.close();
    }
}

/// Streaming access to the virtual disk, unallocated grains resolved through the parent chain.
///
/// Issues found while reading are only logged. Use [`DiskImage::read`] or [`DiskImage::read_with`] to get them
/// in a [`ReadOutcome`].
impl Read for DiskImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.get_virtual_disk_size_bytes().map_err(io::Error::other)?;
        let length = (buf.len() as u64).min(size.saturating_sub(self.position));
        let outcome = self
            .read_with(self.position, length, &ReadControl::new())
            .map_err(io::Error::other)?;
        for issue in &outcome.issues {
            warn!("{}", issue);
        }
        buf[..outcome.data.len()].copy_from_slice(&outcome.data);
        self.position += outcome.data.len() as u64;
        Ok(outcome.data.len())
    }
}

impl Seek for DiskImage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.get_virtual_disk_size_bytes().map_err(io::Error::other)?;
        let new_position = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
            SeekFrom::End(offset) => size.checked_add_signed(offset),
        };
        match new_position {
            Some(position) if position <= size => {
                self.position = position;
                Ok(position)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset is out of bounds",
            )),
        }
    }
}
