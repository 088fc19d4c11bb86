//! Open extent files, kept for the lifetime of a disk image.

use std::{
    collections::{hash_map::Entry, HashMap},
    io,
    path::{Path, PathBuf},
};

use log::debug;

use crate::raw::RAW;

/// Extent file handles keyed by path.
///
/// Handles are opened on first checkout and stay open until [`HandlePool::close`] is called or the pool is dropped.
/// All reads go through [`RAW::read_at`], so no caller relies on a shared cursor position.
#[derive(Default)]
pub struct HandlePool {
    handles: HashMap<PathBuf, RAW>,
}

impl HandlePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the open handle for `path`, opening the file if needed.
    pub fn checkout(&mut self, path: &Path) -> io::Result<&mut RAW> {
        match self.handles.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!("Opening extent file: {}", path.display());
                Ok(entry.insert(RAW::new(path)?))
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Closes every open handle.
    pub fn close(&mut self) {
        for path in self.handles.keys() {
            debug!("Closing extent file: {}", path.display());
        }
        self.handles.clear();
    }
}
