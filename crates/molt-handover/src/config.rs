//! Configuration inputs handed across a restart.
//!
//! A [`ConfigInput`] is opaque to the handover machinery: only its raw bytes
//! travel to the child, and its path is what a reload reads again.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// A configuration as loaded by the surrounding server.
pub trait ConfigInput: Send + Sync + fmt::Debug {
    /// Raw configuration bytes.
    fn body(&self) -> &[u8];

    /// Where the configuration came from.
    fn path(&self) -> &Path;
}

/// A configuration backed by a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    path: PathBuf,
    contents: Vec<u8>,
}

impl FileInput {
    /// Wrap contents that were already read (or received over a pipe).
    pub fn new(path: impl Into<PathBuf>, contents: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            contents,
        }
    }

    /// Read the file at `path`.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let contents = std::fs::read(&path)?;
        Ok(Self { path, contents })
    }
}

impl ConfigInput for FileInput {
    fn body(&self) -> &[u8] {
        &self.contents
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// The process's current configuration, swapped atomically under a mutex.
///
/// The lock is only held for the pointer copy, never across I/O.
#[derive(Debug)]
pub struct CurrentConfig {
    slot: Mutex<Arc<dyn ConfigInput>>,
}

impl CurrentConfig {
    pub fn new(initial: Arc<dyn ConfigInput>) -> Self {
        Self {
            slot: Mutex::new(initial),
        }
    }

    /// Snapshot the current configuration.
    pub fn get(&self) -> Arc<dyn ConfigInput> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*slot)
    }

    /// Replace the current configuration, returning the previous one.
    pub fn replace(&self, next: Arc<dyn ConfigInput>) -> Arc<dyn ConfigInput> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, next)
    }
}
