//! A thin client that performs CRUD against a mounted `memfs` instance from
//! outside the handler's trust boundary, using ordinary `std::fs` calls
//! joined against the adapter's configured root — the same way an external
//! process talking to the mount would.

use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use log::debug;

/// Errors the adapter can raise. Every variant wraps the underlying I/O
/// failure; the adapter never touches the in-memory graph directly, so
/// there is no taxonomy to share with [`memfs_core::Error`].
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("path escapes adapter root: {0}")]
    PathEscapesRoot(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Holds the configured mount-point path every relative path is joined
/// against.
#[derive(Debug, Clone)]
pub struct Adapter {
    root: PathBuf,
}

impl Adapter {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, rel_path: &Path) -> Result<PathBuf> {
        if rel_path.is_absolute() {
            return Err(AdapterError::PathEscapesRoot(rel_path.to_path_buf()));
        }
        Ok(self.root.join(rel_path))
    }

    /// Creates a file at `rel_path` with `contents`, failing if it already
    /// exists.
    pub fn create(&self, rel_path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
        let path = self.resolve(rel_path.as_ref())?;
        debug!("adapter: create {path:?}");
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(contents)?;
        Ok(())
    }

    /// Reads the full contents of the file at `rel_path`.
    pub fn read(&self, rel_path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.resolve(rel_path.as_ref())?;
        debug!("adapter: read {path:?}");
        Ok(fs::read(path)?)
    }

    /// Overwrites the file at `rel_path` with `contents` (open-write-truncate).
    pub fn update(&self, rel_path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
        let path = self.resolve(rel_path.as_ref())?;
        debug!("adapter: update {path:?}");
        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(contents)?;
        Ok(())
    }

    /// Removes the file at `rel_path`.
    pub fn delete(&self, rel_path: impl AsRef<Path>) -> Result<()> {
        let path = self.resolve(rel_path.as_ref())?;
        debug!("adapter: delete {path:?}");
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_read_update_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Adapter::new(dir.path());

        adapter.create("a.txt", b"hello").unwrap();
        assert_eq!(adapter.read("a.txt").unwrap(), b"hello");

        adapter.update("a.txt", b"world").unwrap();
        assert_eq!(adapter.read("a.txt").unwrap(), b"world");

        adapter.delete("a.txt").unwrap();
        assert!(adapter.read("a.txt").is_err());
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Adapter::new(dir.path());
        let err = adapter.read("/etc/passwd").unwrap_err();
        assert!(matches!(err, AdapterError::PathEscapesRoot(_)));
    }
}
