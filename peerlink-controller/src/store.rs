//! File-backed blob store: `<root>/<namespace>/<key>.bin`.

use std::io::Write;
use std::path::PathBuf;

use peerlink_core::{BlobStore, StoreError};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create the root directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        for part in [namespace, key] {
            if part.is_empty() || part.contains(['/', '\\']) || part.starts_with('.') {
                return Err(StoreError::Unavailable(format!("invalid blob name {:?}", part)));
            }
        }
        Ok(self.root.join(namespace).join(format!("{}.bin", key)))
    }
}

impl BlobStore for FileStore {
    /// Write to a sibling temp file, then rename over the blob.
    fn write_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path(namespace, key)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("bin.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path(namespace, key)?;
        match std::fs::read(&path) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
