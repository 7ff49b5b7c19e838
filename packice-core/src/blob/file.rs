use crate::blob::BlobHandle;
use crate::error::{PackError, Result};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Blob backed by a regular file on a local filesystem.
///
/// The exported handle is the absolute path; a duplicated descriptor is
/// available on request for callers that prefer fd-based I/O.
#[derive(Debug)]
pub struct FileBlob {
    path: PathBuf,
    file: File,
    size: u64,
    sealed: bool,
    destroyed: bool,
}

impl FileBlob {
    /// Create `<root>/<objid>/blob-<index>` sized to `size`.
    pub fn create(root: &Path, object_id: &str, index: usize, size: u64) -> Result<Self> {
        let dir = root.join(object_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("blob-{}", index));
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        Ok(Self {
            path: path.canonicalize().unwrap_or(path),
            file,
            size,
            sealed: false,
            destroyed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sealed(&self) -> bool {
        self.sealed
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.destroyed {
            return Err(PackError::Gone(self.path.display().to_string()));
        }
        if self.sealed {
            return Err(PackError::SealViolation(self.path.display().to_string()));
        }
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.destroyed {
            return Err(PackError::Gone(self.path.display().to_string()));
        }
        Ok(self.file.read_at(buf, offset)?)
    }

    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.file.sync_all()?;
        self.sealed = true;
        Ok(())
    }

    pub fn export(&self) -> Result<BlobHandle> {
        if self.destroyed {
            return Err(PackError::Gone(self.path.display().to_string()));
        }
        Ok(BlobHandle::FilePath(self.path.clone()))
    }

    /// Descriptor export for callers that want fd-based access.
    pub fn export_fd(&self) -> Result<OwnedFd> {
        if self.destroyed {
            return Err(PackError::Gone(self.path.display().to_string()));
        }
        let dup = self.file.try_clone()?;
        Ok(OwnedFd::from(dup))
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.destroyed = true;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        if let Some(dir) = self.path.parent() {
            // Best effort: drop the per-object directory once empty.
            let _ = std::fs::remove_dir(dir);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_seal() {
        let dir = tempfile::tempdir().unwrap();
        let mut blob = FileBlob::create(dir.path(), "obj", 0, 3).unwrap();
        blob.write_at(0, b"abc").unwrap();
        blob.seal().unwrap();
        assert!(matches!(
            blob.write_at(0, b"x"),
            Err(PackError::SealViolation(_))
        ));

        let mut buf = [0u8; 3];
        blob.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        // fd-based access reads the same bytes.
        let fd = blob.export_fd().unwrap();
        let file = std::fs::File::from(fd);
        let mut via_fd = [0u8; 3];
        file.read_at(&mut via_fd, 0).unwrap();
        assert_eq!(&via_fd, b"abc");
    }

    #[test]
    fn test_destroy_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut blob = FileBlob::create(dir.path(), "obj", 0, 1).unwrap();
        let path = blob.path().to_path_buf();
        blob.destroy().unwrap();
        assert!(!path.exists());
        assert!(matches!(blob.export(), Err(PackError::Gone(_))));
    }
}
