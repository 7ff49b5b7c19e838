//! Blob backends for the data plane.
//!
//! A blob is an opaque, size-bounded byte container. Three backends exist:
//! anonymous shared memory (memfd), local files, and shared-filesystem files
//! with a seal-state header. Backends are a closed set of variants so error
//! paths can match exhaustively.

pub mod file;
pub mod memory;
pub mod shared_fs;

pub use file::FileBlob;
pub use memory::MemBlob;
pub use shared_fs::{SharedFsBlob, SharedFsHeader};

use crate::error::{PackError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

/// Backend family of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Mem,
    File,
    SharedFs,
}

/// Requested shape of a blob at `Acquire(CREATE)` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSpec {
    pub kind: BlobKind,
    pub size: u64,
}

impl BlobSpec {
    pub fn mem(size: u64) -> Self {
        Self {
            kind: BlobKind::Mem,
            size,
        }
    }

    pub fn file(size: u64) -> Self {
        Self {
            kind: BlobKind::File,
            size,
        }
    }
}

/// Exportable reference to a blob, usable for direct I/O without the peer.
#[derive(Debug)]
pub enum BlobHandle {
    /// Duplicated descriptor for an anonymous memory object.
    MemoryFd(OwnedFd),
    /// Absolute path of a local file.
    FilePath(PathBuf),
    /// Header and data paths on a shared filesystem.
    SharedFs { header: PathBuf, data: PathBuf },
    /// Opaque token for handles that cannot cross this transport.
    Token(String),
}

/// A peer-side blob: one of the closed set of backends.
#[derive(Debug)]
pub enum Blob {
    Mem(MemBlob),
    File(FileBlob),
    SharedFs(SharedFsBlob),
}

impl Blob {
    pub fn kind(&self) -> BlobKind {
        match self {
            Self::Mem(_) => BlobKind::Mem,
            Self::File(_) => BlobKind::File,
            Self::SharedFs(_) => BlobKind::SharedFs,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Mem(b) => b.size(),
            Self::File(b) => b.size(),
            Self::SharedFs(b) => b.size(),
        }
    }

    pub fn spec(&self) -> BlobSpec {
        BlobSpec {
            kind: self.kind(),
            size: self.size(),
        }
    }

    pub fn sealed(&self) -> bool {
        match self {
            Self::Mem(b) => b.sealed(),
            Self::File(b) => b.sealed(),
            Self::SharedFs(b) => b.sealed(),
        }
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Self::Mem(b) => b.write_at(offset, data),
            Self::File(b) => b.write_at(offset, data),
            Self::SharedFs(b) => b.write_at(offset, data),
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Mem(b) => b.read_at(offset, buf),
            Self::File(b) => b.read_at(offset, buf),
            Self::SharedFs(b) => b.read_at(offset, buf),
        }
    }

    /// Flush pending writes and mark the blob immutable. Idempotent.
    pub fn seal(&mut self) -> Result<()> {
        match self {
            Self::Mem(b) => b.seal(),
            Self::File(b) => b.seal(),
            Self::SharedFs(b) => b.seal(),
        }
    }

    /// Export a handle for direct client I/O.
    pub fn export(&self) -> Result<BlobHandle> {
        match self {
            Self::Mem(b) => b.export(),
            Self::File(b) => b.export(),
            Self::SharedFs(b) => b.export(),
        }
    }

    /// Tear down backing storage. Exports fail with `Gone` afterwards.
    pub fn destroy(&mut self) -> Result<()> {
        match self {
            Self::Mem(b) => b.destroy(),
            Self::File(b) => b.destroy(),
            Self::SharedFs(b) => b.destroy(),
        }
    }
}

/// Snapshot of one blob as returned from `Acquire`: shape plus a handle the
/// holder can do direct I/O through.
#[derive(Debug)]
pub struct BlobExport {
    pub kind: BlobKind,
    pub size: u64,
    pub handle: BlobHandle,
}

impl BlobExport {
    pub fn spec(&self) -> BlobSpec {
        BlobSpec {
            kind: self.kind,
            size: self.size,
        }
    }

    fn open_for_read(&self) -> Result<File> {
        match &self.handle {
            BlobHandle::MemoryFd(fd) => {
                let dup = fd.try_clone()?;
                Ok(File::from(dup))
            }
            BlobHandle::FilePath(path) => Ok(File::open(path)?),
            BlobHandle::SharedFs { data, .. } => Ok(File::open(data)?),
            BlobHandle::Token(token) => Err(PackError::Transport(format!(
                "handle {} is not locally accessible",
                token
            ))),
        }
    }

    fn open_for_write(&self) -> Result<File> {
        match &self.handle {
            BlobHandle::MemoryFd(fd) => {
                let dup = fd.try_clone()?;
                Ok(File::from(dup))
            }
            BlobHandle::FilePath(path) => {
                Ok(File::options().read(true).write(true).open(path)?)
            }
            BlobHandle::SharedFs { header, data } => {
                let head = SharedFsHeader::read_from(header)?;
                if head.sealed() {
                    return Err(PackError::SealViolation(data.display().to_string()));
                }
                Ok(File::options().read(true).write(true).open(data)?)
            }
            BlobHandle::Token(token) => Err(PackError::Transport(format!(
                "handle {} is not locally accessible",
                token
            ))),
        }
    }

    /// Read the full blob contents. A zero-size blob yields empty bytes.
    pub fn read_all(&self) -> Result<Bytes> {
        if self.size == 0 {
            return Ok(Bytes::new());
        }
        let file = self.open_for_read()?;
        let mut buf = vec![0u8; self.size as usize];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read_at(&mut buf[read..], read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(Bytes::from(buf))
    }

    /// Write `data` at the start of the blob through its handle.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.size {
            return Err(PackError::InvalidRequest(format!(
                "write of {} bytes exceeds blob size {}",
                data.len(),
                self.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        let file = self.open_for_write()?;
        file.write_all_at(data, 0)?;
        file.sync_data()?;
        Ok(())
    }

    /// Map the blob read-only for zero-copy access. Fails on empty blobs.
    pub fn mmap(&self) -> Result<memmap2::Mmap> {
        if self.size == 0 {
            return Err(PackError::InvalidRequest(
                "cannot map a zero-size blob".to_string(),
            ));
        }
        let file = self.open_for_read()?;
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_round_trip_through_file_handle() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Blob::File(FileBlob::create(dir.path(), "obj1", 0, 5).unwrap());
        let export = BlobExport {
            kind: blob.kind(),
            size: blob.size(),
            handle: blob.export().unwrap(),
        };
        export.write_all(b"hello").unwrap();
        assert_eq!(export.read_all().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_zero_size_read_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Blob::File(FileBlob::create(dir.path(), "obj0", 0, 0).unwrap());
        let export = BlobExport {
            kind: blob.kind(),
            size: 0,
            handle: blob.export().unwrap(),
        };
        assert!(export.read_all().unwrap().is_empty());
        assert!(export.mmap().is_err());
    }

    #[test]
    fn test_oversized_write_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Blob::File(FileBlob::create(dir.path(), "obj2", 0, 2).unwrap());
        let export = BlobExport {
            kind: blob.kind(),
            size: 2,
            handle: blob.export().unwrap(),
        };
        assert!(matches!(
            export.write_all(b"too long"),
            Err(PackError::InvalidRequest(_))
        ));
    }
}
