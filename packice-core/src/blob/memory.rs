use crate::blob::BlobHandle;
use crate::error::{PackError, Result};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;

/// Anonymous shared-memory blob.
///
/// On Linux the backing store is a memory file descriptor created with
/// `memfd_create`; elsewhere an unlinked temporary file stands in. Either
/// way the exported handle is a plain file descriptor that supports
/// `mmap` for zero-copy reads.
#[derive(Debug)]
pub struct MemBlob {
    name: String,
    file: File,
    size: u64,
    sealed: bool,
    destroyed: bool,
}

impl MemBlob {
    pub fn create(name: &str, size: u64) -> Result<Self> {
        let file = open_anonymous(name)?;
        file.set_len(size)?;
        Ok(Self {
            name: name.to_string(),
            file,
            size,
            sealed: false,
            destroyed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sealed(&self) -> bool {
        self.sealed
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.destroyed {
            return Err(PackError::Gone(self.name.clone()));
        }
        if self.sealed {
            return Err(PackError::SealViolation(self.name.clone()));
        }
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.destroyed {
            return Err(PackError::Gone(self.name.clone()));
        }
        Ok(self.file.read_at(buf, offset)?)
    }

    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.file.sync_data()?;
        self.sealed = true;
        Ok(())
    }

    /// Duplicate the descriptor so the export outlives this blob's own fd.
    pub fn export(&self) -> Result<BlobHandle> {
        if self.destroyed {
            return Err(PackError::Gone(self.name.clone()));
        }
        let dup = self.file.try_clone()?;
        Ok(BlobHandle::MemoryFd(OwnedFd::from(dup)))
    }

    pub fn destroy(&mut self) -> Result<()> {
        // The memory object itself is reclaimed once the last descriptor
        // (ours or any still-exported dup) closes.
        self.destroyed = true;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn open_anonymous(name: &str) -> Result<File> {
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use std::ffi::CString;

    let cname = CString::new(format!("packice-{}", name))
        .map_err(|e| PackError::InvalidRequest(format!("blob name: {}", e)))?;
    match memfd_create(&cname, MemFdCreateFlag::MFD_CLOEXEC) {
        Ok(fd) => Ok(File::from(fd)),
        // Kernels without memfd support fall back to an unlinked temp file.
        Err(nix::errno::Errno::ENOSYS) => Ok(tempfile::tempfile()?),
        Err(e) => Err(PackError::Io(std::io::Error::from_raw_os_error(e as i32))),
    }
}

#[cfg(not(target_os = "linux"))]
fn open_anonymous(_name: &str) -> Result<File> {
    Ok(tempfile::tempfile()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobExport;

    #[test]
    fn test_write_seal_read() {
        let mut blob = MemBlob::create("t1", 11).unwrap();
        blob.write_at(0, b"hello world").unwrap();
        blob.seal().unwrap();

        let mut buf = vec![0u8; 11];
        let n = blob.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn test_sealed_write_fails() {
        let mut blob = MemBlob::create("t2", 4).unwrap();
        blob.seal().unwrap();
        assert!(matches!(
            blob.write_at(0, b"data"),
            Err(PackError::SealViolation(_))
        ));
        // Idempotent re-seal.
        blob.seal().unwrap();
    }

    #[test]
    fn test_exported_fd_shares_bytes() {
        let mut blob = MemBlob::create("t3", 4).unwrap();
        blob.write_at(0, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        blob.seal().unwrap();

        let export = BlobExport {
            kind: crate::blob::BlobKind::Mem,
            size: 4,
            handle: blob.export().unwrap(),
        };
        let map = export.mmap().unwrap();
        assert_eq!(&map[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_export_after_destroy_is_gone() {
        let mut blob = MemBlob::create("t4", 1).unwrap();
        blob.destroy().unwrap();
        assert!(matches!(blob.export(), Err(PackError::Gone(_))));
    }
}
