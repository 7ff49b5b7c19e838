use crate::blob::BlobHandle;
use crate::error::{PackError, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub const HEADER_MAGIC: &[u8; 4] = b"PKCE";
pub const HEADER_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;
const FLAG_SEALED: u32 = 0x1;

/// Fixed 128-byte header stored next to the data file so readers on other
/// hosts can detect seal state without a peer round trip.
///
/// Layout (big-endian): magic `PKCE`, version u32, flags u32, size u64,
/// seal_ts_ms u64, reserved zeros. Flags bit 0 is the seal flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedFsHeader {
    pub version: u32,
    pub flags: u32,
    pub size: u64,
    pub seal_ts_ms: u64,
}

impl SharedFsHeader {
    pub fn new(size: u64) -> Self {
        Self {
            version: HEADER_VERSION,
            flags: 0,
            size,
            seal_ts_ms: 0,
        }
    }

    pub fn sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(HEADER_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..20].copy_from_slice(&self.size.to_be_bytes());
        buf[20..28].copy_from_slice(&self.seal_ts_ms.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE || &buf[0..4] != HEADER_MAGIC {
            return Err(PackError::Internal("bad shared-fs header".to_string()));
        }
        Ok(Self {
            version: be_u32(&buf[4..8]),
            flags: be_u32(&buf[8..12]),
            size: be_u64(&buf[12..20]),
            seal_ts_ms: be_u64(&buf[20..28]),
        })
    }

    /// Read and validate the header at `path`.
    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        Self::decode(&buf)
    }
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn be_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

/// Blob on a filesystem mounted by multiple processes or hosts.
///
/// Stored as `<root>/<objid>/data` plus the `header` file; blob index 0
/// uses the bare names, further blobs append `.N`.
#[derive(Debug)]
pub struct SharedFsBlob {
    header_path: PathBuf,
    data_path: PathBuf,
    data: File,
    size: u64,
    sealed: bool,
    destroyed: bool,
}

impl SharedFsBlob {
    pub fn create(root: &Path, object_id: &str, index: usize, size: u64) -> Result<Self> {
        let dir = root.join(object_id);
        std::fs::create_dir_all(&dir)?;
        let (header_name, data_name) = if index == 0 {
            ("header".to_string(), "data".to_string())
        } else {
            (format!("header.{}", index), format!("data.{}", index))
        };
        let header_path = dir.join(header_name);
        let data_path = dir.join(data_name);

        let header_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&header_path)?;
        header_file.write_all_at(&SharedFsHeader::new(size).encode(), 0)?;
        header_file.sync_all()?;

        let data = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        data.set_len(size)?;

        Ok(Self {
            header_path,
            data_path,
            data,
            size,
            sealed: false,
            destroyed: false,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sealed(&self) -> bool {
        self.sealed
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.destroyed {
            return Err(PackError::Gone(self.data_path.display().to_string()));
        }
        if self.sealed {
            return Err(PackError::SealViolation(
                self.data_path.display().to_string(),
            ));
        }
        self.data.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.destroyed {
            return Err(PackError::Gone(self.data_path.display().to_string()));
        }
        Ok(self.data.read_at(buf, offset)?)
    }

    /// Seal the blob: flush data, then rewrite the header with the seal
    /// flag and timestamp while holding an exclusive advisory lock so
    /// concurrent cross-process header readers never see a torn write.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.data.sync_all()?;

        let header_file = File::options()
            .read(true)
            .write(true)
            .open(&self.header_path)?;
        let locked = Flock::lock(header_file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| PackError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;

        let mut buf = [0u8; HEADER_SIZE];
        locked.read_exact_at(&mut buf, 0)?;
        let mut header = SharedFsHeader::decode(&buf)?;
        header.flags |= FLAG_SEALED;
        header.seal_ts_ms = chrono::Utc::now().timestamp_millis() as u64;
        locked.write_all_at(&header.encode(), 0)?;
        locked.sync_all()?;
        drop(locked);

        self.sealed = true;
        Ok(())
    }

    pub fn export(&self) -> Result<BlobHandle> {
        if self.destroyed {
            return Err(PackError::Gone(self.data_path.display().to_string()));
        }
        Ok(BlobHandle::SharedFs {
            header: self.header_path.clone(),
            data: self.data_path.clone(),
        })
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.destroyed = true;
        for path in [&self.data_path, &self.header_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        if let Some(dir) = self.data_path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let mut header = SharedFsHeader::new(42);
        header.flags |= FLAG_SEALED;
        header.seal_ts_ms = 1234;
        let decoded = SharedFsHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.sealed());
    }

    #[test]
    fn test_cross_process_seal_detection() {
        let dir = tempfile::tempdir().unwrap();
        let mut blob = SharedFsBlob::create(dir.path(), "obj", 0, 4).unwrap();
        blob.write_at(0, b"data").unwrap();

        let header_path = dir.path().join("obj").join("header");
        assert!(!SharedFsHeader::read_from(&header_path).unwrap().sealed());

        blob.seal().unwrap();
        let header = SharedFsHeader::read_from(&header_path).unwrap();
        assert!(header.sealed());
        assert!(header.seal_ts_ms > 0);
        assert_eq!(header.size, 4);
    }

    #[test]
    fn test_destroy_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut blob = SharedFsBlob::create(dir.path(), "obj", 0, 1).unwrap();
        blob.destroy().unwrap();
        assert!(!dir.path().join("obj").exists());
    }
}
