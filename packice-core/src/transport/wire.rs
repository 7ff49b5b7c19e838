//! JSON wire messages shared by the HTTP and UDS adapters.
//!
//! Unknown fields are ignored on decode so older clients keep working
//! against newer servers.

use crate::blob::{BlobExport, BlobHandle, BlobKind, BlobSpec};
use crate::error::{PackError, Result};
use crate::lease::AccessFlags;
use crate::peer::{AcquireRequest, ObjectInfo, ObjectState, UserMeta};
use serde::{Deserialize, Serialize};
use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
pub struct WireAcquireRequest {
    pub objid: Option<String>,
    pub flags: AccessFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "UserMeta::is_empty")]
    pub meta: UserMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_objid: Option<String>,
    #[serde(default)]
    pub blob_specs: Vec<BlobSpec>,
}

impl From<&AcquireRequest> for WireAcquireRequest {
    fn from(req: &AcquireRequest) -> Self {
        Self {
            objid: req.object_id.clone(),
            flags: req.flags,
            ttl_ms: req.ttl.map(|t| t.as_millis() as u64),
            meta: req.meta.clone(),
            prev_objid: req.prev_objid.clone(),
            blob_specs: req.blob_specs.clone(),
        }
    }
}

impl WireAcquireRequest {
    pub fn into_request(self) -> AcquireRequest {
        AcquireRequest {
            object_id: self.objid,
            flags: self.flags,
            ttl: self.ttl_ms.map(Duration::from_millis),
            meta: self.meta,
            prev_objid: self.prev_objid,
            blob_specs: self.blob_specs,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireObject {
    pub objid: String,
    pub state: ObjectState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal_ts_ms: Option<u64>,
}

impl From<&ObjectInfo> for WireObject {
    fn from(info: &ObjectInfo) -> Self {
        Self {
            objid: info.object_id.clone(),
            state: info.state,
            seal_ts_ms: info.seal_ts.map(|t| t.timestamp_millis() as u64),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireBlob {
    pub kind: BlobKind,
    pub size: u64,
    /// Path-style handle, or an opaque token for non-transferable handles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Position of this blob's descriptor in the ancillary fd payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd_index: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireAcquireResponse {
    pub lease_id: String,
    pub object: WireObject,
    pub blobs: Vec<WireBlob>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireLeaseRequest {
    pub lease_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireError {
    pub error: WireErrorBody,
}

impl WireError {
    pub fn from_err(err: &PackError) -> Self {
        Self {
            error: WireErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }

    pub fn into_err(self) -> PackError {
        PackError::from_wire(&self.error.kind, self.error.message)
    }
}

/// Path-only rendering used by HTTP: memory handles become opaque tokens
/// that only a descriptor-passing transport could have materialized.
pub fn blobs_to_wire_paths(object_id: &str, blobs: &[BlobExport]) -> Vec<WireBlob> {
    blobs
        .iter()
        .enumerate()
        .map(|(index, blob)| WireBlob {
            kind: blob.kind,
            size: blob.size,
            handle: Some(match &blob.handle {
                BlobHandle::FilePath(path) => path.display().to_string(),
                BlobHandle::SharedFs { data, .. } => data.display().to_string(),
                BlobHandle::MemoryFd(_) => format!("mem:{}/{}", object_id, index),
                BlobHandle::Token(token) => token.clone(),
            }),
            fd_index: None,
        })
        .collect()
}

/// Descriptor-passing rendering used by UDS: memory handles are assigned an
/// ancillary slot, everything else stays path-style. The returned raw fds
/// borrow from `blobs` and must be sent before the exports are dropped.
pub fn blobs_to_wire_fds(blobs: &[BlobExport]) -> (Vec<WireBlob>, Vec<RawFd>) {
    use std::os::fd::AsRawFd;

    let mut fds = Vec::new();
    let wire = blobs
        .iter()
        .map(|blob| match &blob.handle {
            BlobHandle::MemoryFd(fd) => {
                fds.push(fd.as_raw_fd());
                WireBlob {
                    kind: blob.kind,
                    size: blob.size,
                    handle: None,
                    fd_index: Some(fds.len() - 1),
                }
            }
            BlobHandle::FilePath(path) => WireBlob {
                kind: blob.kind,
                size: blob.size,
                handle: Some(path.display().to_string()),
                fd_index: None,
            },
            BlobHandle::SharedFs { data, .. } => WireBlob {
                kind: blob.kind,
                size: blob.size,
                handle: Some(data.display().to_string()),
                fd_index: None,
            },
            BlobHandle::Token(token) => WireBlob {
                kind: blob.kind,
                size: blob.size,
                handle: Some(token.clone()),
                fd_index: None,
            },
        })
        .collect();
    (wire, fds)
}

/// Client-side reconstruction of blob exports from wire blobs plus any
/// descriptors received in the ancillary payload.
pub fn wire_blobs_to_exports(
    blobs: Vec<WireBlob>,
    fds: &mut [Option<OwnedFd>],
) -> Result<Vec<BlobExport>> {
    blobs
        .into_iter()
        .map(|blob| {
            let handle = if let Some(index) = blob.fd_index {
                let fd = fds
                    .get_mut(index)
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        PackError::Transport(format!("missing ancillary fd {}", index))
                    })?;
                BlobHandle::MemoryFd(fd)
            } else {
                let raw = blob.handle.unwrap_or_default();
                match blob.kind {
                    BlobKind::File => BlobHandle::FilePath(PathBuf::from(raw)),
                    BlobKind::SharedFs => {
                        let data = PathBuf::from(raw);
                        BlobHandle::SharedFs {
                            header: header_path_for(&data),
                            data,
                        }
                    }
                    BlobKind::Mem => BlobHandle::Token(raw),
                }
            };
            Ok(BlobExport {
                kind: blob.kind,
                size: blob.size,
                handle,
            })
        })
        .collect()
}

/// A shared-fs data path's sibling header: `data` -> `header`,
/// `data.N` -> `header.N`.
fn header_path_for(data: &Path) -> PathBuf {
    let name = data.file_name().and_then(|n| n.to_str()).unwrap_or("data");
    let header_name = if name == "data" {
        "header".to_string()
    } else {
        name.replacen("data.", "header.", 1)
    };
    data.with_file_name(header_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_request_round_trip() {
        let req = AcquireRequest::create(Some("k"), vec![BlobSpec::mem(8)])
            .with_ttl(Duration::from_secs(5))
            .with_prev("k-prev");
        let wire = WireAcquireRequest::from(&req);
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireAcquireRequest = serde_json::from_str(&json).unwrap();
        let back = back.into_request();
        assert_eq!(back.object_id.as_deref(), Some("k"));
        assert_eq!(back.ttl, Some(Duration::from_secs(5)));
        assert_eq!(back.prev_objid.as_deref(), Some("k-prev"));
        assert_eq!(back.blob_specs, vec![BlobSpec::mem(8)]);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = r#"{"lease_id":"l","object":{"objid":"o","state":"SEALED","extra":1},"blobs":[],"later":true}"#;
        let resp: WireAcquireResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.lease_id, "l");
        assert_eq!(resp.object.state, ObjectState::Sealed);
    }

    #[test]
    fn test_shared_fs_header_derivation() {
        assert_eq!(
            header_path_for(Path::new("/x/obj/data")),
            PathBuf::from("/x/obj/header")
        );
        assert_eq!(
            header_path_for(Path::new("/x/obj/data.2")),
            PathBuf::from("/x/obj/header.2")
        );
    }

    #[test]
    fn test_wire_error_round_trip() {
        let err = PackError::Full("no room".to_string());
        let wire = WireError::from_err(&err);
        assert_eq!(wire.error.kind, "Full");
        assert!(matches!(wire.into_err(), PackError::Full(_)));
    }
}
