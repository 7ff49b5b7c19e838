//! Unix-domain-socket adapter.
//!
//! Frames are a 4-byte network-order length prefix followed by JSON. The
//! request envelope is `{op, body}` where `body` matches the HTTP bodies.
//! Acquire responses for memory blobs carry `fd_index` slots whose
//! descriptors travel in the SCM_RIGHTS ancillary payload of the same
//! frame, so the client inherits fresh descriptors onto the same memory
//! object. One connection is one logical session; the server serializes
//! requests per connection and releases leases left behind on disconnect.

use crate::error::{PackError, Result};
use crate::peer::AcquireRequest;
use crate::transport::wire::{
    wire_blobs_to_exports, WireAcquireRequest, WireAcquireResponse, WireError,
};
use crate::transport::{RemoteLease, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use std::io::{IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Upper bound on descriptors per frame, matching the blob-count bound a
/// single acquire response can carry.
pub const MAX_ANCILLARY_FDS: usize = 16;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one length-prefixed frame, attaching `fds` as SCM_RIGHTS on the
/// first segment.
pub fn write_frame(mut stream: &UnixStream, payload: &[u8], fds: &[RawFd]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(PackError::Transport("frame too large".to_string()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);

    if fds.is_empty() {
        stream.write_all(&frame)?;
        return Ok(());
    }

    let iov = [IoSlice::new(&frame)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    let sent = sendmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(|e| PackError::Transport(format!("sendmsg: {}", e)))?;
    if sent < frame.len() {
        stream.write_all(&frame[sent..])?;
    }
    Ok(())
}

/// Read one frame plus any descriptors from its ancillary payload.
/// Returns `None` on clean end-of-stream.
pub fn read_frame(stream: &UnixStream) -> Result<Option<(Vec<u8>, Vec<OwnedFd>)>> {
    let mut fds = Vec::new();

    let mut header = [0u8; 4];
    let mut read = 0usize;
    while read < 4 {
        let n = recv_with_fds(stream, &mut header[read..], &mut fds)?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(PackError::Transport("unexpected end of stream".to_string()));
        }
        read += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PackError::Transport("frame too large".to_string()));
    }
    let mut payload = vec![0u8; len];
    let mut read = 0usize;
    while read < len {
        let n = recv_with_fds(stream, &mut payload[read..], &mut fds)?;
        if n == 0 {
            return Err(PackError::Transport("unexpected end of stream".to_string()));
        }
        read += n;
    }
    Ok(Some((payload, fds)))
}

fn recv_with_fds(stream: &UnixStream, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_ANCILLARY_FDS]);
    let msg = recvmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(|e| PackError::Transport(format!("recvmsg: {}", e)))?;
    let bytes = msg.bytes;
    let cmsgs = msg
        .cmsgs()
        .map_err(|e| PackError::Transport(format!("cmsgs: {}", e)))?;
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                // SAFETY: the kernel installed these descriptors for us;
                // nothing else owns them.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Ok(bytes)
}

/// Client side of the UDS adapter. Holds one connection; requests on it
/// are serialized, and leases acquired over it die with it server-side.
pub struct UdsTransport {
    path: PathBuf,
    conn: Arc<Mutex<Option<UnixStream>>>,
}

impl UdsTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    async fn call(
        &self,
        op: &'static str,
        body: serde_json::Value,
    ) -> Result<(serde_json::Value, Vec<OwnedFd>)> {
        let path = self.path.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                let stream = UnixStream::connect(&path)
                    .map_err(|e| PackError::Transport(format!("connect {:?}: {}", path, e)))?;
                *guard = Some(stream);
            }
            let Some(stream) = guard.as_ref() else {
                return Err(PackError::Internal("uds connection missing".to_string()));
            };

            let payload = serde_json::to_vec(&serde_json::json!({ "op": op, "body": body }))?;
            let exchanged = write_frame(stream, &payload, &[]).and_then(|_| {
                read_frame(stream)?.ok_or_else(|| {
                    PackError::Transport("server closed connection".to_string())
                })
            });
            let (reply, fds) = match exchanged {
                Ok(out) => out,
                Err(e) => {
                    // Tear the session down on transport faults only.
                    *guard = None;
                    return Err(e);
                }
            };

            let value: serde_json::Value = serde_json::from_slice(&reply)?;
            if value.get("error").is_some() {
                let wire: WireError = serde_json::from_value(value)?;
                return Err(wire.into_err());
            }
            Ok((value, fds))
        })
        .await
        .map_err(|e| PackError::Internal(format!("uds task: {}", e)))?
    }

    async fn lease_op(&self, op: &'static str, lease_id: &str) -> Result<()> {
        self.call(op, serde_json::json!({ "lease_id": lease_id }))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Transport for UdsTransport {
    async fn acquire(&self, req: &AcquireRequest) -> Result<RemoteLease> {
        let body = serde_json::to_value(WireAcquireRequest::from(req))?;
        let (value, fds) = self.call("acquire", body).await?;
        let payload: WireAcquireResponse = serde_json::from_value(value)?;

        let mut fd_slots: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
        let blobs = wire_blobs_to_exports(payload.blobs, &mut fd_slots)?;
        Ok(RemoteLease {
            lease_id: payload.lease_id,
            object_id: payload.object.objid,
            state: payload.object.state,
            seal_ts: payload
                .object
                .seal_ts_ms
                .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64)),
            blobs,
        })
    }

    // The UDS session has no dedup window; a lost connection releases the
    // session's leases instead, so the idempotency key is ignored.
    async fn seal(&self, lease_id: &str, _idempotency_key: Option<&str>) -> Result<()> {
        self.lease_op("seal", lease_id).await
    }

    async fn discard(&self, lease_id: &str) -> Result<()> {
        self.lease_op("discard", lease_id).await
    }

    async fn release(&self, lease_id: &str, _idempotency_key: Option<&str>) -> Result<()> {
        self.lease_op("release", lease_id).await
    }

    async fn renew(&self, lease_id: &str) -> Result<()> {
        self.lease_op("renew", lease_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        write_frame(&a, br#"{"op":"seal"}"#, &[]).unwrap();
        let (payload, fds) = read_frame(&b).unwrap().unwrap();
        assert_eq!(payload, br#"{"op":"seal"}"#);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_frame_carries_descriptors() {
        use std::io::Read;
        use std::os::unix::fs::FileExt;

        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        file.write_all_at(b"fdpass", 0).unwrap();

        write_frame(&a, b"{}", &[file.as_raw_fd()]).unwrap();
        let (payload, mut fds) = read_frame(&b).unwrap().unwrap();
        assert_eq!(payload, b"{}");
        assert_eq!(fds.len(), 1);

        let mut inherited = std::fs::File::from(fds.remove(0));
        let mut buf = Vec::new();
        use std::io::Seek;
        inherited.seek(std::io::SeekFrom::Start(0)).unwrap();
        inherited.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"fdpass");
    }

    #[test]
    fn test_clean_eof_is_none() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(read_frame(&b).unwrap().is_none());
    }
}
