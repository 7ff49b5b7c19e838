use packice_core::transport::uds::{read_frame, write_frame};
use packice_core::transport::wire::{
    blobs_to_wire_fds, WireAcquireRequest, WireAcquireResponse, WireError, WireLeaseRequest,
    WireObject,
};
use packice_core::{PackError, Peer, Result};
use std::collections::HashSet;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Serve the UDS transport on `path`.
///
/// Each accepted connection is one logical session handled on a blocking
/// thread, so in-flight requests on a connection are naturally serialized.
/// Leases acquired over a connection and neither sealed away nor released
/// are released when the connection goes away.
pub async fn run_uds_server(peer: Arc<dyn Peer>, path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = tokio::net::UnixListener::bind(path)?;
    tracing::info!("UDS server listening on {:?}", path);

    loop {
        let (stream, _) = listener.accept().await?;
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        let peer = peer.clone();
        let rt = Handle::current();
        tokio::task::spawn_blocking(move || handle_connection(peer, rt, stream));
    }
}

fn handle_connection(peer: Arc<dyn Peer>, rt: Handle, stream: UnixStream) {
    let mut held: HashSet<String> = HashSet::new();

    loop {
        let payload = match read_frame(&stream) {
            Ok(Some((payload, _fds))) => payload,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("uds connection error: {}", e);
                break;
            }
        };
        if let Err(e) = handle_request(&peer, &rt, &stream, &payload, &mut held) {
            let body = serde_json::to_vec(&WireError::from_err(&e)).unwrap_or_else(|_| {
                br#"{"error":{"kind":"Internal","message":"encoding"}}"#.to_vec()
            });
            if write_frame(&stream, &body, &[]).is_err() {
                break;
            }
        }
    }

    // A client that disconnected mid-session is treated as having released
    // everything it still held.
    for lease_id in held {
        match rt.block_on(peer.release(&lease_id)) {
            Ok(()) => tracing::debug!("released {} after disconnect", lease_id),
            Err(PackError::InvalidLease(_)) => {}
            Err(e) => tracing::warn!("post-disconnect release of {} failed: {}", lease_id, e),
        }
    }
}

fn handle_request(
    peer: &Arc<dyn Peer>,
    rt: &Handle,
    stream: &UnixStream,
    payload: &[u8],
    held: &mut HashSet<String>,
) -> Result<()> {
    let envelope: serde_json::Value = serde_json::from_slice(payload)?;
    let op = envelope
        .get("op")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PackError::InvalidRequest("missing op".to_string()))?
        .to_string();
    let body = envelope
        .get("body")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    match op.as_str() {
        "acquire" => {
            let req: WireAcquireRequest = serde_json::from_value(body)?;
            let result = rt.block_on(peer.acquire(req.into_request()))?;

            let (blobs, fds) = blobs_to_wire_fds(&result.blobs);
            let response = WireAcquireResponse {
                lease_id: result.lease.lease_id.clone(),
                object: WireObject::from(&result.object),
                blobs,
            };
            let bytes = serde_json::to_vec(&response)?;
            // The raw fds borrow from `result`, which stays alive until
            // after the sendmsg below.
            write_frame(stream, &bytes, &fds)?;
            held.insert(result.lease.lease_id);
            Ok(())
        }
        "seal" | "discard" | "release" | "renew" => {
            let req: WireLeaseRequest = serde_json::from_value(body)?;
            match op.as_str() {
                "seal" => rt.block_on(peer.seal(&req.lease_id))?,
                "discard" => rt.block_on(peer.discard(&req.lease_id))?,
                "release" => rt.block_on(peer.release(&req.lease_id))?,
                _ => rt.block_on(peer.renew(&req.lease_id))?,
            }
            if op == "discard" || op == "release" {
                held.remove(&req.lease_id);
            }
            write_frame(stream, br#"{"status":"ok"}"#, &[])?;
            Ok(())
        }
        other => Err(PackError::InvalidRequest(format!("unknown op {}", other))),
    }
}
