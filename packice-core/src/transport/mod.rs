//! Transport adapters over the peer contract.
//!
//! Adapters marshal the four peer operations; they never reimplement
//! semantics. Direct passes native records through, HTTP speaks JSON with
//! path-style handles, UDS speaks length-prefixed JSON with SCM_RIGHTS
//! descriptor passing for memory blobs.

pub mod direct;
pub mod http;
pub mod uds;
pub mod wire;

pub use direct::DirectTransport;
pub use http::HttpTransport;
pub use uds::UdsTransport;

use crate::blob::BlobExport;
use crate::error::{PackError, Result};
use crate::peer::{named_memory_peer, AcquireRequest, ObjectState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

/// A lease as seen through a transport: identity plus blob exports.
#[derive(Debug)]
pub struct RemoteLease {
    pub lease_id: String,
    pub object_id: String,
    pub state: ObjectState,
    pub seal_ts: Option<DateTime<Utc>>,
    pub blobs: Vec<BlobExport>,
}

/// Client-side face of a peer, local or remote.
///
/// `seal` and `release` take a caller-supplied idempotency key: a retry of
/// the same logical operation must pass the same key so deduplicating
/// transports (HTTP) replay the first outcome instead of re-executing.
/// Transports without a dedup window ignore the key.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn acquire(&self, req: &AcquireRequest) -> Result<RemoteLease>;
    async fn seal(&self, lease_id: &str, idempotency_key: Option<&str>) -> Result<()>;
    async fn discard(&self, lease_id: &str) -> Result<()>;
    async fn release(&self, lease_id: &str, idempotency_key: Option<&str>) -> Result<()>;
    async fn renew(&self, lease_id: &str) -> Result<()>;
}

/// Resolve a connection URI to a transport (see `connect` for the accepted
/// forms). `direct://` has no addressable peer and is rejected here.
pub fn connect_endpoint(uri: &str) -> Result<Arc<dyn Transport>> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Arc::new(HttpTransport::new(uri)));
    }
    if let Some(name) = uri.strip_prefix("memory://") {
        return Ok(Arc::new(DirectTransport::new(named_memory_peer(name))));
    }
    if uri.ends_with(".sock") || is_socket_node(Path::new(uri)) {
        return Ok(Arc::new(UdsTransport::new(uri)));
    }
    Err(PackError::InvalidRequest(format!(
        "unsupported endpoint uri: {}",
        uri
    )))
}

fn is_socket_node(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_dispatch() {
        assert!(connect_endpoint("http://127.0.0.1:9190").is_ok());
        assert!(connect_endpoint("memory://shared").is_ok());
        assert!(connect_endpoint("/tmp/packice-test.sock").is_ok());
        assert!(matches!(
            connect_endpoint("ftp://nope"),
            Err(PackError::InvalidRequest(_))
        ));
    }
}
