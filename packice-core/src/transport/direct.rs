use crate::error::Result;
use crate::peer::{AcquireRequest, Peer};
use crate::transport::{RemoteLease, Transport};
use async_trait::async_trait;
use std::sync::Arc;

/// Zero-copy in-process adapter: requests and responses are native records
/// and blob handles move by value, so semantics are exactly those of the
/// wrapped peer.
pub struct DirectTransport {
    peer: Arc<dyn Peer>,
}

impl DirectTransport {
    pub fn new(peer: Arc<dyn Peer>) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> Arc<dyn Peer> {
        self.peer.clone()
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn acquire(&self, req: &AcquireRequest) -> Result<RemoteLease> {
        let result = self.peer.acquire(req.clone()).await?;
        Ok(RemoteLease {
            lease_id: result.lease.lease_id,
            object_id: result.object.object_id,
            state: result.object.state,
            seal_ts: result.object.seal_ts,
            blobs: result.blobs,
        })
    }

    async fn seal(&self, lease_id: &str, _idempotency_key: Option<&str>) -> Result<()> {
        self.peer.seal(lease_id).await
    }

    async fn discard(&self, lease_id: &str) -> Result<()> {
        self.peer.discard(lease_id).await
    }

    async fn release(&self, lease_id: &str, _idempotency_key: Option<&str>) -> Result<()> {
        self.peer.release(lease_id).await
    }

    async fn renew(&self, lease_id: &str) -> Result<()> {
        self.peer.renew(lease_id).await
    }
}
