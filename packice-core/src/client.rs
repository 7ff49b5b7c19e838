//! Client entry points: URI-based `connect` and the lease handle clients
//! do data-plane I/O through.

use crate::blob::{BlobExport, BlobSpec};
use crate::error::{PackError, Result};
use crate::peer::{named_memory_peer, AcquireRequest, AcquireResult, LocalPeer, ObjectState, Peer};
use crate::resolver::Resolver;
use crate::transfer::FetchOnMiss;
use crate::transport::{connect_endpoint, DirectTransport, RemoteLease, Transport};
use bytes::Bytes;
use std::sync::Arc;
use ulid::Ulid;

/// A held lease plus the blob exports it grants access to.
///
/// Dropping a lease without releasing it leaves cleanup to the lease TTL
/// (or, over UDS, to the server's connection-loss handling).
pub struct ClientLease {
    transport: Arc<dyn Transport>,
    pub lease_id: String,
    pub object_id: String,
    pub state: ObjectState,
    pub blobs: Vec<BlobExport>,
    idempotency_key: String,
}

impl ClientLease {
    fn from_remote(transport: Arc<dyn Transport>, remote: RemoteLease) -> Self {
        Self {
            transport,
            lease_id: remote.lease_id,
            object_id: remote.object_id,
            state: remote.state,
            blobs: remote.blobs,
            idempotency_key: Ulid::new().to_string(),
        }
    }

    /// Key sent with seal/release on deduplicating transports. Minted once
    /// per handle, so a retried call through this handle replays the first
    /// outcome. Callers driving a [`Transport`] directly should do the
    /// same: one key per logical operation, reused across its retries.
    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn blob(&self, index: usize) -> Result<&BlobExport> {
        self.blobs
            .get(index)
            .ok_or_else(|| PackError::InvalidRequest(format!("no blob at index {}", index)))
    }

    /// Write into the first blob through its exported handle.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        self.blob(0)?.write_all(data)
    }

    /// Read the first blob through its exported handle.
    pub fn read_all(&self) -> Result<Bytes> {
        self.blob(0)?.read_all()
    }

    /// Seal the object; this lease continues as a READ lease.
    pub async fn seal(&mut self) -> Result<()> {
        self.transport
            .seal(&self.lease_id, Some(&self.idempotency_key))
            .await?;
        self.state = ObjectState::Sealed;
        Ok(())
    }

    /// Destroy the unsealed object and consume the lease.
    pub async fn discard(self) -> Result<()> {
        self.transport.discard(&self.lease_id).await
    }

    pub async fn release(&self) -> Result<()> {
        self.transport
            .release(&self.lease_id, Some(&self.idempotency_key))
            .await
    }

    pub async fn renew(&self) -> Result<()> {
        self.transport.renew(&self.lease_id).await
    }
}

/// Handle on a peer, local or remote.
pub struct Client {
    transport: Arc<dyn Transport>,
    local_peer: Option<Arc<dyn Peer>>,
    fetcher: Option<FetchOnMiss>,
}

/// Connect to a peer by URI:
///
/// - `""`: a fresh private in-process peer (memory backend)
/// - `memory://<name>`: the process-global named peer registry
/// - `http[s]://host:port[/prefix]`: remote peer over HTTP
/// - a path ending in `.sock` (or an existing socket node): UDS
///
/// `direct://` URIs carry no peer reference; use [`Client::for_peer`].
pub async fn connect(uri: &str) -> Result<Client> {
    if uri.is_empty() {
        let peer = LocalPeer::memory();
        peer.spawn_sweeper();
        return Ok(Client::for_peer(peer));
    }
    if uri == "direct://" {
        return Err(PackError::InvalidRequest(
            "direct:// needs an in-process peer; use Client::for_peer".to_string(),
        ));
    }
    if let Some(name) = uri.strip_prefix("memory://") {
        return Ok(Client::for_peer(named_memory_peer(name)));
    }
    Ok(Client {
        transport: connect_endpoint(uri)?,
        local_peer: None,
        fetcher: None,
    })
}

impl Client {
    /// Explicit direct transport over an in-process peer.
    pub fn for_peer(peer: Arc<dyn Peer>) -> Self {
        Self {
            transport: Arc::new(DirectTransport::new(peer.clone())),
            local_peer: Some(peer),
            fetcher: None,
        }
    }

    /// Enable fetch-on-miss against the given resolver. Only meaningful for
    /// clients attached to an in-process peer, which receives the fetched
    /// copies. `local_endpoint` is advertised after a successful fetch.
    pub fn with_resolver(
        mut self,
        resolver: Arc<dyn Resolver>,
        local_endpoint: Option<&str>,
    ) -> Result<Self> {
        let peer = self.local_peer.clone().ok_or_else(|| {
            PackError::Config("fetch-on-miss requires an in-process peer".to_string())
        })?;
        let mut fetcher = FetchOnMiss::new(resolver, peer);
        if let Some(endpoint) = local_endpoint {
            fetcher = fetcher.with_local_endpoint(endpoint);
        }
        self.fetcher = Some(fetcher);
        Ok(self)
    }

    pub async fn acquire(&self, req: AcquireRequest) -> Result<ClientLease> {
        let remote = self.transport.acquire(&req).await?;
        Ok(ClientLease::from_remote(self.transport.clone(), remote))
    }

    /// `Acquire(CREATE)` with the given blob shapes.
    pub async fn create(
        &self,
        object_id: Option<&str>,
        blob_specs: Vec<BlobSpec>,
    ) -> Result<ClientLease> {
        self.acquire(AcquireRequest::create(object_id, blob_specs))
            .await
    }

    /// `Acquire(READ)` with explicit release.
    pub async fn read(&self, object_id: &str) -> Result<ClientLease> {
        self.acquire(AcquireRequest::read(object_id)).await
    }

    /// `Acquire(READ)`, falling back to fetch-on-miss when a resolver is
    /// configured and the local peer misses.
    pub async fn read_or_fetch(&self, object_id: &str) -> Result<ClientLease> {
        match self.read(object_id).await {
            Ok(lease) => Ok(lease),
            Err(PackError::NotFound(_)) => {
                let fetcher = self.fetcher.as_ref().ok_or_else(|| {
                    PackError::NotFound(object_id.to_string())
                })?;
                let AcquireResult {
                    lease,
                    object,
                    blobs,
                } = fetcher.fetch(object_id).await?;
                Ok(ClientLease {
                    transport: self.transport.clone(),
                    lease_id: lease.lease_id,
                    object_id: object.object_id,
                    state: object.state,
                    blobs,
                    idempotency_key: Ulid::new().to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_write_read() {
        let client = connect("").await.unwrap();
        let mut lease = client
            .create(Some("k1"), vec![BlobSpec::mem(11)])
            .await
            .unwrap();
        lease.write_all(b"hello world").unwrap();
        lease.seal().await.unwrap();

        let reader = client.read("k1").await.unwrap();
        assert_eq!(reader.read_all().unwrap().as_ref(), b"hello world");
        assert_eq!(reader.state, ObjectState::Sealed);

        reader.release().await.unwrap();
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_private_peers_are_isolated() {
        let a = connect("").await.unwrap();
        let b = connect("").await.unwrap();
        let mut lease = a.create(Some("iso"), vec![BlobSpec::mem(1)]).await.unwrap();
        lease.seal().await.unwrap();
        assert!(matches!(b.read("iso").await, Err(PackError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_named_memory_peer_is_shared() {
        let a = connect("memory://client-test").await.unwrap();
        let b = connect("memory://client-test").await.unwrap();

        let mut lease = a
            .create(Some("shared"), vec![BlobSpec::mem(2)])
            .await
            .unwrap();
        lease.write_all(b"ok").unwrap();
        lease.seal().await.unwrap();

        let read = b.read("shared").await.unwrap();
        assert_eq!(read.read_all().unwrap().as_ref(), b"ok");
    }

    #[tokio::test]
    async fn test_sealer_keeps_reading() {
        let client = connect("").await.unwrap();
        let mut lease = client
            .create(Some("again"), vec![BlobSpec::mem(3)])
            .await
            .unwrap();
        lease.write_all(b"abc").unwrap();
        lease.seal().await.unwrap();
        // Same lease, now READ: the sealer may read immediately.
        assert_eq!(lease.read_all().unwrap().as_ref(), b"abc");
        // And a second seal through the same lease is a no-op.
        lease.seal().await.unwrap();
    }
}
