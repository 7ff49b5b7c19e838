//! Cross-peer object movement: the internal copy protocol and the
//! fetch-on-miss resolver walk.
//!
//! Both paths share the same shape: take a READ lease on the source, a
//! CREATE lease on the destination with matching blob shapes, stream the
//! bytes, seal, release. A failed copy discards the destination-side
//! CREATING object so nothing half-built ever becomes visible.

use crate::blob::BlobExport;
use crate::error::{PackError, Result};
use crate::lease::AccessFlags;
use crate::peer::{AcquireRequest, AcquireResult, Peer};
use crate::resolver::Resolver;
use crate::transport::connect_endpoint;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// TTL of the short-lived READ lease taken on a remote candidate.
pub const FETCH_READ_TTL: Duration = Duration::from_secs(30);

fn copy_exports(src: &[BlobExport], dst: &[BlobExport]) -> Result<()> {
    for (source, dest) in src.iter().zip(dst.iter()) {
        let data = source.read_all()?;
        dest.write_all(&data)?;
    }
    Ok(())
}

/// Copy a sealed object from one peer to another, preserving object id,
/// user metadata, and the `prev_objid` chain link. The destination copy is
/// sealed before the function returns; the source copy is left in place.
pub async fn copy_between_peers(
    src: &dyn Peer,
    dst: &dyn Peer,
    object_id: &str,
) -> Result<()> {
    let src_acq = src.acquire(AcquireRequest::read(object_id)).await?;
    let specs = src_acq.blobs.iter().map(BlobExport::spec).collect();

    let mut create = AcquireRequest::create(Some(object_id), specs);
    create.meta = src_acq.object.meta.clone();
    create.prev_objid = src_acq.object.prev_objid.clone();

    let dst_acq = match dst.acquire(create).await {
        Ok(acq) => acq,
        Err(e) => {
            let _ = src.release(&src_acq.lease.lease_id).await;
            return Err(e);
        }
    };

    let outcome = match copy_exports(&src_acq.blobs, &dst_acq.blobs) {
        Ok(()) => dst.seal(&dst_acq.lease.lease_id).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            let _ = dst.release(&dst_acq.lease.lease_id).await;
            let _ = src.release(&src_acq.lease.lease_id).await;
            tracing::debug!("copied object {} across peers", object_id);
            Ok(())
        }
        Err(e) => {
            // Roll back the half-written destination copy.
            let _ = dst.discard(&dst_acq.lease.lease_id).await;
            let _ = src.release(&src_acq.lease.lease_id).await;
            Err(e)
        }
    }
}

/// Fetch-on-miss: consult the resolver for candidate holders, copy the
/// object from the first one that serves it, seal locally, and hand the
/// caller a local READ lease.
pub struct FetchOnMiss {
    resolver: Arc<dyn Resolver>,
    local: Arc<dyn Peer>,
    local_endpoint: Option<String>,
    cursor: AtomicUsize,
}

impl FetchOnMiss {
    pub fn new(resolver: Arc<dyn Resolver>, local: Arc<dyn Peer>) -> Self {
        Self {
            resolver,
            local,
            local_endpoint: None,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Endpoint to advertise in the resolver once a fetch lands locally.
    pub fn with_local_endpoint(mut self, endpoint: &str) -> Self {
        self.local_endpoint = Some(endpoint.to_string());
        self
    }

    pub async fn fetch(&self, object_id: &str) -> Result<AcquireResult> {
        let candidates = self.resolver.lookup(object_id).await?;
        if candidates.is_empty() {
            return Err(PackError::NotFound(object_id.to_string()));
        }

        // Round-robin the starting candidate across calls.
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        for i in 0..candidates.len() {
            let endpoint = &candidates[(start + i) % candidates.len()];
            match self.try_candidate(endpoint, object_id).await {
                Ok(result) => {
                    if let Some(local_endpoint) = &self.local_endpoint {
                        if let Err(e) =
                            self.resolver.register(object_id, local_endpoint).await
                        {
                            tracing::warn!("resolver register failed: {}", e);
                        }
                    }
                    return Ok(result);
                }
                // Stale entries are pruned only on an explicit Gone.
                Err(PackError::Gone(_)) => {
                    let _ = self.resolver.unregister(object_id, endpoint).await;
                    tracing::debug!("candidate {} reported gone", endpoint);
                }
                Err(PackError::NotFound(_))
                | Err(PackError::NotReady(_))
                | Err(PackError::Transport(_)) => {
                    tracing::debug!("candidate {} missed for {}", endpoint, object_id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(PackError::NotFound(object_id.to_string()))
    }

    async fn try_candidate(&self, endpoint: &str, object_id: &str) -> Result<AcquireResult> {
        let transport = connect_endpoint(endpoint)
            .map_err(|e| PackError::Transport(e.to_string()))?;
        let remote = transport
            .acquire(&AcquireRequest::read(object_id).with_ttl(FETCH_READ_TTL))
            .await?;

        let specs = remote.blobs.iter().map(BlobExport::spec).collect();
        let local_acq = match self
            .local
            .acquire(AcquireRequest::create(Some(object_id), specs))
            .await
        {
            Ok(acq) => acq,
            Err(e) => {
                // Local Full (or any local failure) aborts the fetch.
                let _ = transport.release(&remote.lease_id, None).await;
                return Err(e);
            }
        };

        let outcome = match copy_exports(&remote.blobs, &local_acq.blobs) {
            Ok(()) => self.local.seal(&local_acq.lease.lease_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            let _ = self.local.discard(&local_acq.lease.lease_id).await;
            let _ = transport.release(&remote.lease_id, None).await;
            return Err(e);
        }
        let _ = transport.release(&remote.lease_id, None).await;

        // The seal converted the creator's lease to READ; hand that back
        // with a fresh object snapshot.
        let object = self
            .local
            .stat(object_id)
            .await?
            .ok_or_else(|| PackError::Gone(object_id.to_string()))?;
        let mut lease = local_acq.lease;
        lease.flags = AccessFlags::READ;
        tracing::info!("fetched object {} from {}", object_id, endpoint);
        Ok(AcquireResult {
            lease,
            object,
            blobs: local_acq.blobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobSpec;
    use crate::peer::{LocalPeer, ObjectState};
    use crate::resolver::MemoryResolver;

    async fn seed(peer: &dyn Peer, id: &str, data: &[u8]) {
        let acq = peer
            .acquire(AcquireRequest::create(
                Some(id),
                vec![BlobSpec::mem(data.len() as u64)],
            ))
            .await
            .unwrap();
        acq.blobs[0].write_all(data).unwrap();
        peer.seal(&acq.lease.lease_id).await.unwrap();
        peer.release(&acq.lease.lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_between_peers_preserves_meta() {
        let src = LocalPeer::memory();
        let dst = LocalPeer::memory();

        let mut meta = crate::peer::UserMeta::new();
        meta.insert("label".to_string(), serde_json::json!("v1"));
        let acq = src
            .acquire(
                AcquireRequest::create(Some("m"), vec![BlobSpec::mem(3)])
                    .with_meta(meta)
                    .with_prev("m-0"),
            )
            .await
            .unwrap();
        acq.blobs[0].write_all(b"abc").unwrap();
        src.seal(&acq.lease.lease_id).await.unwrap();
        src.release(&acq.lease.lease_id).await.unwrap();

        copy_between_peers(src.as_ref(), dst.as_ref(), "m")
            .await
            .unwrap();

        let info = dst.stat("m").await.unwrap().unwrap();
        assert_eq!(info.state, ObjectState::Sealed);
        assert_eq!(info.meta.get("label"), Some(&serde_json::json!("v1")));
        assert_eq!(info.prev_objid.as_deref(), Some("m-0"));
        assert_eq!(info.hold_count, 0);

        let read = dst.acquire(AcquireRequest::read("m")).await.unwrap();
        assert_eq!(read.blobs[0].read_all().unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_fetch_on_miss_walks_candidates() {
        // "c" lives on the second candidate only; the first answers NotFound.
        let p1 = LocalPeer::memory();
        let p2 = named_peer_for_test("fetch-p2").await;
        let p3 = named_peer_for_test("fetch-p3").await;
        seed(p3.as_ref(), "c", b"remote bytes").await;

        let resolver = Arc::new(MemoryResolver::new());
        resolver
            .register("c", "memory://fetch-p2")
            .await
            .unwrap();
        resolver
            .register("c", "memory://fetch-p3")
            .await
            .unwrap();

        let fetcher = FetchOnMiss::new(resolver.clone(), p1.clone());
        // Walk all candidates regardless of the round-robin start.
        let result = fetcher.fetch("c").await.unwrap();
        assert_eq!(result.object.state, ObjectState::Sealed);
        assert_eq!(result.blobs[0].read_all().unwrap().as_ref(), b"remote bytes");
        assert!(result.lease.flags.contains(AccessFlags::READ));

        // The copy is now local; a plain read no longer needs the resolver.
        let read = p1.acquire(AcquireRequest::read("c")).await.unwrap();
        assert_eq!(read.blobs[0].read_all().unwrap().as_ref(), b"remote bytes");
        let _ = p2;
    }

    #[tokio::test]
    async fn test_fetch_without_candidates_is_not_found() {
        let local = LocalPeer::memory();
        let fetcher = FetchOnMiss::new(Arc::new(MemoryResolver::new()), local.clone());
        assert!(matches!(
            fetcher.fetch("nope").await,
            Err(PackError::NotFound(_))
        ));
    }

    async fn named_peer_for_test(name: &str) -> Arc<LocalPeer> {
        crate::peer::named_memory_peer(name)
    }
}
