use crate::blob::{Blob, BlobExport, BlobSpec, FileBlob, MemBlob, SharedFsBlob};
use crate::error::{PackError, Result};
use crate::lease::{validate_ttl, AccessFlags, LeaseRecord, LeaseStore};
use crate::peer::{
    AcquireRequest, AcquireResult, ObjectInfo, ObjectState, Peer, UserMeta, MAX_OBJECT_ID_LEN,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use ulid::Ulid;

/// Which blob backend a peer allocates from.
#[derive(Debug, Clone)]
pub enum BackendKind {
    Memory,
    File { root: PathBuf },
    SharedFs { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub backend: BackendKind,
    /// Object-count capacity. `None` means unbounded.
    pub max_objects: Option<usize>,
    /// Evict LRU sealed objects when at capacity. Tier compositions turn
    /// this off so `Full` surfaces and demotion can run instead.
    pub evict_on_full: bool,
    pub sweep_interval: Duration,
}

impl PeerConfig {
    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            max_objects: None,
            evict_on_full: true,
            sweep_interval: Duration::from_secs(1),
        }
    }

    pub fn file(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::File { root: root.into() },
            ..Self::memory()
        }
    }

    pub fn shared_fs(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::SharedFs { root: root.into() },
            ..Self::memory()
        }
    }

    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = Some(max_objects);
        self
    }

    pub fn without_eviction(mut self) -> Self {
        self.evict_on_full = false;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

struct ObjectInner {
    object_id: String,
    state: ObjectState,
    blobs: Vec<Blob>,
    meta: UserMeta,
    prev_objid: Option<String>,
    created_at: DateTime<Utc>,
    seal_ts: Option<DateTime<Utc>>,
    hold_count: u32,
    last_acquired: Instant,
    sealed_by: Option<String>,
    destroyed: bool,
}

struct ObjectEntry {
    inner: Mutex<ObjectInner>,
}

impl ObjectEntry {
    fn creating(object_id: String, meta: UserMeta, prev_objid: Option<String>) -> Self {
        Self {
            inner: Mutex::new(ObjectInner {
                object_id,
                state: ObjectState::Creating,
                blobs: Vec::new(),
                meta,
                prev_objid,
                created_at: Utc::now(),
                seal_ts: None,
                hold_count: 0,
                last_acquired: Instant::now(),
                sealed_by: None,
                destroyed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ObjectInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single-node peer: object table, lease issuance, LRU eviction.
///
/// The object table is guarded by a coarse lock, each object record by its
/// own; lock order is always table before record, and neither is held
/// across blob I/O or lease-store awaits.
pub struct LocalPeer {
    config: PeerConfig,
    lease_store: Arc<dyn LeaseStore>,
    objects: RwLock<HashMap<String, Arc<ObjectEntry>>>,
    degraded: AtomicBool,
}

impl LocalPeer {
    pub fn new(config: PeerConfig, lease_store: Arc<dyn LeaseStore>) -> Result<Arc<Self>> {
        match &config.backend {
            BackendKind::File { root } | BackendKind::SharedFs { root } => {
                std::fs::create_dir_all(root)?;
            }
            BackendKind::Memory => {}
        }
        Ok(Arc::new(Self {
            config,
            lease_store,
            objects: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }))
    }

    /// Private memory-backed peer with an in-process lease store.
    pub fn memory() -> Arc<Self> {
        Arc::new(Self {
            config: PeerConfig::memory(),
            lease_store: Arc::new(crate::lease::MemoryLeaseStore::new()),
            objects: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Periodically sweep expired leases through the release path. The task
    /// stops once the peer itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(peer) = weak.upgrade() else { break };
                match peer.lease_store.sweep_expired().await {
                    Ok(expired) => {
                        for record in expired {
                            tracing::debug!(
                                "lease {} on {} expired",
                                record.lease_id,
                                record.object_id
                            );
                            peer.apply_release(&record);
                        }
                    }
                    Err(e) => tracing::warn!("lease sweep failed: {}", e),
                }
            }
        })
    }

    fn table_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ObjectEntry>>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn table_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ObjectEntry>>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }

    fn get_entry(&self, object_id: &str) -> Result<Arc<ObjectEntry>> {
        self.table_read()
            .get(object_id)
            .cloned()
            .ok_or_else(|| PackError::NotFound(object_id.to_string()))
    }

    fn remove_entry(&self, object_id: &str) {
        self.table_write().remove(object_id);
    }

    /// Mark degraded on backend IO failures; further acquires are rejected.
    fn note_backend_error(&self, err: &PackError) {
        if matches!(err, PackError::Io(_)) {
            self.degraded.store(true, Ordering::Relaxed);
            tracing::error!("backend IO failure, peer entering degraded mode: {}", err);
        }
    }

    fn check_not_degraded(&self) -> Result<()> {
        if self.degraded.load(Ordering::Relaxed) {
            return Err(PackError::Internal("peer is degraded".to_string()));
        }
        Ok(())
    }

    fn allocate_blobs(&self, object_id: &str, specs: &[BlobSpec]) -> Result<Vec<Blob>> {
        let mut blobs = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let blob = match &self.config.backend {
                BackendKind::Memory => {
                    Blob::Mem(MemBlob::create(&format!("{}-{}", object_id, index), spec.size)?)
                }
                BackendKind::File { root } => {
                    Blob::File(FileBlob::create(root, object_id, index, spec.size)?)
                }
                BackendKind::SharedFs { root } => {
                    Blob::SharedFs(SharedFsBlob::create(root, object_id, index, spec.size)?)
                }
            };
            blobs.push(blob);
        }
        Ok(blobs)
    }

    /// Evict LRU sealed, unheld objects until there is room for one more.
    /// Ties on last-acquire time break toward the smaller object id.
    fn make_room(
        &self,
        table: &mut HashMap<String, Arc<ObjectEntry>>,
    ) -> Result<Vec<Arc<ObjectEntry>>> {
        let Some(cap) = self.config.max_objects else {
            return Ok(Vec::new());
        };
        if table.len() >= cap && !self.config.evict_on_full {
            return Err(PackError::Full("capacity reached".to_string()));
        }
        let mut victims = Vec::new();
        while table.len() >= cap {
            let mut best: Option<(Instant, String)> = None;
            for (id, entry) in table.iter() {
                let inner = entry.lock();
                if inner.state == ObjectState::Sealed
                    && inner.hold_count == 0
                    && !inner.destroyed
                {
                    let key = (inner.last_acquired, id.clone());
                    if best.as_ref().is_none_or(|b| key < *b) {
                        best = Some(key);
                    }
                }
            }
            let Some((_, victim_id)) = best else {
                return Err(PackError::Full(
                    "capacity exhausted and no evictable object".to_string(),
                ));
            };
            if let Some(entry) = table.remove(&victim_id) {
                entry.lock().destroyed = true;
                tracing::info!("evicting {} (lru)", victim_id);
                victims.push(entry);
            }
        }
        Ok(victims)
    }

    fn destroy_entry_blobs(&self, entry: &ObjectEntry) {
        let blobs = {
            let mut inner = entry.lock();
            inner.destroyed = true;
            std::mem::take(&mut inner.blobs)
        };
        for mut blob in blobs {
            if let Err(e) = blob.destroy() {
                tracing::warn!("failed to destroy blob: {}", e);
            }
        }
    }

    fn apply_release(&self, record: &LeaseRecord) {
        let entry = match self.table_read().get(&record.object_id).cloned() {
            Some(entry) => entry,
            None => return,
        };
        let destroy = {
            let mut inner = entry.lock();
            if inner.destroyed {
                return;
            }
            inner.hold_count = inner.hold_count.saturating_sub(1);
            // Releasing the sole write lease of an unsealed object kills it.
            inner.state == ObjectState::Creating && record.flags.contains(AccessFlags::WRITE)
        };
        if destroy {
            self.remove_entry(&record.object_id);
            self.destroy_entry_blobs(&entry);
            tracing::debug!("destroyed unsealed object {}", record.object_id);
        }
    }

    async fn acquire_create(
        &self,
        req: AcquireRequest,
        flags: AccessFlags,
    ) -> Result<AcquireResult> {
        let object_id = match req.object_id {
            Some(id) => {
                validate_object_id(&id)?;
                id
            }
            None => Ulid::new().to_string(),
        };
        if req.blob_specs.is_empty() {
            return Err(PackError::InvalidRequest(
                "blob_specs required for CREATE".to_string(),
            ));
        }

        // Reserve the slot first; the table lock serializes CREATE per id.
        let (entry, victims) = {
            let mut table = self.table_write();
            if table.contains_key(&object_id) {
                return Err(PackError::Exists(object_id));
            }
            let victims = self.make_room(&mut table)?;
            let entry = Arc::new(ObjectEntry::creating(
                object_id.clone(),
                req.meta,
                req.prev_objid,
            ));
            table.insert(object_id.clone(), entry.clone());
            (entry, victims)
        };
        for victim in &victims {
            self.destroy_entry_blobs(victim);
        }

        let blobs = match self.allocate_blobs(&object_id, &req.blob_specs) {
            Ok(blobs) => blobs,
            Err(e) => {
                self.remove_entry(&object_id);
                self.note_backend_error(&e);
                return Err(e);
            }
        };

        let lease = match self.lease_store.issue(&object_id, flags, req.ttl).await {
            Ok(lease) => lease,
            Err(e) => {
                self.remove_entry(&object_id);
                for mut blob in blobs {
                    let _ = blob.destroy();
                }
                return Err(e);
            }
        };

        let (object, exports) = {
            let mut inner = entry.lock();
            inner.blobs = blobs;
            inner.hold_count = 1;
            inner.last_acquired = Instant::now();
            let exports = export_all(&inner)?;
            (object_info(&inner), exports)
        };
        tracing::debug!("created object {} ({} blobs)", object_id, exports.len());
        Ok(AcquireResult {
            lease,
            object,
            blobs: exports,
        })
    }

    async fn acquire_read(&self, req: AcquireRequest, flags: AccessFlags) -> Result<AcquireResult> {
        let object_id = req.object_id.ok_or_else(|| {
            PackError::InvalidRequest("object_id required for READ".to_string())
        })?;
        validate_object_id(&object_id)?;

        let entry = self.get_entry(&object_id)?;
        {
            let inner = entry.lock();
            if inner.destroyed {
                return Err(PackError::NotFound(object_id));
            }
            if inner.state == ObjectState::Creating {
                return Err(PackError::NotReady(object_id));
            }
        }

        let lease = self.lease_store.issue(&object_id, flags, req.ttl).await?;

        // Revalidate: the object may have been discarded or evicted while
        // the lease store call was in flight.
        let outcome: Result<Option<(ObjectInfo, Vec<BlobExport>)>> = (|| {
            let mut inner = entry.lock();
            if inner.destroyed || inner.state != ObjectState::Sealed {
                return Ok(None);
            }
            let exports = export_all(&inner)?;
            inner.hold_count += 1;
            inner.last_acquired = Instant::now();
            Ok(Some((object_info(&inner), exports)))
        })();

        match outcome {
            Ok(Some((object, exports))) => Ok(AcquireResult {
                lease,
                object,
                blobs: exports,
            }),
            Ok(None) => {
                let _ = self.lease_store.release(&lease.lease_id).await;
                Err(PackError::Gone(object_id))
            }
            Err(e) => {
                let _ = self.lease_store.release(&lease.lease_id).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Peer for LocalPeer {
    async fn acquire(&self, req: AcquireRequest) -> Result<AcquireResult> {
        self.check_not_degraded()?;
        let flags = req.flags.normalized();
        flags.validate()?;
        validate_ttl(req.ttl)?;

        if flags.contains(AccessFlags::CREATE) {
            self.acquire_create(req, flags).await
        } else if flags.contains(AccessFlags::READ) {
            self.acquire_read(req, flags).await
        } else {
            Err(PackError::Forbidden(
                "acquire requires CREATE or READ".to_string(),
            ))
        }
    }

    async fn seal(&self, lease_id: &str) -> Result<()> {
        let lease = self.lease_store.lookup(lease_id).await?;
        let entry = self
            .get_entry(&lease.object_id)
            .map_err(|_| PackError::Gone(lease.object_id.clone()))?;

        let sealed_now = {
            let mut inner = entry.lock();
            match inner.state {
                ObjectState::Sealed => {
                    // Idempotent only for the lease that performed the seal.
                    if inner.sealed_by.as_deref() == Some(lease_id) {
                        false
                    } else {
                        return Err(PackError::Forbidden(
                            "seal requires a WRITE lease".to_string(),
                        ));
                    }
                }
                ObjectState::Creating => {
                    if !lease.flags.contains(AccessFlags::WRITE) {
                        return Err(PackError::Forbidden(
                            "seal requires a WRITE lease".to_string(),
                        ));
                    }
                    for blob in &mut inner.blobs {
                        if let Err(e) = blob.seal() {
                            self.note_backend_error(&e);
                            return Err(e);
                        }
                    }
                    inner.state = ObjectState::Sealed;
                    inner.seal_ts = Some(Utc::now());
                    inner.sealed_by = Some(lease_id.to_string());
                    true
                }
            }
        };

        if sealed_now {
            // The sealer keeps reading through the same lease.
            self.lease_store
                .update_flags(lease_id, AccessFlags::READ)
                .await?;
            tracing::debug!("sealed object {}", lease.object_id);
        }
        Ok(())
    }

    async fn discard(&self, lease_id: &str) -> Result<()> {
        let lease = self.lease_store.lookup(lease_id).await?;
        if !lease.flags.contains(AccessFlags::CREATE) && !lease.flags.contains(AccessFlags::WRITE)
        {
            return Err(PackError::Forbidden(
                "discard requires a CREATE or WRITE lease".to_string(),
            ));
        }
        let entry = self
            .get_entry(&lease.object_id)
            .map_err(|_| PackError::Gone(lease.object_id.clone()))?;
        {
            let mut inner = entry.lock();
            if inner.state != ObjectState::Creating {
                return Err(PackError::Forbidden(
                    "cannot discard a sealed object".to_string(),
                ));
            }
            inner.destroyed = true;
        }
        self.remove_entry(&lease.object_id);
        self.destroy_entry_blobs(&entry);
        let _ = self.lease_store.release(lease_id).await;
        tracing::info!("discarded object {}", lease.object_id);
        Ok(())
    }

    async fn release(&self, lease_id: &str) -> Result<()> {
        let record = self.lease_store.release(lease_id).await?;
        self.apply_release(&record);
        Ok(())
    }

    async fn renew(&self, lease_id: &str) -> Result<()> {
        self.lease_store.renew(lease_id).await.map(|_| ())
    }

    async fn stat(&self, object_id: &str) -> Result<Option<ObjectInfo>> {
        let entry = match self.table_read().get(object_id).cloned() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let inner = entry.lock();
        if inner.destroyed {
            return Ok(None);
        }
        Ok(Some(object_info(&inner)))
    }

    async fn evict(&self, object_id: &str) -> Result<()> {
        let entry = self.get_entry(object_id)?;
        {
            let mut inner = entry.lock();
            if inner.state != ObjectState::Sealed {
                return Err(PackError::Forbidden(
                    "cannot evict an unsealed object".to_string(),
                ));
            }
            if inner.hold_count > 0 {
                return Err(PackError::Forbidden("object is held".to_string()));
            }
            inner.destroyed = true;
        }
        self.remove_entry(object_id);
        self.destroy_entry_blobs(&entry);
        tracing::debug!("evicted object {}", object_id);
        Ok(())
    }
}

fn validate_object_id(object_id: &str) -> Result<()> {
    if object_id.is_empty() {
        return Err(PackError::InvalidRequest("empty object id".to_string()));
    }
    if object_id.len() > MAX_OBJECT_ID_LEN {
        return Err(PackError::InvalidRequest(format!(
            "object id longer than {} bytes",
            MAX_OBJECT_ID_LEN
        )));
    }
    Ok(())
}

fn object_info(inner: &ObjectInner) -> ObjectInfo {
    ObjectInfo {
        object_id: inner.object_id.clone(),
        state: inner.state,
        blob_specs: inner.blobs.iter().map(Blob::spec).collect(),
        meta: inner.meta.clone(),
        prev_objid: inner.prev_objid.clone(),
        created_at: inner.created_at,
        seal_ts: inner.seal_ts,
        hold_count: inner.hold_count,
    }
}

fn export_all(inner: &ObjectInner) -> Result<Vec<BlobExport>> {
    inner
        .blobs
        .iter()
        .map(|blob| {
            Ok(BlobExport {
                kind: blob.kind(),
                size: blob.size(),
                handle: blob.export()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobKind;

    fn mem_peer() -> Arc<LocalPeer> {
        LocalPeer::memory()
    }

    fn mem_peer_with_cap(cap: usize) -> Arc<LocalPeer> {
        LocalPeer::new(
            PeerConfig::memory().with_max_objects(cap),
            Arc::new(crate::lease::MemoryLeaseStore::new()),
        )
        .unwrap()
    }

    async fn create_sealed(peer: &LocalPeer, id: &str, data: &[u8]) {
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
    async fn test_create_seal_read_round_trip() {
        let peer = mem_peer();
        let acq = peer
            .acquire(AcquireRequest::create(Some("k1"), vec![BlobSpec::mem(11)]))
            .await
            .unwrap();
        assert_eq!(acq.object.state, ObjectState::Creating);
        acq.blobs[0].write_all(b"hello world").unwrap();
        peer.seal(&acq.lease.lease_id).await.unwrap();

        let read = peer.acquire(AcquireRequest::read("k1")).await.unwrap();
        assert_eq!(read.object.state, ObjectState::Sealed);
        assert_eq!(read.blobs[0].read_all().unwrap().as_ref(), b"hello world");
        assert_eq!(read.blobs[0].kind, BlobKind::Mem);
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let peer = mem_peer();
        create_sealed(&peer, "dup", b"x").await;
        let err = peer
            .acquire(AcquireRequest::create(Some("dup"), vec![BlobSpec::mem(1)]))
            .await;
        assert!(matches!(err, Err(PackError::Exists(_))));
    }

    #[tokio::test]
    async fn test_read_misses() {
        let peer = mem_peer();
        assert!(matches!(
            peer.acquire(AcquireRequest::read("absent")).await,
            Err(PackError::NotFound(_))
        ));

        let acq = peer
            .acquire(AcquireRequest::create(Some("wip"), vec![BlobSpec::mem(1)]))
            .await
            .unwrap();
        assert!(matches!(
            peer.acquire(AcquireRequest::read("wip")).await,
            Err(PackError::NotReady(_))
        ));
        peer.discard(&acq.lease.lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_seal_is_idempotent_for_sealer_only() {
        let peer = mem_peer();
        let acq = peer
            .acquire(AcquireRequest::create(Some("k"), vec![BlobSpec::mem(1)]))
            .await
            .unwrap();
        peer.seal(&acq.lease.lease_id).await.unwrap();
        peer.seal(&acq.lease.lease_id).await.unwrap();

        let reader = peer.acquire(AcquireRequest::read("k")).await.unwrap();
        assert!(matches!(
            peer.seal(&reader.lease.lease_id).await,
            Err(PackError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_discard_rolls_back() {
        let peer = mem_peer_with_cap(1);
        let acq = peer
            .acquire(AcquireRequest::create(Some("d"), vec![BlobSpec::mem(8)]))
            .await
            .unwrap();
        acq.blobs[0].write_all(b"part").unwrap();
        peer.discard(&acq.lease.lease_id).await.unwrap();

        assert!(matches!(
            peer.acquire(AcquireRequest::read("d")).await,
            Err(PackError::NotFound(_))
        ));
        // Capacity is back to the pre-create state.
        create_sealed(&peer, "d2", b"y").await;
    }

    #[tokio::test]
    async fn test_discard_sealed_is_forbidden() {
        let peer = mem_peer();
        let acq = peer
            .acquire(AcquireRequest::create(Some("s"), vec![BlobSpec::mem(1)]))
            .await
            .unwrap();
        peer.seal(&acq.lease.lease_id).await.unwrap();
        assert!(matches!(
            peer.discard(&acq.lease.lease_id).await,
            Err(PackError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_release_unsealed_destroys() {
        let peer = mem_peer();
        let acq = peer
            .acquire(AcquireRequest::create(Some("u"), vec![BlobSpec::mem(1)]))
            .await
            .unwrap();
        peer.release(&acq.lease.lease_id).await.unwrap();
        assert!(peer.stat("u").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_release_is_invalid_lease() {
        let peer = mem_peer();
        create_sealed(&peer, "r", b"z").await;
        let read = peer.acquire(AcquireRequest::read("r")).await.unwrap();
        peer.release(&read.lease.lease_id).await.unwrap();
        assert!(matches!(
            peer.release(&read.lease.lease_id).await,
            Err(PackError::InvalidLease(_))
        ));
        // The object itself is unharmed.
        assert!(peer.stat("r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction_skips_held_objects() {
        let peer = mem_peer_with_cap(2);
        create_sealed(&peer, "a", b"a").await;
        create_sealed(&peer, "b", b"b").await;

        // Hold "a"; the LRU candidate must then be "b".
        let hold_a = peer.acquire(AcquireRequest::read("a")).await.unwrap();
        create_sealed(&peer, "c", b"c").await;

        assert!(peer.stat("a").await.unwrap().is_some());
        assert!(peer.stat("b").await.unwrap().is_none());
        assert!(peer.stat("c").await.unwrap().is_some());
        peer.release(&hold_a.lease.lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_when_everything_held() {
        let peer = mem_peer_with_cap(1);
        let acq = peer
            .acquire(AcquireRequest::create(Some("h"), vec![BlobSpec::mem(1)]))
            .await
            .unwrap();
        peer.seal(&acq.lease.lease_id).await.unwrap();
        // Still held by the sealer's converted READ lease.
        let err = peer
            .acquire(AcquireRequest::create(Some("h2"), vec![BlobSpec::mem(1)]))
            .await;
        assert!(matches!(err, Err(PackError::Full(_))));
    }

    #[tokio::test]
    async fn test_zero_size_blob_round_trip() {
        let peer = mem_peer();
        let acq = peer
            .acquire(AcquireRequest::create(Some("z"), vec![BlobSpec::mem(0)]))
            .await
            .unwrap();
        peer.seal(&acq.lease.lease_id).await.unwrap();
        let read = peer.acquire(AcquireRequest::read("z")).await.unwrap();
        assert!(read.blobs[0].read_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_sweep_decrements_hold() {
        let peer = LocalPeer::new(
            PeerConfig::memory().with_sweep_interval(Duration::from_millis(50)),
            Arc::new(crate::lease::MemoryLeaseStore::new()),
        )
        .unwrap();
        let sweeper = peer.spawn_sweeper();

        create_sealed(&peer, "e", b"e").await;
        let read = peer
            .acquire(AcquireRequest::read("e").with_ttl(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(peer.stat("e").await.unwrap().unwrap().hold_count, 1);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(matches!(
            peer.release(&read.lease.lease_id).await,
            Err(PackError::InvalidLease(_))
        ));
        assert_eq!(peer.stat("e").await.unwrap().unwrap().hold_count, 0);
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let peer = LocalPeer::new(
            PeerConfig::file(dir.path()),
            Arc::new(crate::lease::MemoryLeaseStore::new()),
        )
        .unwrap();
        let acq = peer
            .acquire(AcquireRequest::create(Some("f"), vec![BlobSpec::file(3)]))
            .await
            .unwrap();
        acq.blobs[0].write_all(b"abc").unwrap();
        peer.seal(&acq.lease.lease_id).await.unwrap();
        let read = peer.acquire(AcquireRequest::read("f")).await.unwrap();
        assert_eq!(read.blobs[0].read_all().unwrap().as_ref(), b"abc");
    }
}
