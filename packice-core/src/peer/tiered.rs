use crate::error::{PackError, Result};
use crate::lease::AccessFlags;
use crate::peer::{AcquireRequest, AcquireResult, ObjectInfo, ObjectState, Peer};
use crate::transfer::copy_between_peers;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TieredConfig {
    /// How many demotions to attempt before a CREATE reports `Full`.
    pub demote_retries: u32,
    /// Copy cold hits hot-ward in the background.
    pub promote_on_read: bool,
    /// Objects above this total size are never promoted.
    pub promote_max_bytes: u64,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            demote_retries: 3,
            promote_on_read: true,
            promote_max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Hot/cold composite peer.
///
/// Creation lands in the hot tier; when hot is full the least-recently
/// acquired sealed object is demoted to cold through the internal copy
/// protocol. Reads prefer hot, fall back to cold, and may promote in the
/// background without ever blocking the reader. An object lives in exactly
/// one tier at a time, except transiently while a copy is in flight.
pub struct TieredPeer {
    hot: Arc<dyn Peer>,
    cold: Arc<dyn Peer>,
    config: TieredConfig,
    /// Hot-resident ids, oldest acquire first. Entries may go stale; the
    /// demotion scan revalidates against the hot tier and prunes.
    lru: Arc<Mutex<Vec<String>>>,
}

impl TieredPeer {
    pub fn new(hot: Arc<dyn Peer>, cold: Arc<dyn Peer>) -> Self {
        Self {
            hot,
            cold,
            config: TieredConfig::default(),
            lru: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_config(mut self, config: TieredConfig) -> Self {
        self.config = config;
        self
    }

    fn touch(&self, object_id: &str) {
        let mut lru = self.lru.lock().unwrap_or_else(|e| e.into_inner());
        lru.retain(|id| id != object_id);
        lru.push(object_id.to_string());
    }

    fn forget(lru: &Mutex<Vec<String>>, object_id: &str) {
        let mut lru = lru.lock().unwrap_or_else(|e| e.into_inner());
        lru.retain(|id| id != object_id);
    }

    /// Demote the LRU sealed, unheld hot object to cold. Returns whether
    /// anything moved.
    async fn demote_one(&self) -> Result<bool> {
        let candidates: Vec<String> = {
            let lru = self.lru.lock().unwrap_or_else(|e| e.into_inner());
            lru.clone()
        };
        for object_id in candidates {
            let info = match self.hot.stat(&object_id).await? {
                Some(info) => info,
                None => {
                    Self::forget(&self.lru, &object_id);
                    continue;
                }
            };
            if info.state != ObjectState::Sealed || info.hold_count > 0 {
                continue;
            }

            copy_between_peers(self.hot.as_ref(), self.cold.as_ref(), &object_id).await?;
            match self.hot.evict(&object_id).await {
                Ok(()) => {
                    Self::forget(&self.lru, &object_id);
                    tracing::info!("demoted {} to cold tier", object_id);
                    return Ok(true);
                }
                Err(e) => {
                    // A reader raced in; undo the cold copy and move on.
                    tracing::debug!("demotion of {} backed out: {}", object_id, e);
                    let _ = self.cold.evict(&object_id).await;
                }
            }
        }
        Ok(false)
    }

    fn spawn_promotion(&self, object_id: &str) {
        let hot = self.hot.clone();
        let cold = self.cold.clone();
        let lru = self.lru.clone();
        let object_id = object_id.to_string();
        tokio::spawn(async move {
            match copy_between_peers(cold.as_ref(), hot.as_ref(), &object_id).await {
                Ok(()) => {
                    {
                        let mut guard = lru.lock().unwrap_or_else(|e| e.into_inner());
                        guard.retain(|id| id != &object_id);
                        guard.push(object_id.clone());
                    }
                    // Retire the cold copy once its readers drain.
                    for _ in 0..25 {
                        match cold.evict(&object_id).await {
                            Ok(()) | Err(PackError::NotFound(_)) => return,
                            Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
                        }
                    }
                    tracing::warn!("cold copy of {} still held after promotion", object_id);
                }
                Err(PackError::Full(_)) => {
                    tracing::debug!("promotion of {} skipped: hot tier full", object_id);
                }
                Err(e) => tracing::debug!("promotion of {} failed: {}", object_id, e),
            }
        });
    }

    async fn acquire_create(&self, req: AcquireRequest) -> Result<AcquireResult> {
        if let Some(object_id) = &req.object_id {
            if self.cold.stat(object_id).await?.is_some() {
                return Err(PackError::Exists(object_id.clone()));
            }
        }
        let mut attempts = 0;
        loop {
            match self.hot.acquire(req.clone()).await {
                Ok(result) => {
                    self.touch(&result.object.object_id);
                    return Ok(result);
                }
                Err(PackError::Full(reason)) => {
                    if attempts >= self.config.demote_retries || !self.demote_one().await? {
                        return Err(PackError::Full(reason));
                    }
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn acquire_read(&self, req: AcquireRequest) -> Result<AcquireResult> {
        let object_id = req
            .object_id
            .clone()
            .ok_or_else(|| PackError::InvalidRequest("object_id required for READ".to_string()))?;

        if self.hot.stat(&object_id).await?.is_some() {
            let result = self.hot.acquire(req).await?;
            self.touch(&object_id);
            return Ok(result);
        }

        match self.cold.stat(&object_id).await? {
            Some(info) => {
                if info.state == ObjectState::Sealed
                    && self.config.promote_on_read
                    && total_size(&info) <= self.config.promote_max_bytes
                {
                    self.spawn_promotion(&object_id);
                }
                // Serve from cold in the meantime; promotion never blocks.
                self.cold.acquire(req).await
            }
            None => Err(PackError::NotFound(object_id)),
        }
    }
}

fn total_size(info: &ObjectInfo) -> u64 {
    info.blob_specs.iter().map(|spec| spec.size).sum()
}

#[async_trait]
impl Peer for TieredPeer {
    async fn acquire(&self, req: AcquireRequest) -> Result<AcquireResult> {
        let flags = req.flags.normalized();
        flags.validate()?;
        if flags.contains(AccessFlags::CREATE) {
            self.acquire_create(req).await
        } else if flags.contains(AccessFlags::READ) {
            self.acquire_read(req).await
        } else {
            Err(PackError::Forbidden(
                "acquire requires CREATE or READ".to_string(),
            ))
        }
    }

    async fn seal(&self, lease_id: &str) -> Result<()> {
        match self.hot.seal(lease_id).await {
            Err(PackError::InvalidLease(_)) => self.cold.seal(lease_id).await,
            other => other,
        }
    }

    async fn discard(&self, lease_id: &str) -> Result<()> {
        match self.hot.discard(lease_id).await {
            Err(PackError::InvalidLease(_)) => self.cold.discard(lease_id).await,
            other => other,
        }
    }

    async fn release(&self, lease_id: &str) -> Result<()> {
        match self.hot.release(lease_id).await {
            Err(PackError::InvalidLease(_)) => self.cold.release(lease_id).await,
            other => other,
        }
    }

    async fn renew(&self, lease_id: &str) -> Result<()> {
        match self.hot.renew(lease_id).await {
            Err(PackError::InvalidLease(_)) => self.cold.renew(lease_id).await,
            other => other,
        }
    }

    async fn stat(&self, object_id: &str) -> Result<Option<ObjectInfo>> {
        if let Some(info) = self.hot.stat(object_id).await? {
            return Ok(Some(info));
        }
        self.cold.stat(object_id).await
    }

    async fn evict(&self, object_id: &str) -> Result<()> {
        match self.hot.evict(object_id).await {
            Err(PackError::NotFound(_)) => self.cold.evict(object_id).await,
            other => {
                if other.is_ok() {
                    Self::forget(&self.lru, object_id);
                }
                other
            }
        }
    }
}
