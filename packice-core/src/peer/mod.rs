//! Peer trait and object model.
//!
//! A peer is the control plane of one node: it owns the object table,
//! issues leases, and drives the CREATING -> SEALED lifecycle. Data-plane
//! I/O never passes through a peer; clients get blob handles instead.

pub mod local;
pub mod registry;
pub mod tiered;

pub use local::{BackendKind, LocalPeer, PeerConfig};
pub use registry::named_memory_peer;
pub use tiered::{TieredConfig, TieredPeer};

use crate::blob::{BlobExport, BlobSpec};
use crate::error::Result;
use crate::lease::{AccessFlags, LeaseRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest accepted object id, in bytes.
pub const MAX_OBJECT_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectState {
    Creating,
    Sealed,
}

/// User-supplied metadata bag attached to an object at creation.
pub type UserMeta = serde_json::Map<String, serde_json::Value>;

/// Inputs to `Acquire`.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Required for READ; optional for CREATE (one is minted when absent).
    pub object_id: Option<String>,
    pub flags: AccessFlags,
    /// `None` means the lease never expires and must be released explicitly.
    pub ttl: Option<Duration>,
    pub meta: UserMeta,
    pub prev_objid: Option<String>,
    /// Shapes of the blobs to allocate. CREATE only.
    pub blob_specs: Vec<BlobSpec>,
}

impl AcquireRequest {
    pub fn create(object_id: Option<&str>, blob_specs: Vec<BlobSpec>) -> Self {
        Self {
            object_id: object_id.map(str::to_string),
            flags: AccessFlags::CREATE,
            ttl: None,
            meta: UserMeta::new(),
            prev_objid: None,
            blob_specs,
        }
    }

    pub fn read(object_id: &str) -> Self {
        Self {
            object_id: Some(object_id.to_string()),
            flags: AccessFlags::READ,
            ttl: None,
            meta: UserMeta::new(),
            prev_objid: None,
            blob_specs: Vec::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_meta(mut self, meta: UserMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_prev(mut self, prev_objid: &str) -> Self {
        self.prev_objid = Some(prev_objid.to_string());
        self
    }
}

/// Snapshot of an object's control-plane attributes.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub object_id: String,
    pub state: ObjectState,
    pub blob_specs: Vec<BlobSpec>,
    pub meta: UserMeta,
    pub prev_objid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub seal_ts: Option<DateTime<Utc>>,
    pub hold_count: u32,
}

/// Result of a successful `Acquire`: the lease, the object snapshot, and
/// exported blob handles for direct I/O.
#[derive(Debug)]
pub struct AcquireResult {
    pub lease: LeaseRecord,
    pub object: ObjectInfo,
    pub blobs: Vec<BlobExport>,
}

/// The peer contract. Both the local peer and composites implement it, so
/// transports and tiering never care which they are talking to.
#[async_trait]
pub trait Peer: Send + Sync {
    async fn acquire(&self, req: AcquireRequest) -> Result<AcquireResult>;

    /// Freeze the object: flush blobs, mark SEALED, convert the holder's
    /// lease to READ with unchanged expiry. Idempotent per sealing lease.
    async fn seal(&self, lease_id: &str) -> Result<()>;

    /// Destroy an unsealed object and release its write lease.
    async fn discard(&self, lease_id: &str) -> Result<()>;

    /// Drop a lease and decrement the object's hold count.
    async fn release(&self, lease_id: &str) -> Result<()>;

    /// Extend a TTL lease by its original TTL.
    async fn renew(&self, lease_id: &str) -> Result<()>;

    /// Control-plane lookup without taking a lease.
    async fn stat(&self, object_id: &str) -> Result<Option<ObjectInfo>>;

    /// Remove a sealed, unheld object. Used by eviction policies and tier
    /// movement; fails with `Forbidden` if the object is held or unsealed.
    async fn evict(&self, object_id: &str) -> Result<()>;
}
