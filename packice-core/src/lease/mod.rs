//! Lease records and lease stores.
//!
//! The lease store is the sole source of truth for lease validity. TTL
//! deadlines are compared on the monotonic clock; wall-clock timestamps
//! exist only for observability.

pub mod redis;

pub use redis::RedisLeaseStore;

use crate::error::{PackError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use ulid::Ulid;

/// TTLs below this floor are rejected at issue time.
pub const MIN_TTL: Duration = Duration::from_secs(1);

const CREATE_BIT: u8 = 0b001;
const READ_BIT: u8 = 0b010;
const WRITE_BIT: u8 = 0b100;

/// Access rights carried by a lease. CREATE implies WRITE; READ and CREATE
/// are mutually exclusive on the same lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags {
    bits: u8,
}

impl AccessFlags {
    pub const CREATE: Self = Self { bits: CREATE_BIT };
    pub const READ: Self = Self { bits: READ_BIT };
    pub const WRITE: Self = Self { bits: WRITE_BIT };

    pub fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// Apply the CREATE-implies-WRITE rule.
    pub fn normalized(self) -> Self {
        if self.contains(Self::CREATE) {
            self | Self::WRITE
        } else {
            self
        }
    }

    pub fn validate(self) -> Result<()> {
        if self.is_empty() {
            return Err(PackError::InvalidRequest("empty access flags".to_string()));
        }
        if self.contains(Self::CREATE) && self.contains(Self::READ) {
            return Err(PackError::InvalidRequest(
                "READ is incompatible with CREATE".to_string(),
            ));
        }
        Ok(())
    }

    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::CREATE) {
            names.push("CREATE");
        }
        if self.contains(Self::READ) {
            names.push("READ");
        }
        if self.contains(Self::WRITE) {
            names.push("WRITE");
        }
        names
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut flags = Self::default();
        for name in names {
            flags = flags
                | match name.as_ref() {
                    "CREATE" => Self::CREATE,
                    "READ" => Self::READ,
                    "WRITE" => Self::WRITE,
                    other => {
                        return Err(PackError::InvalidRequest(format!(
                            "unknown access flag: {}",
                            other
                        )))
                    }
                };
        }
        Ok(flags)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            bits: self.bits | rhs.bits,
        }
    }
}

impl Serialize for AccessFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for AccessFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FlagsVisitor;

        impl<'de> Visitor<'de> for FlagsVisitor {
            type Value = AccessFlags;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a list of access flag names")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut names: Vec<String> = Vec::new();
                while let Some(name) = seq.next_element::<String>()? {
                    names.push(name);
                }
                AccessFlags::from_names(&names).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_seq(FlagsVisitor)
    }
}

/// A lease as stored: identity, rights, and expiry shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lease_id: String,
    pub object_id: String,
    pub flags: AccessFlags,
    pub issued_at: DateTime<Utc>,
    /// `None` means the lease never expires and must be released explicitly.
    pub ttl_ms: Option<u64>,
}

impl LeaseRecord {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    pub fn explicit_release_only(&self) -> bool {
        self.ttl_ms.is_none()
    }
}

pub(crate) fn validate_ttl(ttl: Option<Duration>) -> Result<()> {
    if let Some(ttl) = ttl {
        if ttl < MIN_TTL {
            return Err(PackError::InvalidRequest(format!(
                "ttl {:?} below minimum {:?}",
                ttl, MIN_TTL
            )));
        }
    }
    Ok(())
}

pub(crate) fn mint_lease_id() -> String {
    Ulid::new().to_string()
}

/// Persistence for lease records.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Mint a new lease. Rejects TTLs below [`MIN_TTL`].
    async fn issue(
        &self,
        object_id: &str,
        flags: AccessFlags,
        ttl: Option<Duration>,
    ) -> Result<LeaseRecord>;

    /// Fetch a live lease. Expired or unknown leases yield `InvalidLease`.
    async fn lookup(&self, lease_id: &str) -> Result<LeaseRecord>;

    /// Remove a live lease and return its final record. Expired leases are
    /// left for the sweeper and reported as `InvalidLease`.
    async fn release(&self, lease_id: &str) -> Result<LeaseRecord>;

    /// Push the deadline of a TTL lease out by its original TTL. No-op for
    /// explicit-release leases.
    async fn renew(&self, lease_id: &str) -> Result<LeaseRecord>;

    /// Replace the flags of a live lease, keeping its expiry unchanged.
    async fn update_flags(&self, lease_id: &str, flags: AccessFlags) -> Result<()>;

    /// Remove and return every lease whose deadline has passed.
    async fn sweep_expired(&self) -> Result<Vec<LeaseRecord>>;
}

struct StoredLease {
    record: LeaseRecord,
    deadline: Option<Instant>,
}

impl StoredLease {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }
}

/// In-process lease store.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, StoredLease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredLease>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn issue(
        &self,
        object_id: &str,
        flags: AccessFlags,
        ttl: Option<Duration>,
    ) -> Result<LeaseRecord> {
        validate_ttl(ttl)?;
        let record = LeaseRecord {
            lease_id: mint_lease_id(),
            object_id: object_id.to_string(),
            flags,
            issued_at: Utc::now(),
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
        };
        let stored = StoredLease {
            record: record.clone(),
            deadline: ttl.map(|t| Instant::now() + t),
        };
        self.table().insert(record.lease_id.clone(), stored);
        Ok(record)
    }

    async fn lookup(&self, lease_id: &str) -> Result<LeaseRecord> {
        let table = self.table();
        match table.get(lease_id) {
            Some(stored) if !stored.expired(Instant::now()) => Ok(stored.record.clone()),
            _ => Err(PackError::InvalidLease(lease_id.to_string())),
        }
    }

    async fn release(&self, lease_id: &str) -> Result<LeaseRecord> {
        let mut table = self.table();
        match table.remove(lease_id) {
            Some(stored) if !stored.expired(Instant::now()) => Ok(stored.record),
            Some(expired) => {
                // Leave expired leases to the sweeper so hold counts settle.
                table.insert(lease_id.to_string(), expired);
                Err(PackError::InvalidLease(lease_id.to_string()))
            }
            None => Err(PackError::InvalidLease(lease_id.to_string())),
        }
    }

    async fn renew(&self, lease_id: &str) -> Result<LeaseRecord> {
        let mut table = self.table();
        match table.get_mut(lease_id) {
            Some(stored) if !stored.expired(Instant::now()) => {
                if let Some(ttl) = stored.record.ttl() {
                    stored.deadline = Some(Instant::now() + ttl);
                }
                Ok(stored.record.clone())
            }
            _ => Err(PackError::InvalidLease(lease_id.to_string())),
        }
    }

    async fn update_flags(&self, lease_id: &str, flags: AccessFlags) -> Result<()> {
        let mut table = self.table();
        match table.get_mut(lease_id) {
            Some(stored) if !stored.expired(Instant::now()) => {
                stored.record.flags = flags;
                Ok(())
            }
            _ => Err(PackError::InvalidLease(lease_id.to_string())),
        }
    }

    async fn sweep_expired(&self) -> Result<Vec<LeaseRecord>> {
        let now = Instant::now();
        let mut table = self.table();
        let expired: Vec<String> = table
            .iter()
            .filter(|(_, stored)| stored.expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|id| table.remove(&id))
            .map(|stored| stored.record)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_normalize_and_validate() {
        let flags = AccessFlags::CREATE.normalized();
        assert!(flags.contains(AccessFlags::WRITE));
        assert!(flags.validate().is_ok());
        assert!((AccessFlags::CREATE | AccessFlags::READ).validate().is_err());
        assert_eq!(flags.names(), vec!["CREATE", "WRITE"]);
    }

    #[test]
    fn test_flags_serde() {
        let flags = AccessFlags::CREATE | AccessFlags::WRITE;
        let json = serde_json::to_string(&flags).unwrap();
        assert_eq!(json, r#"["CREATE","WRITE"]"#);
        let back: AccessFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }

    #[tokio::test]
    async fn test_issue_lookup_release() {
        let store = MemoryLeaseStore::new();
        let lease = store
            .issue("obj", AccessFlags::READ, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(store.lookup(&lease.lease_id).await.unwrap().object_id, "obj");

        store.release(&lease.lease_id).await.unwrap();
        assert!(matches!(
            store.release(&lease.lease_id).await,
            Err(PackError::InvalidLease(_))
        ));
    }

    #[tokio::test]
    async fn test_ttl_floor_enforced() {
        let store = MemoryLeaseStore::new();
        let err = store
            .issue("obj", AccessFlags::READ, Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(err, Err(PackError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_sweep_returns_expired_records() {
        let store = MemoryLeaseStore::new();
        let lease = store
            .issue("obj", AccessFlags::READ, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        // Force expiry without waiting.
        store
            .table()
            .get_mut(&lease.lease_id)
            .expect("stored")
            .deadline = Some(Instant::now() - Duration::from_secs(1));

        assert!(matches!(
            store.lookup(&lease.lease_id).await,
            Err(PackError::InvalidLease(_))
        ));
        let swept = store.sweep_expired().await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].lease_id, lease.lease_id);
        assert!(store.sweep_expired().await.unwrap().is_empty());
    }
}
