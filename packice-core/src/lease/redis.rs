use crate::error::{PackError, Result};
use crate::lease::{mint_lease_id, validate_ttl, AccessFlags, LeaseRecord, LeaseStore};
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis-backed lease store for distributed lease state.
///
/// Records live at `{ns}:lease:{id}`; TTL leases are additionally indexed
/// in the `{ns}:lease-exp` sorted set by their wall-clock deadline so the
/// sweeper can pop due entries with a single range query.
pub struct RedisLeaseStore {
    conn: redis::aio::MultiplexedConnection,
    namespace: String,
}

#[derive(Serialize, Deserialize)]
struct StoredValue {
    record: LeaseRecord,
    expires_at_ms: Option<u64>,
}

impl RedisLeaseStore {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| PackError::Config(format!("redis url: {}", e)))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn lease_key(&self, lease_id: &str) -> String {
        format!("{}:lease:{}", self.namespace, lease_id)
    }

    fn exp_key(&self) -> String {
        format!("{}:lease-exp", self.namespace)
    }

    async fn load(&self, lease_id: &str) -> Result<Option<StoredValue>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.lease_key(lease_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, value: &StoredValue) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.lease_key(&value.record.lease_id);
        let payload = serde_json::to_string(value)?;
        let _: () = conn.set(&key, payload).await?;
        if let Some(deadline) = value.expires_at_ms {
            let _: () = conn
                .zadd(self.exp_key(), &value.record.lease_id, deadline)
                .await?;
        }
        Ok(())
    }

    fn live(value: &StoredValue) -> bool {
        match value.expires_at_ms {
            Some(deadline) => (Utc::now().timestamp_millis() as u64) < deadline,
            None => true,
        }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
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
        let value = StoredValue {
            expires_at_ms: record
                .ttl_ms
                .map(|ttl| Utc::now().timestamp_millis() as u64 + ttl),
            record: record.clone(),
        };
        self.store(&value).await?;
        Ok(record)
    }

    async fn lookup(&self, lease_id: &str) -> Result<LeaseRecord> {
        match self.load(lease_id).await? {
            Some(value) if Self::live(&value) => Ok(value.record),
            _ => Err(PackError::InvalidLease(lease_id.to_string())),
        }
    }

    async fn release(&self, lease_id: &str) -> Result<LeaseRecord> {
        let value = match self.load(lease_id).await? {
            Some(value) if Self::live(&value) => value,
            _ => return Err(PackError::InvalidLease(lease_id.to_string())),
        };
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.lease_key(lease_id)).await?;
        let _: () = conn.zrem(self.exp_key(), lease_id).await?;
        Ok(value.record)
    }

    async fn renew(&self, lease_id: &str) -> Result<LeaseRecord> {
        let mut value = match self.load(lease_id).await? {
            Some(value) if Self::live(&value) => value,
            _ => return Err(PackError::InvalidLease(lease_id.to_string())),
        };
        if let Some(ttl) = value.record.ttl_ms {
            value.expires_at_ms = Some(Utc::now().timestamp_millis() as u64 + ttl);
            self.store(&value).await?;
        }
        Ok(value.record)
    }

    async fn update_flags(&self, lease_id: &str, flags: AccessFlags) -> Result<()> {
        let mut value = match self.load(lease_id).await? {
            Some(value) if Self::live(&value) => value,
            _ => return Err(PackError::InvalidLease(lease_id.to_string())),
        };
        value.record.flags = flags;
        self.store(&value).await
    }

    async fn sweep_expired(&self) -> Result<Vec<LeaseRecord>> {
        let now_ms = Utc::now().timestamp_millis() as u64;
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(self.exp_key(), 0u64, now_ms)
            .await?;

        let mut swept = Vec::with_capacity(due.len());
        for lease_id in due {
            if let Some(value) = self.load(&lease_id).await? {
                swept.push(value.record);
            }
            let _: () = conn.del(self.lease_key(&lease_id)).await?;
            let _: () = conn.zrem(self.exp_key(), &lease_id).await?;
        }
        Ok(swept)
    }
}
