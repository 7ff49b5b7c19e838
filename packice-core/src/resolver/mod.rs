//! Soft-state directory of candidate object holders.
//!
//! Entries are advisory: any endpoint may be stale, and callers prune only
//! on explicit `Gone` observations. The concrete store behind the trait is
//! external (typically Redis); a memory implementation exists for tests
//! and single-process setups.

pub mod redis;

pub use redis::RedisResolver;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Candidate endpoints that may hold a sealed copy of the object.
    async fn lookup(&self, object_id: &str) -> Result<Vec<String>>;

    async fn register(&self, object_id: &str, endpoint: &str) -> Result<()>;

    async fn unregister(&self, object_id: &str, endpoint: &str) -> Result<()>;
}

/// In-process resolver.
#[derive(Default)]
pub struct MemoryResolver {
    entries: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Resolver for MemoryResolver {
    async fn lookup(&self, object_id: &str) -> Result<Vec<String>> {
        Ok(self
            .table()
            .get(object_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn register(&self, object_id: &str, endpoint: &str) -> Result<()> {
        self.table()
            .entry(object_id.to_string())
            .or_default()
            .insert(endpoint.to_string());
        Ok(())
    }

    async fn unregister(&self, object_id: &str, endpoint: &str) -> Result<()> {
        let mut table = self.table();
        if let Some(set) = table.get_mut(object_id) {
            set.remove(endpoint);
            if set.is_empty() {
                table.remove(object_id);
            }
        }
        Ok(())
    }
}
