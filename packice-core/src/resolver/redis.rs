use crate::error::{PackError, Result};
use crate::resolver::Resolver;
use async_trait::async_trait;
use redis::AsyncCommands;

/// Resolver backed by Redis sets: `{ns}:holders:{objid}` maps to the set
/// of candidate peer endpoints.
pub struct RedisResolver {
    conn: redis::aio::MultiplexedConnection,
    namespace: String,
}

impl RedisResolver {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| PackError::Config(format!("redis url: {}", e)))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn key(&self, object_id: &str) -> String {
        format!("{}:holders:{}", self.namespace, object_id)
    }
}

#[async_trait]
impl Resolver for RedisResolver {
    async fn lookup(&self, object_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut endpoints: Vec<String> = conn.smembers(self.key(object_id)).await?;
        // Stable candidate order; round-robin rotation is the caller's job.
        endpoints.sort();
        Ok(endpoints)
    }

    async fn register(&self, object_id: &str, endpoint: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(self.key(object_id), endpoint).await?;
        Ok(())
    }

    async fn unregister(&self, object_id: &str, endpoint: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(self.key(object_id), endpoint).await?;
        Ok(())
    }
}
