use crate::peer::LocalPeer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

static NAMED_PEERS: OnceLock<Mutex<HashMap<String, Arc<LocalPeer>>>> = OnceLock::new();

/// Process-global registry backing `memory://<name>` URIs.
///
/// The first access for a name creates a memory-backed peer (with its
/// sweeper running); later accesses attach to the same instance. An empty
/// name maps to `default`.
pub fn named_memory_peer(name: &str) -> Arc<LocalPeer> {
    let name = if name.is_empty() { "default" } else { name };
    let registry = NAMED_PEERS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
    registry
        .entry(name.to_string())
        .or_insert_with(|| {
            tracing::debug!("creating shared in-process peer {}", name);
            let peer = LocalPeer::memory();
            peer.spawn_sweeper();
            peer
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_name_attaches_to_same_peer() {
        let a = named_memory_peer("reg-test");
        let b = named_memory_peer("reg-test");
        assert!(Arc::ptr_eq(&a, &b));

        let other = named_memory_peer("reg-test-2");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_empty_name_is_default() {
        let a = named_memory_peer("");
        let b = named_memory_peer("default");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
