//! End-to-end transport tests: real sockets, real descriptor passing.

use packice_core::{
    connect, AcquireRequest, BlobSpec, LocalPeer, MemoryLeaseStore, MemoryResolver, PackError,
    Peer, PeerConfig, Resolver,
};
use packice_server::http::{router, IDEMPOTENCY_HEADER};
use packice_server::uds::run_uds_server;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

async fn spawn_http(peer: Arc<dyn Peer>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(peer)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_uds(peer: Arc<dyn Peer>, dir: &std::path::Path) -> PathBuf {
    let path = dir.join("p.sock");
    let server_path = path.clone();
    tokio::spawn(async move {
        run_uds_server(peer, &server_path).await.unwrap();
    });
    for _ in 0..100 {
        if path.exists() {
            return path;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("uds server never bound {:?}", path);
}

fn file_peer(root: &std::path::Path) -> Arc<LocalPeer> {
    LocalPeer::new(
        PeerConfig::file(root),
        Arc::new(MemoryLeaseStore::new()),
    )
    .unwrap()
}

async fn seed(peer: &dyn Peer, id: &str, data: &[u8]) {
    let acq = peer
        .acquire(AcquireRequest::create(
            Some(id),
            vec![BlobSpec::file(data.len() as u64)],
        ))
        .await
        .unwrap();
    acq.blobs[0].write_all(data).unwrap();
    peer.seal(&acq.lease.lease_id).await.unwrap();
    peer.release(&acq.lease.lease_id).await.unwrap();
}

#[tokio::test]
async fn test_http_write_seal_read() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_http(file_peer(dir.path())).await;

    let client = connect(&base).await.unwrap();
    let mut lease = client
        .create(Some("k1"), vec![BlobSpec::file(11)])
        .await
        .unwrap();
    lease.write_all(b"hello world").unwrap();
    lease.seal().await.unwrap();

    let reader = connect(&base).await.unwrap();
    let read = reader.read("k1").await.unwrap();
    assert_eq!(read.read_all().unwrap().as_ref(), b"hello world");
    read.release().await.unwrap();
    lease.release().await.unwrap();

    // Error kinds survive the wire.
    assert!(matches!(
        reader.read("missing").await,
        Err(PackError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_http_seal_replays_on_idempotency_key() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_http(file_peer(dir.path())).await;

    let client = connect(&base).await.unwrap();
    let lease = client
        .create(Some("idem"), vec![BlobSpec::file(1)])
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let seal = |key: &'static str| {
        http.post(format!("{}/seal", base))
            .header(IDEMPOTENCY_HEADER, key)
            .json(&serde_json::json!({ "lease_id": lease.lease_id }))
            .send()
    };

    assert_eq!(seal("key-1").await.unwrap().status(), 200);
    lease.release().await.unwrap();
    // The lease is gone, but the same key replays the cached success.
    assert_eq!(seal("key-1").await.unwrap().status(), 200);
    // A fresh key hits the peer and sees the dead lease.
    assert_eq!(seal("key-2").await.unwrap().status(), 400);
}

#[tokio::test]
async fn test_http_client_retry_reuses_idempotency_key() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_http(file_peer(dir.path())).await;

    let client = connect(&base).await.unwrap();
    let mut lease = client
        .create(Some("retry"), vec![BlobSpec::file(1)])
        .await
        .unwrap();
    lease.seal().await.unwrap();
    lease.seal().await.unwrap();

    lease.release().await.unwrap();
    // The handle resends the same key, so the retried release replays the
    // first success instead of surfacing InvalidLease.
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_http_concurrent_retries_share_one_execution() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_http(file_peer(dir.path())).await;

    let client = connect(&base).await.unwrap();
    let mut lease = client
        .create(Some("race"), vec![BlobSpec::file(1)])
        .await
        .unwrap();
    lease.seal().await.unwrap();

    let http = reqwest::Client::new();
    let release = || {
        http.post(format!("{}/release", base))
            .header(IDEMPOTENCY_HEADER, "race-key")
            .json(&serde_json::json!({ "lease_id": lease.lease_id }))
            .send()
    };
    // Whichever request loses the race must await the winner's outcome,
    // not re-execute the release and see InvalidLease.
    let (a, b) = tokio::join!(release(), release());
    assert_eq!(a.unwrap().status(), 200);
    assert_eq!(b.unwrap().status(), 200);
}

#[tokio::test]
async fn test_uds_fd_passing_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let peer = LocalPeer::memory();
    let sock = spawn_uds(peer.clone(), dir.path()).await;
    let sock = sock.to_string_lossy().to_string();

    // Client A writes through the inherited descriptor and seals.
    let a = connect(&sock).await.unwrap();
    let mut lease = a.create(Some("k2"), vec![BlobSpec::mem(4)]).await.unwrap();
    lease.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    lease.seal().await.unwrap();
    lease.release().await.unwrap();

    // Client B receives a fresh descriptor onto the same memory object and
    // maps it.
    let b = connect(&sock).await.unwrap();
    let read = b.read("k2").await.unwrap();
    let map = read.blob(0).unwrap().mmap().unwrap();
    assert_eq!(&map[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    read.release().await.unwrap();
}

#[tokio::test]
async fn test_uds_disconnect_releases_leases() {
    let dir = tempfile::tempdir().unwrap();
    let peer = LocalPeer::memory();
    let sock = spawn_uds(peer.clone(), dir.path()).await;
    let sock = sock.to_string_lossy().to_string();

    let a = connect(&sock).await.unwrap();
    let mut lease = a.create(Some("held"), vec![BlobSpec::mem(1)]).await.unwrap();
    lease.seal().await.unwrap();
    lease.release().await.unwrap();

    let b = connect(&sock).await.unwrap();
    let read = b.read("held").await.unwrap();
    assert_eq!(
        peer.stat("held").await.unwrap().unwrap().hold_count,
        1
    );

    // Vanishing without a release is treated as one.
    drop(read);
    drop(b);
    for _ in 0..100 {
        if peer.stat("held").await.unwrap().unwrap().hold_count == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hold count never dropped after disconnect");
}

#[tokio::test]
async fn test_fetch_on_miss_over_http() {
    let dir2 = tempfile::tempdir().unwrap();
    let dir3 = tempfile::tempdir().unwrap();
    let p2 = file_peer(dir2.path());
    let p3 = file_peer(dir3.path());
    seed(p3.as_ref(), "c", b"fetched bytes").await;

    let ep2 = spawn_http(p2).await;
    let ep3 = spawn_http(p3).await;

    let resolver = Arc::new(MemoryResolver::new());
    resolver.register("c", &ep2).await.unwrap();
    resolver.register("c", &ep3).await.unwrap();

    let p1 = connect("").await.unwrap().with_resolver(resolver, None).unwrap();
    let lease = p1.read_or_fetch("c").await.unwrap();
    assert_eq!(lease.read_all().unwrap().as_ref(), b"fetched bytes");
    lease.release().await.unwrap();

    // The object is now local; a plain read succeeds without the resolver.
    let local = p1.read("c").await.unwrap();
    assert_eq!(local.read_all().unwrap().as_ref(), b"fetched bytes");
    local.release().await.unwrap();
}
