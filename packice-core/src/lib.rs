//! Packice Core - peer-to-peer object cache core
//!
//! Control plane and data plane for a leased object cache:
//! - Peer state machine (CREATING -> SEALED, lease expiry, LRU eviction)
//! - Blob backends (anonymous memory, local file, shared filesystem)
//! - Transport adapters (direct, HTTP/JSON, UDS with SCM_RIGHTS fd passing)
//! - Tiered hot/cold composition and resolver-driven fetch-on-miss

pub mod blob;
pub mod client;
pub mod error;
pub mod lease;
pub mod peer;
pub mod resolver;
pub mod transfer;
pub mod transport;

pub use blob::{Blob, BlobExport, BlobHandle, BlobKind, BlobSpec, FileBlob, MemBlob, SharedFsBlob, SharedFsHeader};
pub use client::{connect, Client, ClientLease};
pub use error::{PackError, Result};
pub use lease::{
    AccessFlags, LeaseRecord, LeaseStore, MemoryLeaseStore, RedisLeaseStore, MIN_TTL,
};
pub use peer::{
    named_memory_peer, AcquireRequest, AcquireResult, BackendKind, LocalPeer, ObjectInfo,
    ObjectState, Peer, PeerConfig, TieredConfig, TieredPeer, UserMeta,
};
pub use resolver::{MemoryResolver, RedisResolver, Resolver};
pub use transfer::{copy_between_peers, FetchOnMiss, FETCH_READ_TTL};
pub use transport::{
    connect_endpoint, DirectTransport, HttpTransport, RemoteLease, Transport, UdsTransport,
};
