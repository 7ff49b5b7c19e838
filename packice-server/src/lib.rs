//! Packice node: configuration plus the HTTP and UDS transport servers.

pub mod config;
pub mod http;
pub mod uds;

pub use config::Config;
pub use http::{router, run_http_server, IDEMPOTENCY_HEADER};
pub use uds::run_uds_server;
