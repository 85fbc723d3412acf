//! Network layer for tvcache
//!
//! Outbound: the [`Upstream`] seam and its hyper client, with TLS for
//! `https` upstreams. Inbound: an HTTP/1 server with bounded concurrency
//! that routes requests to the decision engine.

mod client;
mod connection_pool;
mod router;
mod server;
mod tls;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{HyperUpstream, Upstream, UpstreamRequest, UpstreamResponse};
pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use router::{route, RELAY_PROBE_PATH};
pub use server::Server;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
