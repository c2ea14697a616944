//! Protocol trait definitions for splice's networking layer.
//!
//! The routing table and iterative lookup depend only on [`DiscoveryRpc`],
//! never on the QUIC supervisor that implements it. Tests swap in an
//! in-memory network.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{NodeId, PeerRecord};

/// Remote operations the discovery layer needs from the network.
#[async_trait]
pub trait DiscoveryRpc: Send + Sync + 'static {
    /// Liveness check used before evicting a bucket's oldest entry.
    async fn ping(&self, to: &PeerRecord) -> Result<()>;

    /// Ask a peer for the records it knows closest to `target`.
    async fn find_node(&self, to: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>>;

    /// Reach a peer known only by address and learn who it is.
    async fn introduce(&self, addr: SocketAddr) -> Result<PeerRecord>;
}
