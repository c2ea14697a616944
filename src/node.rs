//! # High-Level Node API
//!
//! A [`Node`] ties the pieces together: identity, QUIC transport, connection
//! supervisor, routing table and service directory.
//!
//! ## Quick Start
//!
//! ```ignore
//! let handlers = HandlerRegistry::new()
//!     .with("chat", |msg| println!("{}: {:?}", msg.from.short(), msg.payload));
//!
//! // Empty bootstrap address starts a fresh overlay.
//! let node = Node::start(NodeConfig::default(), handlers, "203.0.113.5:52386").await?;
//!
//! for delivery in node.broadcast("chat", b"hello").await {
//!     if let Err(e) = delivery.result {
//!         eprintln!("{} missed it: {}", delivery.peer.short(), e);
//!     }
//! }
//!
//! node.shutdown().await;
//! ```
//!
//! ## Lifecycle
//!
//! `start` binds the endpoint and spawns the accept loop, the discovery actor
//! and the bucket refresh task. Bootstrap failures are recorded, not fatal.
//! `shutdown` fires one signal that every task observes, closes every
//! connection and waits for the tasks to finish. It may be called any number
//! of times from any number of tasks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::directory::HandlerRegistry;
use crate::identity::{Keypair, NodeId, PeerRecord};
use crate::routing::LookupReport;
use crate::shutdown::Shutdown;
use crate::supervisor::{DeliveryError, Peer, Supervisor};
use crate::transport::Transport;

/// What the last bootstrap attempt achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// No bootstrap address was given.
    Skipped,
    Joined {
        /// Peers answering the join lookup.
        responded: usize,
        /// Closest peers found.
        closest: usize,
        rounds: usize,
    },
    Failed(String),
}

/// Result of one push within a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub peer: NodeId,
    pub result: Result<(), DeliveryError>,
}

pub struct Node {
    keypair: Keypair,
    config: NodeConfig,
    local_addr: SocketAddr,
    advertised_addr: SocketAddr,
    supervisor: Supervisor,
    shutdown: Shutdown,
    closed: OnceCell<()>,
    bootstrap_outcome: Mutex<BootstrapOutcome>,
}

impl Node {
    /// Start a node with a fresh identity.
    ///
    /// Configuration and bind errors are returned. A non-empty
    /// `bootstrap_addr` (`host:port`) is joined before returning; its
    /// outcome is available from [`Node::bootstrap_outcome`].
    pub async fn start(
        config: NodeConfig,
        handlers: HandlerRegistry,
        bootstrap_addr: &str,
    ) -> Result<Self> {
        config.validate().context("invalid node configuration")?;

        let keypair = Keypair::generate();
        let transport = Transport::bind(config.bind_addr(), &keypair)?;
        let local_addr = transport.local_addr()?;
        let advertised_addr = config
            .public_addr
            .unwrap_or_else(|| resolve_advertised_addr(local_addr));

        let shutdown = Shutdown::new();
        let (supervisor, actor) = Supervisor::new(
            transport,
            keypair.node_id(),
            Arc::new(handlers.clone()),
            Some(advertised_addr),
            config.link_timeouts(),
            config.discovery_params(),
            shutdown.subscribe(),
        );
        supervisor.spawn(actor.run()).await;
        supervisor
            .spawn(supervisor.discovery().clone().run_bucket_refresh())
            .await;
        supervisor.spawn_accept_loop().await;

        info!(
            node = %keypair.node_id(),
            addr = %local_addr,
            advertised = %advertised_addr,
            services = ?handlers.names(),
            "node started"
        );

        let node = Self {
            keypair,
            config,
            local_addr,
            advertised_addr,
            supervisor,
            shutdown,
            closed: OnceCell::new(),
            bootstrap_outcome: Mutex::new(BootstrapOutcome::Skipped),
        };

        if !bootstrap_addr.trim().is_empty() {
            node.bootstrap(bootstrap_addr).await;
        }

        Ok(node)
    }

    /// Join the overlay through the peer at `addr` (`host:port`).
    pub async fn bootstrap(&self, addr: &str) -> BootstrapOutcome {
        let addr = addr.trim();
        info!(addr, "bootstrapping");

        let outcome = match tokio::time::timeout(self.config.bootstrap_timeout, self.join(addr)).await {
            Ok(Ok(report)) => {
                info!(
                    addr,
                    responded = report.responded,
                    closest = report.closest.len(),
                    rounds = report.rounds,
                    "bootstrap complete"
                );
                BootstrapOutcome::Joined {
                    responded: report.responded,
                    closest: report.closest.len(),
                    rounds: report.rounds,
                }
            }
            Ok(Err(e)) => {
                warn!(addr, error = %format!("{:#}", e), "bootstrap failed");
                BootstrapOutcome::Failed(format!("{:#}", e))
            }
            Err(_) => {
                warn!(addr, "bootstrap timed out");
                BootstrapOutcome::Failed("bootstrap timed out".to_string())
            }
        };

        *self.bootstrap_outcome.lock().await = outcome.clone();
        outcome
    }

    async fn join(&self, addr: &str) -> Result<LookupReport> {
        let seeds: Vec<SocketAddr> = tokio::net::lookup_host(addr)
            .await
            .with_context(|| format!("failed to resolve bootstrap address '{}'", addr))?
            .collect();
        if seeds.is_empty() {
            bail!("bootstrap address '{}' resolved to nothing", addr);
        }
        self.supervisor.discovery().bootstrap(&seeds).await
    }

    pub async fn bootstrap_outcome(&self) -> BootstrapOutcome {
        self.bootstrap_outcome.lock().await.clone()
    }

    /// Connected peers currently offering `service`. The snapshot is not
    /// affected by later connects or disconnects.
    pub async fn providers_for(&self, service: &str) -> Vec<Peer> {
        self.supervisor.providers_for(service).await
    }

    pub async fn push(&self, peer: &Peer, service: &str, payload: &[u8]) -> Result<(), DeliveryError> {
        self.supervisor.push(peer, service, payload).await
    }

    /// Push `payload` to every provider of `service` with bounded
    /// concurrency. One result per provider, in snapshot order; a failed
    /// push never stops the others.
    pub async fn broadcast(&self, service: &str, payload: &[u8]) -> Vec<Delivery> {
        let providers = self.providers_for(service).await;
        if providers.is_empty() {
            debug!(service, "no providers for broadcast");
            return Vec::new();
        }

        let permits = Arc::new(Semaphore::new(self.config.broadcast_concurrency));
        let payload: Arc<[u8]> = Arc::from(payload);
        let service: Arc<str> = Arc::from(service);

        let mut pushes = JoinSet::new();
        for (idx, peer) in providers.iter().cloned().enumerate() {
            let supervisor = self.supervisor.clone();
            let permits = permits.clone();
            let payload = payload.clone();
            let service = service.clone();
            pushes.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => supervisor.push(&peer, &service, &payload).await,
                    Err(_) => Err(DeliveryError::Closed),
                };
                (idx, result)
            });
        }

        let mut results: Vec<Option<Result<(), DeliveryError>>> = vec![None; providers.len()];
        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => warn!(error = %e, "broadcast task failed"),
            }
        }

        providers
            .iter()
            .zip(results)
            .map(|(peer, result)| Delivery {
                peer: peer.node_id(),
                result: result.unwrap_or_else(|| Err(DeliveryError::Io("push task failed".to_string()))),
            })
            .collect()
    }

    /// Stop the node. Safe to call repeatedly and concurrently; every call
    /// returns once the first has finished.
    pub async fn shutdown(&self) {
        self.closed
            .get_or_init(|| async {
                info!(node = %self.node_id(), "shutting down");
                self.shutdown.trigger();
                self.supervisor.close_all().await;
                self.supervisor.join_tasks(self.config.shutdown_timeout).await;
                self.supervisor
                    .transport()
                    .wait_idle(self.config.shutdown_timeout)
                    .await;
                debug!(node = %self.node_id(), "shutdown complete");
            })
            .await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.initialized()
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Every peer in the routing table, connected or not.
    pub async fn known_peers(&self) -> Vec<PeerRecord> {
        self.supervisor.discovery().all_known().await
    }

    /// Routing table entry for `id`, connected or not.
    pub async fn known_peer(&self, id: &NodeId) -> Option<PeerRecord> {
        self.supervisor.discovery().get(*id).await
    }

    pub async fn known_peer_count(&self) -> usize {
        self.supervisor.discovery().len().await
    }

    /// Drop `id` from the routing table. An open link to it stays up.
    pub async fn forget(&self, id: &NodeId) {
        self.supervisor.discovery().remove(*id).await;
    }

    pub async fn connected_peers(&self) -> Vec<Peer> {
        self.supervisor.connected_peers().await
    }

    /// The admitted link to `id`, if there is one.
    pub async fn peer(&self, id: &NodeId) -> Option<Peer> {
        self.supervisor.peer(id).await
    }

    /// Services a connected peer advertised.
    pub async fn services_of(&self, peer: &NodeId) -> Vec<String> {
        self.supervisor.services_of(peer).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.shutdown.trigger() {
            self.supervisor.transport().close();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id())
            .field("local_addr", &self.local_addr)
            .field("advertised_addr", &self.advertised_addr)
            .finish_non_exhaustive()
    }
}

/// Address to advertise when the operator gave none.
///
/// A specific bind address is used as is. For an unspecified bind the local
/// routable address is probed, falling back to loopback.
fn resolve_advertised_addr(local: SocketAddr) -> SocketAddr {
    if !local.ip().is_unspecified() {
        return local;
    }
    probe_routable_ip(local.is_ipv4())
        .map(|ip| SocketAddr::new(ip, local.port()))
        .unwrap_or_else(|| {
            let loopback = if local.is_ipv4() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            };
            warn!(port = local.port(), "no routable local address found, advertising loopback");
            SocketAddr::new(loopback, local.port())
        })
}

/// Local IP the OS would route public traffic from.
///
/// Connecting a UDP socket sends no packets; it only selects a route.
fn probe_routable_ip(ipv4: bool) -> Option<IpAddr> {
    let (bind, targets): (&str, &[&str]) = if ipv4 {
        ("0.0.0.0:0", &["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"])
    } else {
        ("[::]:0", &["[2001:4860:4860::8888]:53", "[2606:4700:4700::1111]:53"])
    };

    for target in targets {
        if let Ok(socket) = std::net::UdpSocket::bind(bind)
            && socket.connect(target).is_ok()
            && let Ok(local) = socket.local_addr()
        {
            let ip = local.ip();
            if !ip.is_loopback() && !ip.is_unspecified() {
                return Some(ip);
            }
        }
    }
    None
}
