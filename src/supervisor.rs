//! # Connection Supervisor
//!
//! Owns every QUIC connection of a node and drives each through
//!
//! ```text
//! Accepted/Dialed → Handshaking → Admitted → Closed
//!                        └──────→ Rejected
//! ```
//!
//! ## Handshake
//!
//! 1. QUIC/TLS handshake with mutual Ed25519 certificates, bounded by the
//!    handshake timeout. Connections presenting our own key are rejected.
//! 2. Each side opens one unidirectional message stream and sends
//!    `LinkFrame::Hello` as its first frame. The peer's Hello must arrive
//!    within the same timeout.
//!
//! ## Admission
//!
//! The peer is offered to the routing table, registered in the connected set
//! and its advertised services recorded in the [`ServiceDirectory`]. From then
//! on its message stream is read in order and every envelope handed to the
//! local handler for its service. Control requests (ping, find-node) arrive on
//! short-lived bidirectional streams.
//!
//! ## Duplicate Links
//!
//! Two nodes dialing each other at once end up with two connections. Both
//! sides keep the one dialed by the smaller node ID and close the other. A
//! second dial from the same side loses to the existing link.
//!
//! ## Close
//!
//! On remote close, stream error or shutdown the connection is closed, dropped
//! from the connected set if it is still the current link for that peer, and
//! withdrawn from the directory. Routing-table entries stay.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use quinn::{Connection, Incoming, RecvStream, SendStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::directory::{HandlerRegistry, InboundMessage, ServiceDirectory};
use crate::identity::{NodeId, PeerRecord};
use crate::messages::{
    encode_frame, read_frame, write_frame, ControlRequest, ControlResponse, Envelope, FrameError,
    Hello, LinkFrame, PeerInfo, MAX_PEERS_PER_RESPONSE,
};
use crate::protocols::DiscoveryRpc;
use crate::routing::{Discovery, DiscoveryActor, DiscoveryParams};
use crate::shutdown::wait_for_shutdown;
use crate::transport::{HandshakeError, Transport};

/// Lifecycle of one connection, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Dialed,
    Handshaking,
    Admitted,
    Rejected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Dialed => "dialed",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Admitted => "admitted",
            ConnectionState::Rejected => "rejected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a push did not reach the peer's message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection to the peer is gone.
    Closed,
    /// The write did not complete within the push timeout.
    Timeout,
    /// The encoded message exceeds the frame limit.
    TooLarge { size: usize, max: usize },
    Io(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Closed => write!(f, "connection closed"),
            DeliveryError::Timeout => write!(f, "delivery timed out"),
            DeliveryError::TooLarge { size, max } => {
                write!(f, "message too large: {} bytes (max {})", size, max)
            }
            DeliveryError::Io(e) => write!(f, "delivery failed: {}", e),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Timeouts applied to connection-level operations.
#[derive(Debug, Clone, Copy)]
pub struct LinkTimeouts {
    /// TLS handshake plus Hello exchange.
    pub handshake: Duration,
    /// One outbound message write.
    pub push: Duration,
    /// Reading a control request from a peer.
    pub control: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(5),
            push: Duration::from_secs(5),
            control: Duration::from_secs(5),
        }
    }
}

struct Link {
    connection: Connection,
    outbound: Mutex<SendStream>,
    /// Node that opened the connection, used to settle duplicate links.
    dialer: NodeId,
}

/// An admitted, authenticated connection to a remote node.
///
/// Cloning is cheap. A `Peer` held after its connection closed still works as
/// a value; pushes to it fail with [`DeliveryError::Closed`].
#[derive(Clone)]
pub struct Peer {
    record: PeerRecord,
    link: Arc<Link>,
}

impl Peer {
    pub fn node_id(&self) -> NodeId {
        self.record.node_id()
    }

    pub fn record(&self) -> &PeerRecord {
        &self.record
    }

    pub fn addr(&self) -> SocketAddr {
        self.record.addr()
    }

    pub fn is_connected(&self) -> bool {
        self.link.connection.close_reason().is_none()
    }

    fn link_id(&self) -> usize {
        self.link.connection.stable_id()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("node_id", &self.node_id())
            .field("addr", &self.addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct Shared {
    local_id: NodeId,
    transport: Transport,
    discovery: Discovery<LinkRpc>,
    directory: Mutex<ServiceDirectory>,
    connected: Mutex<HashMap<NodeId, Peer>>,
    handlers: Arc<HandlerRegistry>,
    hello: Hello,
    timeouts: LinkTimeouts,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<JoinSet<()>>,
}

/// Cheap-to-clone handle on a node's connections.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

/// [`DiscoveryRpc`] over the supervisor's links.
///
/// Holds a weak reference: the discovery handle lives inside the supervisor.
pub struct LinkRpc {
    shared: Weak<Shared>,
}

impl Supervisor {
    /// Build the supervisor and its discovery layer. The caller spawns the
    /// returned actor's `run` and calls [`Supervisor::spawn_accept_loop`].
    pub fn new(
        transport: Transport,
        local_id: NodeId,
        handlers: Arc<HandlerRegistry>,
        advertised_addr: Option<SocketAddr>,
        timeouts: LinkTimeouts,
        params: DiscoveryParams,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, DiscoveryActor<LinkRpc>) {
        let hello = Hello {
            services: handlers.names(),
            advertised_addr: advertised_addr.map(|a| a.to_string()),
        };

        let mut actor_slot = None;
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let rpc = Arc::new(LinkRpc {
                shared: weak.clone(),
            });
            let (discovery, actor) = Discovery::new(local_id, rpc, params, shutdown.clone());
            actor_slot = Some(actor);
            Shared {
                local_id,
                transport,
                discovery,
                directory: Mutex::new(ServiceDirectory::new(local_id)),
                connected: Mutex::new(HashMap::new()),
                handlers,
                hello,
                timeouts,
                shutdown,
                tasks: Mutex::new(JoinSet::new()),
            }
        });
        let actor = actor_slot.expect("Arc::new_cyclic runs its initializer exactly once");

        (Self { shared }, actor)
    }

    pub fn discovery(&self) -> &Discovery<LinkRpc> {
        &self.shared.discovery
    }

    pub fn transport(&self) -> &Transport {
        &self.shared.transport
    }

    /// Track a background task so shutdown can wait for it.
    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.shared.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    pub async fn spawn_accept_loop(&self) {
        let this = self.clone();
        self.spawn(this.accept_loop()).await;
    }

    async fn accept_loop(self) {
        let mut shutdown = self.shared.shutdown.clone();
        loop {
            let incoming = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                incoming = self.shared.transport.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                break;
            };
            let this = self.clone();
            self.spawn(this.handle_inbound(incoming)).await;
        }
        debug!("accept loop stopped");
    }

    async fn handle_inbound(self, incoming: Incoming) {
        let remote = incoming.remote_address();
        log_transition(remote, ConnectionState::Accepted);
        log_transition(remote, ConnectionState::Handshaking);

        let mut shutdown = self.shared.shutdown.clone();
        let established = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => Err(HandshakeError::Closed),
            result = self.establish_inbound(incoming) => result,
        };

        match established {
            Ok((peer, recv)) => self.run_link(peer, recv).await,
            Err(e) => reject(remote, &e),
        }
    }

    async fn establish_inbound(&self, incoming: Incoming) -> Result<(Peer, RecvStream), HandshakeError> {
        let (connection, public_key) = self
            .shared
            .transport
            .complete_inbound(incoming, self.shared.timeouts.handshake)
            .await?;
        let dialer = NodeId::from_public_key(&public_key);
        let (peer, recv, services) = self.exchange_hello(connection, public_key, dialer).await?;
        let admitted = self.admit(peer.clone(), &services).await?;
        if admitted.link_id() != peer.link_id() {
            return Err(HandshakeError::Protocol("duplicate link".to_string()));
        }
        Ok((peer, recv))
    }

    /// Reuse a live link to `addr` (or to the pinned key) or dial and admit.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        expected: Option<&[u8; 32]>,
    ) -> Result<Peer, HandshakeError> {
        if let Some(existing) = self.find_link(addr, expected).await {
            return Ok(existing);
        }
        if *self.shared.shutdown.borrow() {
            return Err(HandshakeError::Closed);
        }

        log_transition(addr, ConnectionState::Dialed);
        log_transition(addr, ConnectionState::Handshaking);

        let result = async {
            let (connection, public_key) = self
                .shared
                .transport
                .dial(addr, expected, self.shared.timeouts.handshake)
                .await?;
            let (peer, recv, services) = self
                .exchange_hello(connection, public_key, self.shared.local_id)
                .await?;
            let admitted = self.admit(peer.clone(), &services).await?;
            Ok::<_, HandshakeError>((admitted, peer, recv))
        }
        .await;

        match result {
            Ok((admitted, dialed, recv)) if admitted.link_id() == dialed.link_id() => {
                let this = self.clone();
                self.spawn(this.run_link(dialed, recv)).await;
                Ok(admitted)
            }
            Ok((admitted, _, _)) => Ok(admitted),
            Err(e) => {
                reject(addr, &e);
                Err(e)
            }
        }
    }

    async fn find_link(&self, addr: SocketAddr, expected: Option<&[u8; 32]>) -> Option<Peer> {
        let connected = self.shared.connected.lock().await;
        match expected {
            Some(public_key) => connected
                .get(&NodeId::from_public_key(public_key))
                .filter(|p| p.is_connected())
                .cloned(),
            None => connected
                .values()
                .find(|p| {
                    p.is_connected()
                        && (p.addr() == addr || p.link.connection.remote_address() == addr)
                })
                .cloned(),
        }
    }

    async fn exchange_hello(
        &self,
        connection: Connection,
        public_key: [u8; 32],
        dialer: NodeId,
    ) -> Result<(Peer, RecvStream, Vec<String>), HandshakeError> {
        let exchange = async {
            let send_hello = async {
                let mut send = connection.open_uni().await?;
                write_frame(&mut send, &LinkFrame::Hello(self.shared.hello.clone())).await?;
                Ok::<_, anyhow::Error>(send)
            };
            let recv_hello = async {
                let mut recv = connection.accept_uni().await?;
                match read_frame::<_, LinkFrame>(&mut recv).await? {
                    Some(LinkFrame::Hello(hello)) => {
                        hello.validate()?;
                        Ok::<_, anyhow::Error>((recv, hello))
                    }
                    Some(LinkFrame::Message(_)) => bail!("message sent before Hello"),
                    None => bail!("message stream closed before Hello"),
                }
            };
            tokio::try_join!(send_hello, recv_hello)
        };

        let outcome = tokio::time::timeout(self.shared.timeouts.handshake, exchange).await;
        let (send, (recv, hello)) = match outcome {
            Ok(Ok(streams)) => streams,
            Ok(Err(e)) => {
                connection.close(2u32.into(), b"bad hello");
                return Err(HandshakeError::Protocol(format!("{:#}", e)));
            }
            Err(_) => {
                connection.close(2u32.into(), b"hello timeout");
                return Err(HandshakeError::Timeout);
            }
        };

        let observed = connection.remote_address();
        let addr = hello.dialable_addr().unwrap_or(observed);
        let Some(record) = PeerRecord::new(public_key, addr) else {
            connection.close(1u32.into(), b"missing identity");
            return Err(HandshakeError::MissingIdentity);
        };

        let peer = Peer {
            record,
            link: Arc::new(Link {
                connection,
                outbound: Mutex::new(send),
                dialer,
            }),
        };
        Ok((peer, recv, hello.services))
    }

    /// Register `peer` as the current link for its node. Returns the peer
    /// that won, which is an existing link when the new one loses the
    /// duplicate-link rule.
    async fn admit(&self, peer: Peer, services: &[String]) -> Result<Peer, HandshakeError> {
        let id = peer.node_id();
        if id == self.shared.local_id {
            peer.link.connection.close(1u32.into(), b"self connection");
            return Err(HandshakeError::SelfConnection);
        }

        let superseded = {
            let mut connected = self.shared.connected.lock().await;
            let existing = connected
                .get(&id)
                .filter(|e| e.is_connected() && e.link_id() != peer.link_id())
                .cloned();
            match existing {
                None => {
                    connected.insert(id, peer.clone());
                    None
                }
                Some(existing) => {
                    // Same dialer: the old link is stale. Otherwise the
                    // link dialed by the smaller ID survives on both ends.
                    let new_wins = existing.link.dialer == peer.link.dialer
                        || peer.link.dialer < existing.link.dialer;
                    if !new_wins {
                        drop(connected);
                        trace!(peer = %id, "duplicate link, keeping existing connection");
                        peer.link.connection.close(0u32.into(), b"duplicate link");
                        return Ok(existing);
                    }
                    connected.insert(id, peer.clone());
                    Some(existing)
                }
            }
        };
        if let Some(old) = superseded {
            trace!(peer = %id, "duplicate link, replacing existing connection");
            old.link.connection.close(0u32.into(), b"duplicate link");
        }

        let offered = {
            let mut directory = self.shared.directory.lock().await;
            directory.advertise(id, services);
            directory.len()
        };
        self.shared.discovery.observe(peer.record.clone()).await;

        log_transition(peer.link.connection.remote_address(), ConnectionState::Admitted);
        info!(peer = %id.short(), addr = %peer.addr(), services = ?services, "peer admitted");
        debug!(offered, "services with providers");
        Ok(peer)
    }

    async fn run_link(self, peer: Peer, recv: RecvStream) {
        let mut shutdown = self.shared.shutdown.clone();
        let reason = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => "shutdown".to_string(),
            result = self.read_messages(&peer, recv) => match result {
                Ok(()) => "message stream finished".to_string(),
                Err(e) => format!("{:#}", e),
            },
            e = self.serve_control_streams(&peer) => e.to_string(),
        };
        self.release(&peer, &reason).await;
    }

    async fn read_messages(&self, peer: &Peer, mut recv: RecvStream) -> Result<()> {
        while let Some(frame) = read_frame::<_, LinkFrame>(&mut recv).await? {
            match frame {
                LinkFrame::Message(envelope) => self.dispatch(peer, envelope),
                LinkFrame::Hello(hello) => {
                    hello.validate()?;
                    debug!(peer = %peer.node_id().short(), services = ?hello.services, "peer re-announced services");
                    self.shared
                        .directory
                        .lock()
                        .await
                        .advertise(peer.node_id(), &hello.services);
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, peer: &Peer, envelope: Envelope) {
        let message = InboundMessage {
            from: peer.node_id(),
            public_key: *peer.record.public_key(),
            service: envelope.service,
            payload: envelope.payload,
        };
        let service = message.service.clone();
        if !self.shared.handlers.dispatch(message) {
            trace!(peer = %peer.node_id().short(), service = %service, "no handler for service, dropping message");
        }
    }

    /// Serve control requests until the connection fails.
    async fn serve_control_streams(&self, peer: &Peer) -> quinn::ConnectionError {
        let mut streams = JoinSet::new();
        loop {
            tokio::select! {
                accepted = peer.link.connection.accept_bi() => match accepted {
                    Ok((send, recv)) => {
                        let this = self.clone();
                        let from = peer.node_id();
                        streams.spawn(async move {
                            if let Err(e) = this.serve_control(send, recv).await {
                                debug!(peer = %from.short(), error = %e, "control stream error");
                            }
                        });
                    }
                    Err(e) => return e,
                },
                Some(_) = streams.join_next(), if !streams.is_empty() => {}
            }
        }
    }

    async fn serve_control(&self, mut send: SendStream, mut recv: RecvStream) -> Result<()> {
        let request = tokio::time::timeout(self.shared.timeouts.control, read_frame(&mut recv))
            .await
            .map_err(|_| anyhow!("control request read timed out"))??;

        let response = match request {
            Some(ControlRequest::Ping) => ControlResponse::Pong,
            Some(ControlRequest::FindNode { target }) => {
                let nodes = self.shared.discovery.handle_find_node(target).await;
                ControlResponse::Nodes(
                    nodes
                        .iter()
                        .take(MAX_PEERS_PER_RESPONSE)
                        .map(PeerInfo::from_record)
                        .collect(),
                )
            }
            None => return Ok(()),
        };

        write_frame(&mut send, &response).await?;
        send.finish().context("failed to finish control stream")?;
        Ok(())
    }

    async fn release(&self, peer: &Peer, reason: &str) {
        peer.link.connection.close(0u32.into(), b"closing");
        let id = peer.node_id();

        let was_current = {
            let mut connected = self.shared.connected.lock().await;
            if connected.get(&id).is_some_and(|p| p.link_id() == peer.link_id()) {
                connected.remove(&id);
                true
            } else {
                false
            }
        };
        if was_current {
            self.shared.directory.lock().await.withdraw(&id);
        }

        log_transition(peer.link.connection.remote_address(), ConnectionState::Closed);
        debug!(peer = %id.short(), reason, "peer disconnected");
    }

    /// Send one message to `peer`'s handler for `service`.
    pub async fn push(&self, peer: &Peer, service: &str, payload: &[u8]) -> Result<(), DeliveryError> {
        if !peer.is_connected() {
            return Err(DeliveryError::Closed);
        }

        let frame = encode_frame(&LinkFrame::Message(Envelope {
            service: service.to_string(),
            payload: payload.to_vec(),
        }))
        .map_err(|e| match e {
            FrameError::TooLarge { size, max } => DeliveryError::TooLarge { size, max },
            FrameError::Encode(e) => DeliveryError::Io(e.to_string()),
        })?;

        let write = async {
            let mut outbound = peer.link.outbound.lock().await;
            outbound.write_all(&frame).await
        };

        match tokio::time::timeout(self.shared.timeouts.push, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(quinn::WriteError::ConnectionLost(_)))
            | Ok(Err(quinn::WriteError::ClosedStream))
            | Ok(Err(quinn::WriteError::Stopped(_))) => Err(DeliveryError::Closed),
            Ok(Err(e)) => Err(DeliveryError::Io(e.to_string())),
            Err(_) => {
                // A partial frame leaves the stream unusable.
                peer.link.connection.close(3u32.into(), b"push timeout");
                Err(DeliveryError::Timeout)
            }
        }
    }

    /// Connected providers of `service`, as a snapshot.
    pub async fn providers_for(&self, service: &str) -> Vec<Peer> {
        let ids = self.shared.directory.lock().await.providers_for(service);
        let connected = self.shared.connected.lock().await;
        ids.into_iter()
            .filter(|id| *id != self.shared.local_id)
            .filter_map(|id| connected.get(&id).filter(|p| p.is_connected()).cloned())
            .collect()
    }

    pub async fn connected_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .shared
            .connected
            .lock()
            .await
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.node_id());
        peers
    }

    pub async fn peer(&self, id: &NodeId) -> Option<Peer> {
        self.shared
            .connected
            .lock()
            .await
            .get(id)
            .filter(|p| p.is_connected())
            .cloned()
    }

    pub async fn services_of(&self, id: &NodeId) -> Vec<String> {
        self.shared.directory.lock().await.services_of(id)
    }

    async fn request(&self, to: &PeerRecord, request: ControlRequest) -> Result<ControlResponse> {
        let peer = self
            .connect(to.addr(), Some(to.public_key()))
            .await
            .map_err(|e| anyhow!(e))?;
        let (mut send, mut recv) = peer
            .link
            .connection
            .open_bi()
            .await
            .context("failed to open control stream")?;
        write_frame(&mut send, &request).await?;
        send.finish().context("failed to finish control stream")?;

        let response: Option<ControlResponse> = read_frame(&mut recv).await?;
        response.context("peer closed control stream without responding")
    }

    /// Close the endpoint and every link. Tasks observe the shutdown signal
    /// on their own.
    pub async fn close_all(&self) {
        self.shared.transport.close();
        let peers: Vec<Peer> = self.shared.connected.lock().await.values().cloned().collect();
        for peer in peers {
            peer.link.connection.close(0u32.into(), b"shutdown");
        }
    }

    /// Wait for every tracked task, aborting whatever is left after `timeout`.
    pub async fn join_tasks(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut tasks = std::mem::take(&mut *self.shared.tasks.lock().await);
            if tasks.is_empty() {
                break;
            }
            let drained = tokio::time::timeout_at(deadline, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(remaining = tasks.len(), "tasks did not stop before timeout, aborting");
                tasks.shutdown().await;
                break;
            }
        }
    }
}

impl LinkRpc {
    fn supervisor(&self) -> Result<Supervisor> {
        self.shared
            .upgrade()
            .map(|shared| Supervisor { shared })
            .ok_or_else(|| anyhow!("node is shutting down"))
    }
}

#[async_trait]
impl DiscoveryRpc for LinkRpc {
    async fn ping(&self, to: &PeerRecord) -> Result<()> {
        match self.supervisor()?.request(to, ControlRequest::Ping).await? {
            ControlResponse::Pong => Ok(()),
            ControlResponse::Error { message } => bail!("ping rejected: {}", message),
            other => bail!("unexpected ping response: {:?}", other),
        }
    }

    async fn find_node(&self, to: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>> {
        let response = self
            .supervisor()?
            .request(to, ControlRequest::FindNode { target })
            .await?;
        match response {
            ControlResponse::Nodes(nodes) => Ok(nodes
                .into_iter()
                .take(MAX_PEERS_PER_RESPONSE)
                .filter_map(PeerInfo::into_record)
                .collect()),
            ControlResponse::Error { message } => bail!("find_node rejected: {}", message),
            other => bail!("unexpected find_node response: {:?}", other),
        }
    }

    async fn introduce(&self, addr: SocketAddr) -> Result<PeerRecord> {
        let peer = self
            .supervisor()?
            .connect(addr, None)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(peer.record.clone())
    }
}

fn log_transition(remote: SocketAddr, state: ConnectionState) {
    trace!(addr = %remote, state = %state, "connection state");
}

fn reject(remote: SocketAddr, error: &HandshakeError) {
    log_transition(remote, ConnectionState::Rejected);
    match error {
        HandshakeError::Closed => trace!(addr = %remote, "handshake abandoned on shutdown"),
        HandshakeError::SelfConnection => debug!(addr = %remote, "rejected connection to self"),
        e => debug!(addr = %remote, error = %e, "handshake failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::shutdown::Shutdown;
    use std::sync::Mutex as StdMutex;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    struct TestNode {
        supervisor: Supervisor,
        addr: SocketAddr,
        keypair: Keypair,
        shutdown: Shutdown,
        inbox: Arc<StdMutex<Vec<InboundMessage>>>,
    }

    impl TestNode {
        async fn stop(&self) {
            self.shutdown.trigger();
            self.supervisor.close_all().await;
            self.supervisor.join_tasks(Duration::from_secs(2)).await;
        }
    }

    async fn start(services: &[&str]) -> TestNode {
        start_with(Keypair::generate(), services, LinkTimeouts::default()).await
    }

    async fn start_with(keypair: Keypair, services: &[&str], timeouts: LinkTimeouts) -> TestNode {
        let transport = Transport::bind("127.0.0.1:0".parse().unwrap(), &keypair).unwrap();
        let addr = transport.local_addr().unwrap();

        let inbox: Arc<StdMutex<Vec<InboundMessage>>> = Arc::new(StdMutex::new(Vec::new()));
        let mut handlers = HandlerRegistry::new();
        for service in services {
            let sink = inbox.clone();
            handlers.register(*service, move |msg| sink.lock().unwrap().push(msg));
        }

        let shutdown = Shutdown::new();
        let (supervisor, actor) = Supervisor::new(
            transport,
            keypair.node_id(),
            Arc::new(handlers),
            Some(addr),
            timeouts,
            DiscoveryParams::default(),
            shutdown.subscribe(),
        );
        supervisor.spawn(actor.run()).await;
        supervisor.spawn_accept_loop().await;

        TestNode {
            supervisor,
            addr,
            keypair,
            shutdown,
            inbox,
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn dial_admits_on_both_sides() {
        let a = start(&["chat"]).await;
        let b = start(&["chat", "files"]).await;

        let peer = a.supervisor.connect(b.addr, None).await.expect("connect");
        assert_eq!(peer.node_id(), b.keypair.node_id());
        assert_eq!(peer.addr(), b.addr);

        let b_sup = b.supervisor.clone();
        let a_id = a.keypair.node_id();
        wait_until(|| {
            let b_sup = b_sup.clone();
            async move { b_sup.peer(&a_id).await.is_some() }
        })
        .await;

        let mut services = a.supervisor.services_of(&b.keypair.node_id()).await;
        services.sort();
        assert_eq!(services, vec!["chat".to_string(), "files".to_string()]);
        assert_eq!(
            a.supervisor.discovery().get(b.keypair.node_id()).await.map(|r| r.node_id()),
            Some(b.keypair.node_id())
        );

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn second_connect_reuses_link() {
        let a = start(&[]).await;
        let b = start(&[]).await;

        let first = a.supervisor.connect(b.addr, None).await.unwrap();
        let second = a
            .supervisor
            .connect(b.addr, Some(&b.keypair.public_key_bytes()))
            .await
            .unwrap();
        assert_eq!(first.link_id(), second.link_id());
        assert_eq!(a.supervisor.connected_peers().await.len(), 1);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let a = start(&[]).await;
        let b = start(&["chat"]).await;

        let peer = a.supervisor.connect(b.addr, None).await.unwrap();
        for i in 0..50u32 {
            a.supervisor
                .push(&peer, "chat", &i.to_be_bytes())
                .await
                .expect("push");
        }

        let inbox = b.inbox.clone();
        wait_until(|| {
            let inbox = inbox.clone();
            async move { inbox.lock().unwrap().len() == 50 }
        })
        .await;

        let received = b.inbox.lock().unwrap().clone();
        for (i, msg) in received.iter().enumerate() {
            assert_eq!(msg.payload, (i as u32).to_be_bytes().to_vec());
            assert_eq!(msg.service, "chat");
            assert_eq!(msg.from, a.keypair.node_id());
            assert_eq!(msg.public_key, a.keypair.public_key_bytes());
        }

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn unknown_service_is_dropped_and_link_survives() {
        let a = start(&[]).await;
        let b = start(&["chat"]).await;

        let peer = a.supervisor.connect(b.addr, None).await.unwrap();
        a.supervisor.push(&peer, "nobody-home", b"lost").await.unwrap();
        a.supervisor.push(&peer, "chat", b"kept").await.unwrap();

        let inbox = b.inbox.clone();
        wait_until(|| {
            let inbox = inbox.clone();
            async move { !inbox.lock().unwrap().is_empty() }
        })
        .await;

        let received = b.inbox.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, b"kept".to_vec());
        assert!(peer.is_connected());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn oversized_push_is_rejected_locally() {
        let a = start(&[]).await;
        let b = start(&["bulk"]).await;

        let peer = a.supervisor.connect(b.addr, None).await.unwrap();
        let payload = vec![0u8; crate::messages::MAX_FRAME_SIZE + 1];
        let result = a.supervisor.push(&peer, "bulk", &payload).await;
        assert!(matches!(result, Err(DeliveryError::TooLarge { .. })));
        assert!(peer.is_connected());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn push_after_remote_shutdown_reports_closed() {
        let a = start(&[]).await;
        let b = start(&["chat"]).await;

        let peer = a.supervisor.connect(b.addr, None).await.unwrap();
        b.stop().await;

        let a_sup = a.supervisor.clone();
        wait_until(|| {
            let a_sup = a_sup.clone();
            async move { a_sup.connected_peers().await.is_empty() }
        })
        .await;

        assert_eq!(
            a.supervisor.push(&peer, "chat", b"late").await,
            Err(DeliveryError::Closed)
        );
        assert!(a.supervisor.providers_for("chat").await.is_empty());
        assert!(
            a.supervisor.discovery().get(b.keypair.node_id()).await.is_some(),
            "routing entries outlive the connection"
        );

        a.stop().await;
    }

    #[tokio::test]
    async fn control_requests_answer_ping_and_find_node() {
        let a = start(&[]).await;
        let b = start(&[]).await;
        let c = start(&[]).await;

        b.supervisor.connect(c.addr, None).await.unwrap();
        let b_record = a.supervisor.connect(b.addr, None).await.unwrap().record().clone();

        let rpc = LinkRpc {
            shared: Arc::downgrade(&a.supervisor.shared),
        };
        rpc.ping(&b_record).await.expect("ping");

        let c_id = c.keypair.node_id();
        let found = rpc.find_node(&b_record, c_id).await.expect("find_node");
        assert!(found.iter().any(|r| r.node_id() == c_id));

        a.stop().await;
        b.stop().await;
        c.stop().await;
    }

    #[tokio::test]
    async fn connecting_to_self_is_rejected() {
        let a = start(&["chat"]).await;
        let result = a.supervisor.connect(a.addr, None).await;
        assert_eq!(result.err(), Some(HandshakeError::SelfConnection));
        assert!(a.supervisor.connected_peers().await.is_empty());
        assert!(a.supervisor.discovery().all_known().await.is_empty());
        a.stop().await;
    }

    #[tokio::test]
    async fn providers_snapshot_excludes_local_node() {
        let a = start(&["chat"]).await;
        let b = start(&["chat"]).await;

        a.supervisor.connect(b.addr, None).await.unwrap();
        let providers = a.supervisor.providers_for("chat").await;
        let ids: Vec<NodeId> = providers.iter().map(|p| p.node_id()).collect();
        assert_eq!(ids, vec![b.keypair.node_id()]);

        a.stop().await;
        b.stop().await;
    }

    /// A client that completes TLS but speaks no link protocol.
    async fn raw_dial(server: &TestNode) -> (Transport, Connection) {
        let keypair = Keypair::generate();
        let client = Transport::bind("127.0.0.1:0".parse().unwrap(), &keypair).unwrap();
        let (connection, _) = client
            .dial(
                server.addr,
                Some(&server.keypair.public_key_bytes()),
                Duration::from_secs(2),
            )
            .await
            .expect("tls handshake");
        (client, connection)
    }

    fn close_reason(error: quinn::ConnectionError) -> Option<(quinn::VarInt, Vec<u8>)> {
        match error {
            quinn::ConnectionError::ApplicationClosed(close) => {
                Some((close.error_code, close.reason.to_vec()))
            }
            _ => None,
        }
    }

    fn short_handshake() -> LinkTimeouts {
        LinkTimeouts {
            handshake: Duration::from_millis(400),
            ..LinkTimeouts::default()
        }
    }

    #[tokio::test]
    async fn silent_client_is_rejected_after_hello_timeout() {
        let server = start_with(Keypair::generate(), &["chat"], short_handshake()).await;
        let (_client, connection) = raw_dial(&server).await;

        let closed = tokio::time::timeout(TEST_TIMEOUT, connection.closed())
            .await
            .expect("server never closed the link");
        assert_eq!(
            close_reason(closed),
            Some((quinn::VarInt::from_u32(2), b"hello timeout".to_vec()))
        );
        assert!(server.supervisor.connected_peers().await.is_empty());
        assert!(server.supervisor.discovery().all_known().await.is_empty());
        assert!(server.supervisor.providers_for("chat").await.is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn message_before_hello_is_rejected() {
        let server = start_with(Keypair::generate(), &["chat"], short_handshake()).await;
        let (_client, connection) = raw_dial(&server).await;

        let mut send = connection.open_uni().await.unwrap();
        let early = LinkFrame::Message(Envelope {
            service: "chat".to_string(),
            payload: b"too soon".to_vec(),
        });
        write_frame(&mut send, &early).await.unwrap();

        let closed = tokio::time::timeout(TEST_TIMEOUT, connection.closed())
            .await
            .expect("server never closed the link");
        assert_eq!(
            close_reason(closed),
            Some((quinn::VarInt::from_u32(2), b"bad hello".to_vec()))
        );
        assert!(server.supervisor.connected_peers().await.is_empty());
        assert!(server.supervisor.discovery().all_known().await.is_empty());
        assert!(server.inbox.lock().unwrap().is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_handshake() {
        let timeouts = LinkTimeouts {
            handshake: Duration::from_secs(30),
            ..LinkTimeouts::default()
        };
        let server = start_with(Keypair::generate(), &[], timeouts).await;
        let (_client, connection) = raw_dial(&server).await;

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(3), server.stop())
            .await
            .expect("shutdown waited on the handshake");
        assert!(started.elapsed() < Duration::from_secs(3));

        tokio::time::timeout(TEST_TIMEOUT, connection.closed())
            .await
            .expect("pending link closed on shutdown");
        assert!(server.supervisor.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn redial_from_same_node_replaces_stale_link() {
        let a = start(&[]).await;
        let b = start(&["chat"]).await;
        let a_id = a.keypair.node_id();

        let first = a.supervisor.connect(b.addr, None).await.unwrap();
        let b_sup = b.supervisor.clone();
        wait_until(|| {
            let b_sup = b_sup.clone();
            async move { b_sup.peer(&a_id).await.is_some() }
        })
        .await;

        // Same identity on a new endpoint, as after a restart whose old
        // connection b has not noticed yet.
        let restarted = start_with(a.keypair.clone(), &[], LinkTimeouts::default()).await;
        let second = restarted.supervisor.connect(b.addr, None).await.unwrap();
        assert_ne!(first.link_id(), second.link_id());

        let restarted_addr = restarted.addr;
        wait_until(|| {
            let b_sup = b_sup.clone();
            async move {
                b_sup
                    .peer(&a_id)
                    .await
                    .is_some_and(|p| p.link.connection.remote_address() == restarted_addr)
            }
        })
        .await;

        wait_until(|| {
            let first = first.clone();
            async move { !first.is_connected() }
        })
        .await;
        assert!(second.is_connected());
        restarted
            .supervisor
            .push(&second, "chat", b"after restart")
            .await
            .expect("new link delivers");

        let inbox = b.inbox.clone();
        wait_until(|| {
            let inbox = inbox.clone();
            async move { inbox.lock().unwrap().len() == 1 }
        })
        .await;

        a.stop().await;
        restarted.stop().await;
        b.stop().await;
    }
}
