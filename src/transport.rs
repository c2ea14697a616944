//! # QUIC Transport
//!
//! A single QUIC endpoint per node serves both directions: it accepts
//! inbound connections and dials outbound ones. Every connection is mutually
//! authenticated with the certificates from [`crate::crypto`], and the first
//! thing either side learns is the verified public key of the other.
//!
//! Dials come in two shapes:
//!
//! - pinned: the expected public key is known and encoded in the SNI
//! - unpinned: only an address is known (bootstrap); identity is learned
//!
//! Both directions reject a connection whose remote key equals our own.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tracing::debug;

use crate::crypto::{
    create_client_config, create_server_config, extract_verified_public_key,
    generate_ed25519_cert, public_key_to_sni, UNPINNED_SNI,
};
use crate::identity::Keypair;

/// Why a connection never reached the admitted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The handshake did not finish within the configured timeout.
    Timeout,
    /// Certificate verification or the TLS exchange failed.
    Tls(String),
    /// The connection failed for a non-TLS reason.
    Connect(String),
    /// The remote certificate carried no usable Ed25519 key.
    MissingIdentity,
    /// The remote presented our own key.
    SelfConnection,
    /// The peer broke the Hello exchange.
    Protocol(String),
    /// The local endpoint is closing.
    Closed,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Timeout => write!(f, "handshake timed out"),
            HandshakeError::Tls(e) => write!(f, "TLS handshake failed: {}", e),
            HandshakeError::Connect(e) => write!(f, "connection failed: {}", e),
            HandshakeError::MissingIdentity => write!(f, "peer presented no verifiable identity"),
            HandshakeError::SelfConnection => write!(f, "refusing connection to self"),
            HandshakeError::Protocol(e) => write!(f, "protocol violation: {}", e),
            HandshakeError::Closed => write!(f, "endpoint is closing"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<quinn::ConnectionError> for HandshakeError {
    fn from(e: quinn::ConnectionError) -> Self {
        match e {
            quinn::ConnectionError::TimedOut => HandshakeError::Timeout,
            quinn::ConnectionError::LocallyClosed => HandshakeError::Closed,
            quinn::ConnectionError::TransportError(t) => HandshakeError::Tls(t.to_string()),
            other => HandshakeError::Connect(other.to_string()),
        }
    }
}

impl From<quinn::ConnectError> for HandshakeError {
    fn from(e: quinn::ConnectError) -> Self {
        match e {
            quinn::ConnectError::EndpointStopping => HandshakeError::Closed,
            other => HandshakeError::Connect(other.to_string()),
        }
    }
}

pub struct Transport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    local_public_key: [u8; 32],
}

impl Transport {
    /// Bind a QUIC endpoint at `addr` presenting `keypair`'s certificate.
    pub fn bind(addr: SocketAddr, keypair: &Keypair) -> Result<Self> {
        let (server_certs, server_key) = generate_ed25519_cert(keypair)?;
        let (client_certs, client_key) = generate_ed25519_cert(keypair)?;

        let server_config = create_server_config(server_certs, server_key)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {}", addr))?;

        Ok(Self {
            endpoint,
            client_config,
            local_public_key: keypair.public_key_bytes(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("failed to get local address")
    }

    /// Next inbound connection attempt, or `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Dial `addr`. With `expected` set, the handshake fails unless the peer
    /// proves that exact key.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        expected: Option<&[u8; 32]>,
        timeout: Duration,
    ) -> Result<(Connection, [u8; 32]), HandshakeError> {
        if expected == Some(&self.local_public_key) {
            return Err(HandshakeError::SelfConnection);
        }
        let sni = match expected {
            Some(public_key) => public_key_to_sni(public_key),
            None => UNPINNED_SNI.to_string(),
        };

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &sni)?;
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        debug!(remote = %addr, pinned = expected.is_some(), "outbound TLS handshake complete");
        let public_key = self.verify_remote(&connection)?;
        Ok((connection, public_key))
    }

    /// Finish an inbound handshake within `timeout`.
    pub async fn complete_inbound(
        &self,
        incoming: Incoming,
        timeout: Duration,
    ) -> Result<(Connection, [u8; 32]), HandshakeError> {
        let connection = tokio::time::timeout(timeout, incoming)
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        debug!(remote = %connection.remote_address(), "inbound TLS handshake complete");
        let public_key = self.verify_remote(&connection)?;
        Ok((connection, public_key))
    }

    fn verify_remote(&self, connection: &Connection) -> Result<[u8; 32], HandshakeError> {
        let Some(public_key) = extract_verified_public_key(connection) else {
            connection.close(1u32.into(), b"missing identity");
            return Err(HandshakeError::MissingIdentity);
        };
        if public_key == self.local_public_key {
            connection.close(1u32.into(), b"self connection");
            return Err(HandshakeError::SelfConnection);
        }
        Ok(public_key)
    }

    /// Close every connection and stop accepting.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }

    /// Wait for in-flight connections to drain, bounded by `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.endpoint.wait_idle()).await.is_err() {
            debug!("endpoint did not become idle before timeout");
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.endpoint.local_addr().ok())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Bind a transport that completes every inbound handshake in the background.
    fn listening(keypair: &Keypair) -> Arc<Transport> {
        let transport = Arc::new(Transport::bind(loopback(), keypair).expect("bind"));
        let server = transport.clone();
        tokio::spawn(async move {
            while let Some(incoming) = server.accept().await {
                let server = server.clone();
                tokio::spawn(async move {
                    if let Ok((conn, _)) = server.complete_inbound(incoming, HANDSHAKE_TIMEOUT).await {
                        conn.closed().await;
                    }
                });
            }
        });
        transport
    }

    #[tokio::test]
    async fn pinned_dial_learns_expected_key() {
        let server_kp = Keypair::generate();
        let server = listening(&server_kp);
        let client = Transport::bind(loopback(), &Keypair::generate()).unwrap();

        let (_conn, key) = client
            .dial(server.local_addr().unwrap(), Some(&server_kp.public_key_bytes()), HANDSHAKE_TIMEOUT)
            .await
            .expect("pinned dial should succeed");
        assert_eq!(key, server_kp.public_key_bytes());
    }

    #[tokio::test]
    async fn pinned_dial_rejects_wrong_key() {
        let server = listening(&Keypair::generate());
        let client = Transport::bind(loopback(), &Keypair::generate()).unwrap();
        let impostor = Keypair::generate().public_key_bytes();

        let result = client
            .dial(server.local_addr().unwrap(), Some(&impostor), HANDSHAKE_TIMEOUT)
            .await;
        assert!(matches!(result, Err(HandshakeError::Tls(_))), "got {:?}", result.err());
    }

    #[tokio::test]
    async fn unpinned_dial_learns_identity() {
        let server_kp = Keypair::generate();
        let server = listening(&server_kp);
        let client = Transport::bind(loopback(), &Keypair::generate()).unwrap();

        let (_conn, key) = client
            .dial(server.local_addr().unwrap(), None, HANDSHAKE_TIMEOUT)
            .await
            .expect("unpinned dial should succeed");
        assert_eq!(key, server_kp.public_key_bytes());
    }

    #[tokio::test]
    async fn dialing_own_address_is_rejected() {
        let kp = Keypair::generate();
        let transport = listening(&kp);
        let addr = transport.local_addr().unwrap();

        let result = transport.dial(addr, None, HANDSHAKE_TIMEOUT).await;
        assert_eq!(result.err(), Some(HandshakeError::SelfConnection));

        let result = transport.dial(addr, Some(&kp.public_key_bytes()), HANDSHAKE_TIMEOUT).await;
        assert_eq!(result.err(), Some(HandshakeError::SelfConnection));
    }

    #[tokio::test]
    async fn silent_address_times_out() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();
        let client = Transport::bind(loopback(), &Keypair::generate()).unwrap();

        let result = client.dial(addr, None, Duration::from_millis(300)).await;
        assert_eq!(result.err(), Some(HandshakeError::Timeout));
    }
}
