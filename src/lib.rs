//! # Splice - Peer-to-Peer Service Discovery Overlay
//!
//! Splice lets independent processes find each other by service name and
//! exchange messages point to point, without a central server:
//!
//! - **Identity**: Ed25519 keypair per node; node ID = BLAKE3 of the public key
//! - **Discovery**: Kademlia routing table with liveness-checked eviction and
//!   iterative lookups
//! - **Links**: QUIC with mutual TLS; every connection is authenticated to a
//!   node ID before anything else is read from it
//! - **Services**: peers announce the services they handle; messages are
//!   pushed to every current provider of a service
//!
//! ## Architecture
//!
//! The routing table is owned by an actor; the rest of the node talks to it
//! through a cheap-to-clone handle. The connection supervisor owns every
//! QUIC connection and implements the discovery layer's network trait.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: start, bootstrap, providers, push, broadcast, shutdown |
//! | `config` | `NodeConfig` and its validation |
//! | `identity` | Keypairs, node IDs, peer records |
//! | `routing` | Kademlia routing table, lookups, bucket refresh |
//! | `supervisor` | Connection admission, read loops, push, discovery RPC |
//! | `directory` | Service directory and local handler registry |
//! | `transport` | QUIC endpoint and handshake |
//! | `crypto` | TLS certificate generation and verification |
//! | `protocols` | Network trait used by discovery |
//! | `messages` | Wire frames and bounded framing |

mod config;
mod crypto;
mod directory;
mod identity;
mod messages;
mod node;
mod protocols;
mod routing;
mod shutdown;
mod supervisor;
mod transport;

pub use config::{parse_public_addr, validate_port, ConfigError, NodeConfig, DEFAULT_PORT};
pub use directory::{Handler, HandlerRegistry, InboundMessage};
pub use identity::{Keypair, NodeId, PeerRecord};
pub use messages::MAX_PAYLOAD_SIZE;
pub use node::{BootstrapOutcome, Delivery, Node};
pub use supervisor::{ConnectionState, DeliveryError, Peer};
pub use transport::HandshakeError;
