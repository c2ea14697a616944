//! # Identity and Peer Records
//!
//! Core identity types used throughout splice:
//!
//! - [`Keypair`]: Ed25519 signing keypair, exactly one per running node
//! - [`NodeId`]: BLAKE3 digest of the public key, the key of the XOR metric
//! - [`PeerRecord`]: a known peer (identity, public key, dial address, last contact)
//!
//! ## Identity Model
//!
//! A node proves possession of its public key during the TLS handshake. The
//! node ID is always derived from that key, so a [`PeerRecord`] can never pair
//! an ID with a key it was not computed from.
//!
//! ## Invariants
//!
//! - `NodeId::from_bytes(b).as_bytes() == b`
//! - XOR distance is symmetric and zero only for equal IDs
//! - Only valid Ed25519 points are accepted as peer public keys

use std::net::SocketAddr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Number of bits in a node ID.
pub const ID_BITS: usize = 256;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id().to_hex())
            .finish_non_exhaustive()
    }
}

/// Returns true if `bytes` is a usable Ed25519 public key.
///
/// All-zero and all-0xFF keys are rejected before the curve point check.
pub fn is_valid_public_key(bytes: &[u8; 32]) -> bool {
    if bytes.iter().all(|&b| b == 0) || bytes.iter().all(|&b| b == 0xFF) {
        return false;
    }
    VerifyingKey::try_from(bytes.as_slice()).is_ok()
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Derive the node ID for a public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Last six hex characters, used as a compact handle in chat output.
    pub fn short(&self) -> String {
        let hex = self.to_hex();
        hex[hex.len() - 6..].to_string()
    }
}

/// Compare two XOR distances as big-endian integers.
///
/// # Example
/// ```ignore
/// let dist_a = target.xor_distance(&a);
/// let dist_b = target.xor_distance(&b);
/// if distance_cmp(&dist_a, &dist_b) == Ordering::Less {
///     // a is closer to target than b
/// }
/// ```
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

/// Position of the highest set bit of a distance, counted from 1.
///
/// Zero for a zero distance, 256 when the top bit differs.
pub fn distance_bit_length(distance: &[u8; 32]) -> usize {
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = byte_idx * 8 + byte.leading_zeros() as usize;
            return ID_BITS - leading;
        }
    }
    0
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A peer this node knows how to reach, connected or not.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    node_id: NodeId,
    public_key: [u8; 32],
    addr: SocketAddr,
    last_seen: Instant,
}

impl PeerRecord {
    /// Build a record for a verified public key. Returns `None` if the key is
    /// not a valid Ed25519 point.
    pub fn new(public_key: [u8; 32], addr: SocketAddr) -> Option<Self> {
        if !is_valid_public_key(&public_key) {
            return None;
        }
        Some(Self {
            node_id: NodeId::from_public_key(&public_key),
            public_key,
            addr,
            last_seen: Instant::now(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Record a fresh contact, optionally at a new address.
    pub fn touch(&mut self, addr: SocketAddr) {
        self.addr = addr;
        self.last_seen = Instant::now();
    }
}

impl PartialEq for PeerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerRecord {}

impl std::hash::Hash for PeerRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9001".parse().unwrap()
    }

    #[test]
    fn test_keypair_generation() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.node_id(), kp2.node_id());
        assert_ne!(kp1.public_key_bytes(), kp2.public_key_bytes());
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = Keypair::generate();
        let message = b"hello world";

        let signature = kp.sign(message);
        assert!(kp.verify(message, &signature));

        assert!(!kp.verify(b"wrong message", &signature));
    }

    #[test]
    fn node_id_is_digest_of_public_key() {
        let kp = Keypair::generate();
        let expected = *blake3::hash(&kp.public_key_bytes()).as_bytes();
        assert_eq!(kp.node_id().as_bytes(), &expected);
        assert_ne!(kp.node_id().as_bytes(), &kp.public_key_bytes());
    }

    #[test]
    fn keypair_reconstruction_preserves_node_id() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());
        assert_eq!(kp.node_id(), restored.node_id());
    }

    #[test]
    fn test_xor_distance() {
        let a = NodeId::from_bytes([0xFF; 32]);
        let b = NodeId::from_bytes([0x00; 32]);
        let c = NodeId::from_bytes([0xFF; 32]);

        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xFF; 32]);
        assert_eq!(a.xor_distance(&c), [0u8; 32]);
    }

    #[test]
    fn distance_cmp_orders_lexicographically() {
        use std::cmp::Ordering;
        let mut smaller = [0u8; 32];
        smaller[1] = 1;
        let mut larger = [0u8; 32];
        larger[1] = 2;

        assert_eq!(distance_cmp(&smaller, &larger), Ordering::Less);
        assert_eq!(distance_cmp(&larger, &smaller), Ordering::Greater);
        assert_eq!(distance_cmp(&smaller, &smaller), Ordering::Equal);
    }

    #[test]
    fn bit_length_tracks_highest_set_bit() {
        assert_eq!(distance_bit_length(&[0u8; 32]), 0);

        let mut top = [0u8; 32];
        top[0] = 0x80;
        assert_eq!(distance_bit_length(&top), 256);

        let mut lowest = [0u8; 32];
        lowest[31] = 0x01;
        assert_eq!(distance_bit_length(&lowest), 1);

        let mut mid = [0u8; 32];
        mid[1] = 0x10;
        mid[31] = 0xFF;
        assert_eq!(distance_bit_length(&mid), 256 - 8 - 3);
    }

    #[test]
    fn hex_roundtrip_and_rejects_bad_input() {
        let id = Keypair::generate().node_id();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);

        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn short_form_is_hex_suffix() {
        let id = Keypair::generate().node_id();
        let short = id.short();
        assert_eq!(short.len(), 6);
        assert!(id.to_hex().ends_with(&short));
    }

    #[test]
    fn peer_record_derives_id_from_key() {
        let kp = Keypair::generate();
        let record = PeerRecord::new(kp.public_key_bytes(), addr()).expect("valid key");
        assert_eq!(record.node_id(), kp.node_id());
        assert_eq!(record.public_key(), &kp.public_key_bytes());
        assert_eq!(record.addr(), addr());
    }

    #[test]
    fn peer_record_rejects_invalid_keys() {
        assert!(PeerRecord::new([0u8; 32], addr()).is_none());
        assert!(PeerRecord::new([0xFF; 32], addr()).is_none());
    }

    #[test]
    fn touch_updates_address_and_timestamp() {
        let kp = Keypair::generate();
        let mut record = PeerRecord::new(kp.public_key_bytes(), addr()).unwrap();
        let before = record.last_seen();
        let moved: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        record.touch(moved);
        assert_eq!(record.addr(), moved);
        assert!(record.last_seen() >= before);
    }
}
