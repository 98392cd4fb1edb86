//! # Identities and the XOR Keyspace
//!
//! This module defines the identifier types that share the 256-bit Kademlia
//! keyspace:
//!
//! - [`PeerId`]: 32-byte Ed25519 public key identifying a peer
//! - [`ContentId`]: 32-byte BLAKE3 digest identifying content
//! - [`Key`]: a point in the keyspace (any of the above, or a name key)
//! - [`Distance`]: XOR distance between two keys
//! - [`Keypair`]: Ed25519 signing keypair
//! - [`PeerRecord`]: a peer's addresses, protocols and last-seen time
//!
//! ## Distance Ordering
//!
//! `Distance` compares as a big-endian 256-bit unsigned integer, which is the
//! same as lexicographic byte order. `distance(a, b) == distance(b, a)` and
//! `distance(a, a) == Distance::ZERO`.
//!
//! ## Text Form
//!
//! Identifiers are hex encoded (64 characters) wherever they appear in text:
//! HTTP paths, logs, configuration.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Protocol tag advertised by every node speaking the DHT request set.
pub const DHT_PROTOCOL: &str = "/kadroute/kad/1.0.0";

/// Domain prefix hashed with a name to derive its DHT key.
const NAME_KEY_DOMAIN: &[u8] = b"/ipns/";

/// Error parsing a hex-encoded 32-byte identifier.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

fn parse_32(s: &str) -> Result<[u8; 32], IdParseError> {
    let bytes = hex::decode(s)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| IdParseError::Length(len))
}

// ============================================================================
// Keyspace
// ============================================================================

/// A point in the 256-bit XOR keyspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key([u8; 32]);

impl Key {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn distance(&self, other: &Key) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Number of leading bits shared with `other` (256 when equal).
    pub fn common_prefix_len(&self, other: &Key) -> usize {
        self.distance(other).leading_zeros()
    }

    /// DHT key under which a name record is stored.
    pub fn for_name(name: &crate::ipns::Name) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(NAME_KEY_DOMAIN);
        hasher.update(name.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.short_hex())
    }
}

impl From<PeerId> for Key {
    fn from(id: PeerId) -> Self {
        Self(id.0)
    }
}

impl From<ContentId> for Key {
    fn from(id: ContentId) -> Self {
        Self(id.0)
    }
}

/// XOR distance between two keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; 32]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; 32]);
    pub const MAX: Distance = Distance([0xFF; 32]);

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        256
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// PeerId
// ============================================================================

/// Peer identity: the peer's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn key(&self) -> Key {
        Key(self.0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Whether the bytes form a usable Ed25519 public key.
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::from_bytes(&self.0).is_ok()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_32(s).map(Self)
    }
}

// ============================================================================
// ContentId
// ============================================================================

/// Content identifier: BLAKE3 digest of the content bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentId([u8; 32]);

impl ContentId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn for_content(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn key(&self) -> Key {
        Key(self.0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.short_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_32(s).map(Self)
    }
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id().short_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PeerRecord
// ============================================================================

/// What this node knows about how to reach a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Dialable addresses, most preferred first.
    pub addrs: Vec<String>,
    pub protocols: BTreeSet<String>,
    pub last_seen: Timestamp,
}

impl PeerRecord {
    /// A record advertising the DHT protocol, never seen yet.
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        let mut protocols = BTreeSet::new();
        protocols.insert(DHT_PROTOCOL.to_string());
        Self {
            id,
            addrs,
            protocols,
            last_seen: Timestamp::ZERO,
        }
    }

    pub fn with_last_seen(mut self, at: Timestamp) -> Self {
        self.last_seen = at;
        self
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(String::as_str)
    }

    /// Fold a newer sighting of the same peer into this record.
    ///
    /// Non-empty address lists replace older ones; protocols accumulate.
    pub fn merge_from(&mut self, newer: &PeerRecord) {
        debug_assert_eq!(self.id, newer.id);
        if !newer.addrs.is_empty() {
            self.addrs = newer.addrs.clone();
        }
        self.protocols.extend(newer.protocols.iter().cloned());
        self.last_seen = self.last_seen.max(newer.last_seen);
    }
}
