//! # Signed Name Records
//!
//! A [`Name`] is the [`PeerId`] of the key that signs its records. A
//! [`NameRecord`] binds the name to a value string until a validity deadline,
//! and carries a sequence number so newer publications supersede older ones.
//!
//! ## Validation
//!
//! | Check | Failure |
//! |-------|---------|
//! | value non-empty, encoded size ≤ [`MAX_RECORD_SIZE`] | [`ValidationError::Malformed`] |
//! | embedded public key (if any) equals the name | [`ValidationError::NameMismatch`] |
//! | Ed25519 signature over the payload | [`ValidationError::SignatureInvalid`] |
//! | `now <= validity` ([`validate`] only) | [`ValidationError::Expired`] |
//!
//! A record is still valid at exactly its deadline.
//!
//! ## Selection
//!
//! [`select_best`] replaces the current record only if the candidate has a
//! strictly higher sequence, or the same sequence and a strictly later
//! deadline. Ties keep what is already held, so repeated delivery of the same
//! record is a no-op.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::crypto::{NAME_RECORD_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::error::ValidationError;
use crate::identity::{IdParseError, Key, Keypair, PeerId};

/// Maximum encoded size of a name record.
pub const MAX_RECORD_SIZE: u64 = 10 * 1024;

fn record_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_RECORD_SIZE)
        .with_fixint_encoding()
}

/// A mutable name, identified by the public key allowed to publish under it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name(PeerId);

impl Name {
    pub fn from_public_key(key: [u8; 32]) -> Self {
        Self(PeerId::from_bytes(key))
    }

    pub fn for_keypair(keypair: &Keypair) -> Self {
        Self(keypair.peer_id())
    }

    pub fn peer_id(&self) -> PeerId {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// DHT key of this name.
    pub fn key(&self) -> Key {
        Key::for_name(self)
    }
}

impl From<PeerId> for Name {
    fn from(id: PeerId) -> Self {
        Self(id)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self.0.short_hex())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Name {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidityType {
    /// Valid until an absolute end-of-life timestamp.
    Eol,
}

impl ValidityType {
    fn tag(self) -> u8 {
        match self {
            ValidityType::Eol => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    pub value: String,
    pub validity: Timestamp,
    pub validity_type: ValidityType,
    pub sequence: u64,
    /// How long resolvers may cache the record, in milliseconds.
    pub ttl_ms: u64,
    pub public_key: Option<[u8; 32]>,
    pub signature: Vec<u8>,
}

impl NameRecord {
    /// Create a record for `keypair`'s name, signed and with the public key
    /// embedded.
    pub fn new_signed(
        keypair: &Keypair,
        value: impl Into<String>,
        sequence: u64,
        validity: Timestamp,
        ttl: Duration,
    ) -> Self {
        let mut record = Self {
            value: value.into(),
            validity,
            validity_type: ValidityType::Eol,
            sequence,
            ttl_ms: ttl.as_millis() as u64,
            public_key: Some(keypair.public_key_bytes()),
            signature: Vec::new(),
        };
        record.signature =
            sign_with_domain(keypair, NAME_RECORD_SIGNATURE_DOMAIN, &record.signing_payload());
        record
    }

    /// Drop the embedded public key; verifiers then fall back to the name.
    pub fn without_embedded_key(mut self) -> Self {
        self.public_key = None;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Bytes covered by the signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        let value = self.value.as_bytes();
        let mut buf = Vec::with_capacity(value.len() + 33);
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value);
        buf.extend_from_slice(&self.validity.as_millis().to_be_bytes());
        buf.push(self.validity_type.tag());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.ttl_ms.to_be_bytes());
        buf
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        record_codec()
            .serialize(self)
            .map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        record_codec()
            .deserialize(bytes)
            .map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.validity
    }
}

/// Check signature, key binding and size, ignoring the validity deadline.
pub fn validate_structure(name: &Name, record: &NameRecord) -> Result<(), ValidationError> {
    if record.value.is_empty() {
        return Err(ValidationError::Malformed("empty value".into()));
    }
    let encoded = record_codec()
        .serialized_size(record)
        .map_err(|_| ValidationError::Malformed("record exceeds size limit".into()))?;
    if encoded > MAX_RECORD_SIZE {
        return Err(ValidationError::Malformed("record exceeds size limit".into()));
    }

    let public_key = match record.public_key {
        Some(embedded) if embedded != *name.as_bytes() => {
            return Err(ValidationError::NameMismatch);
        }
        Some(embedded) => embedded,
        None => *name.as_bytes(),
    };

    verify_with_domain(
        &public_key,
        NAME_RECORD_SIGNATURE_DOMAIN,
        &record.signing_payload(),
        &record.signature,
    )
    .map_err(|_| ValidationError::SignatureInvalid)
}

/// Full validation at `now`.
pub fn validate(name: &Name, record: &NameRecord, now: Timestamp) -> Result<(), ValidationError> {
    validate_structure(name, record)?;
    if record.is_expired_at(now) {
        return Err(ValidationError::Expired {
            deadline: record.validity,
            now,
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    KeepCurrent,
    Replace,
}

/// Pick between a validated candidate and the currently held record.
pub fn select_best(candidate: &NameRecord, current: Option<&NameRecord>) -> Selection {
    let Some(current) = current else {
        return Selection::Replace;
    };
    if candidate.sequence > current.sequence
        || (candidate.sequence == current.sequence && candidate.validity > current.validity)
    {
        Selection::Replace
    } else {
        Selection::KeepCurrent
    }
}

/// Result of offering a valid record to a holder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    /// A record at least as authoritative is already held.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn deadline() -> Timestamp {
        Timestamp::from_millis(1_000_000)
    }

    fn record(kp: &Keypair, seq: u64) -> NameRecord {
        NameRecord::new_signed(kp, "/ipfs/bafyvalue", seq, deadline(), HOUR)
    }

    #[test]
    fn signed_record_validates() {
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        let rec = record(&kp, 1);
        assert!(validate(&name, &rec, Timestamp::from_millis(10)).is_ok());
    }

    #[test]
    fn record_without_embedded_key_verifies_against_name() {
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        let rec = record(&kp, 1).without_embedded_key();
        assert!(validate_structure(&name, &rec).is_ok());

        let other = Name::for_keypair(&Keypair::generate());
        assert_eq!(
            validate_structure(&other, &rec),
            Err(ValidationError::SignatureInvalid)
        );
    }

    #[test]
    fn embedded_key_must_match_name() {
        let kp = Keypair::generate();
        let other = Name::for_keypair(&Keypair::generate());
        assert_eq!(
            validate_structure(&other, &record(&kp, 1)),
            Err(ValidationError::NameMismatch)
        );
    }

    #[test]
    fn tampered_record_fails_signature() {
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);

        let mut rec = record(&kp, 1);
        rec.value = "/ipfs/bafyforged".into();
        assert_eq!(
            validate_structure(&name, &rec),
            Err(ValidationError::SignatureInvalid)
        );

        let mut rec = record(&kp, 1);
        rec.sequence = 99;
        assert_eq!(
            validate_structure(&name, &rec),
            Err(ValidationError::SignatureInvalid)
        );
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        let rec = record(&kp, 1);
        assert!(validate(&name, &rec, deadline()).is_ok());
        assert_eq!(
            validate(&name, &rec, Timestamp::from_millis(deadline().as_millis() + 1)),
            Err(ValidationError::Expired {
                deadline: deadline(),
                now: Timestamp::from_millis(deadline().as_millis() + 1),
            })
        );
        assert!(validate_structure(&name, &rec).is_ok());
    }

    #[test]
    fn empty_and_oversized_values_are_malformed() {
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        let empty = NameRecord::new_signed(&kp, "", 1, deadline(), HOUR);
        assert!(matches!(
            validate_structure(&name, &empty),
            Err(ValidationError::Malformed(_))
        ));

        let huge = NameRecord::new_signed(&kp, "x".repeat(20 * 1024), 1, deadline(), HOUR);
        assert!(matches!(
            validate_structure(&name, &huge),
            Err(ValidationError::Malformed(_))
        ));
        assert!(huge.to_bytes().is_err());
    }

    #[test]
    fn blob_round_trip_preserves_signature() {
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        let rec = record(&kp, 7);
        let decoded = NameRecord::from_bytes(&rec.to_bytes().expect("encode")).expect("decode");
        assert_eq!(decoded, rec);
        assert!(validate_structure(&name, &decoded).is_ok());
        assert!(NameRecord::from_bytes(&[0xFF; 3]).is_err());
    }

    #[test]
    fn higher_sequence_replaces_lower_never_does() {
        let kp = Keypair::generate();
        let five = record(&kp, 5);
        let six = record(&kp, 6);
        assert_eq!(select_best(&six, Some(&five)), Selection::Replace);
        assert_eq!(select_best(&five, Some(&six)), Selection::KeepCurrent);
        assert_eq!(select_best(&five, None), Selection::Replace);
    }

    #[test]
    fn equal_sequence_prefers_strictly_later_deadline() {
        let kp = Keypair::generate();
        let early = NameRecord::new_signed(&kp, "/ipfs/a", 3, Timestamp::from_millis(100), HOUR);
        let late = NameRecord::new_signed(&kp, "/ipfs/b", 3, Timestamp::from_millis(200), HOUR);
        assert_eq!(select_best(&late, Some(&early)), Selection::Replace);
        assert_eq!(select_best(&early, Some(&late)), Selection::KeepCurrent);
        assert_eq!(select_best(&late, Some(&late)), Selection::KeepCurrent);
    }

    #[test]
    fn name_key_differs_from_peer_key() {
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        assert_ne!(name.key(), kp.peer_id().key());
        let parsed: Name = name.to_string().parse().expect("parse");
        assert_eq!(parsed, name);
    }
}
