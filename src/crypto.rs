//! Domain-separated Ed25519 signatures.
//!
//! Every signed structure uses its own prefix so a signature produced for one
//! purpose can never be replayed as another.

use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

use crate::identity::Keypair;

/// Domain separation prefix for name record signatures.
pub const NAME_RECORD_SIGNATURE_DOMAIN: &[u8] = b"kadroute-name-record-v1:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    /// Expected 64 bytes.
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Sign `domain || data`, returning the 64-byte signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature made by [`sign_with_domain`].
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
