//! Blinded, self-decryptable envelopes.
//!
//! The inner event is signed with the real key and encrypted under an ephemeral key
//! `e = (s * iv) mod n`, where `s` is the sender's secret scalar and `iv` is the 16-byte
//! nonce embedded in the payload. The outer event is published under `e`'s public key, so
//! observers cannot link it to the sender, yet the sender can re-derive `e` from the
//! payload alone and read back anything it sent.
//!
//! Version `1` always means this derivation.

use bitcoin::secp256k1::{Scalar, SecretKey};
use tracing::debug;

use crate::crypto::{IV_LEN, random_iv};
use crate::keys::Keys;
use crate::nip01::{
    Event, KIND_BLINDED_ENVELOPE, Nip01Error, UnsignedEvent, finalize_event, get_public_key_hex,
    verify_event,
};
use crate::versioned::{
    EncryptionVersion, EnvelopeError, decrypt_versioned, encrypt_versioned, split_payload,
};

/// Multiply `secret` by the big-endian integer `iv`, modulo the curve order.
pub fn blind_secret_key(secret: &SecretKey, iv: &[u8; IV_LEN]) -> Result<SecretKey, EnvelopeError> {
    let mut padded = [0u8; 32];
    padded[32 - IV_LEN..].copy_from_slice(iv);

    // A 128-bit value is always below the curve order.
    let scalar = Scalar::from_be_bytes(padded)
        .map_err(|e| EnvelopeError::InvalidNonce(e.to_string()))?;
    if scalar == Scalar::ZERO {
        return Err(EnvelopeError::InvalidNonce("nonce is zero".to_string()));
    }

    secret
        .mul_tweak(&scalar)
        .map_err(|e| EnvelopeError::InvalidNonce(e.to_string()))
}

fn nonzero_iv() -> [u8; IV_LEN] {
    loop {
        let iv = random_iv();
        if iv != [0u8; IV_LEN] {
            return iv;
        }
    }
}

/// Sign `inner` as `keys` and wrap it for `peer_pubkey`.
pub fn wrap(
    keys: &Keys,
    peer_pubkey: &str,
    inner: &UnsignedEvent,
    version: EncryptionVersion,
) -> Result<Event, EnvelopeError> {
    let signed = finalize_event(inner, keys.secret_key())?;
    let json =
        serde_json::to_string(&signed).map_err(|e| Nip01Error::Serialization(e.to_string()))?;

    let iv = nonzero_iv();
    let ephemeral = blind_secret_key(keys.secret_key(), &iv)?;
    let content = encrypt_versioned(&ephemeral, peer_pubkey, &json, version, Some(iv))?;

    let outer = UnsignedEvent::new(KIND_BLINDED_ENVELOPE, content)
        .tag(vec!["p".to_string(), peer_pubkey.to_string()])
        .created_at(signed.created_at);

    Ok(finalize_event(&outer, &ephemeral)?)
}

/// Recover and verify the inner event of an envelope sent to or by `keys`.
pub fn unwrap(keys: &Keys, outer: &Event) -> Result<Event, EnvelopeError> {
    let recipient = outer
        .tag_value("p")
        .ok_or_else(|| EnvelopeError::MissingRequiredTag("p".to_string()))?;

    let text = if recipient == keys.public_hex() {
        decrypt_versioned(keys.secret_key(), &outer.pubkey, &outer.content)?
    } else {
        let payload = split_payload(&outer.content)?;
        let ephemeral = blind_secret_key(keys.secret_key(), &payload.iv)?;
        if get_public_key_hex(&ephemeral) != outer.pubkey {
            debug!("envelope {} was neither sent by nor addressed to us", outer.id);
            return Err(EnvelopeError::Decrypt(
                "envelope was not sent by this identity".to_string(),
            ));
        }
        decrypt_versioned(&ephemeral, recipient, &outer.content)?
    };

    let inner: Event =
        serde_json::from_str(&text).map_err(|e| EnvelopeError::Decrypt(e.to_string()))?;
    if !verify_event(&inner) {
        return Err(EnvelopeError::SignatureInvalid);
    }
    Ok(inner)
}
