//! Unblinded sealed notes, the predecessor of [`crate::blinded`].
//!
//! A kind 1 note carrying the plaintext is signed by the sender and encrypted straight
//! between the two real keys with the versioned envelope. The outer event is published
//! under the sender's own pubkey, so nothing is hidden about who talks to whom.

use crate::keys::Keys;
use crate::nip01::{
    Event, KIND_BLINDED_ENVELOPE, KIND_SHORT_TEXT_NOTE, Nip01Error, UnsignedEvent, finalize_event,
    verify_event,
};
use crate::versioned::{EncryptionVersion, EnvelopeError, decrypt_versioned, encrypt_versioned};

/// Seal `plaintext` for `peer_pubkey`.
pub fn seal(
    keys: &Keys,
    peer_pubkey: &str,
    plaintext: &str,
    version: EncryptionVersion,
) -> Result<Event, EnvelopeError> {
    let inner = finalize_event(
        &UnsignedEvent::new(KIND_SHORT_TEXT_NOTE, plaintext),
        keys.secret_key(),
    )?;
    let json =
        serde_json::to_string(&inner).map_err(|e| Nip01Error::Serialization(e.to_string()))?;
    let content = encrypt_versioned(keys.secret_key(), peer_pubkey, &json, version, None)?;

    let outer = UnsignedEvent::new(KIND_BLINDED_ENVELOPE, content)
        .tag(vec!["p".to_string(), peer_pubkey.to_string()])
        .created_at(inner.created_at);
    Ok(finalize_event(&outer, keys.secret_key())?)
}

/// Open a sealed note's `content` received from (or sent to) `peer_pubkey`.
pub fn open(keys: &Keys, peer_pubkey: &str, content: &str) -> Result<Event, EnvelopeError> {
    let text = decrypt_versioned(keys.secret_key(), peer_pubkey, content)?;
    let inner: Event =
        serde_json::from_str(&text).map_err(|e| EnvelopeError::Decrypt(e.to_string()))?;
    if !verify_event(&inner) {
        return Err(EnvelopeError::SignatureInvalid);
    }
    Ok(inner)
}
