//! Nostr identity and encryption engine.
//!
//! This crate provides:
//! - NIP-01: Basic protocol (events, signing, verification)
//! - NIP-04: Encrypted Direct Messages
//! - NIP-19: bech32 `nsec`/`npub` key encodings
//! - Versioned envelopes: HKDF-keyed AES-256-CBC with a version tag
//! - Blinded envelopes: inner events wrapped under an IV-derived ephemeral key that the
//!   sender can re-derive, so sent messages stay readable to their author
//! - Legacy sealed notes (unblinded envelopes)
//! - A bounded LRU cache of decryption results
//! - [`Identity`], which ties one keypair to all of the above

mod blinded;
mod crypto;
mod decrypt_cache;
mod identity;
mod keys;
mod legacy;
mod nip01;
mod nip04;
mod versioned;

pub use blinded::{blind_secret_key, unwrap as unwrap_envelope, wrap as wrap_envelope};
pub use decrypt_cache::{DecryptCache, DecryptCacheConfig, Decrypted};
pub use identity::Identity;
pub use keys::{KeyError, Keys, npub_to_public_key, parse_public_key};
pub use legacy::{open as open_sealed, seal as seal_note};
pub use nip01::{
    Event, KIND_BLINDED_ENVELOPE, KIND_CONTACTS, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_METADATA,
    KIND_SHORT_TEXT_NOTE, Nip01Error, UnsignedEvent, finalize_event, generate_secret_key,
    get_event_hash, get_public_key, get_public_key_hex, serialize_event, sort_events, unix_now,
    validate_event, verify_event,
};
pub use nip04::{Nip04Error, decrypt as nip04_decrypt, encrypt as nip04_encrypt};
pub use versioned::{
    EncryptionVersion, EnvelopeError, VersionedPayload, decrypt_versioned, derive_key,
    encrypt_versioned, shared_key, split_payload,
};

/// Re-exported so callers can name key types without depending on `bitcoin` directly.
pub use bitcoin::secp256k1::{SecretKey, XOnlyPublicKey};
