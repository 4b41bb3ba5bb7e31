//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical event serialization for hashing
//! - Event signing with BIP-340 Schnorr signatures
//! - Event verification

use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`, e.g. the recipient of a `p` tag.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Recompute the canonical hash of this event's signed fields.
    pub fn compute_id(&self) -> Result<String, Nip01Error> {
        get_event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Convert back into a draft. The result must be signed again.
    pub fn into_unsigned(self) -> UnsignedEvent {
        UnsignedEvent {
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            created_at: Some(self.created_at),
        }
    }
}

/// An event draft before signing.
///
/// The pubkey is not part of the draft: it comes from whichever key signs it. When
/// `created_at` is `None` the signer stamps the current wall-clock time.
///
/// ```
/// use arcade_nostr::{KIND_SHORT_TEXT_NOTE, UnsignedEvent};
///
/// let draft = UnsignedEvent::new(KIND_SHORT_TEXT_NOTE, "hello")
///     .tag(vec!["t".to_string(), "news".to_string()]);
/// assert!(draft.created_at.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    #[serde(default)]
    pub content: String,
    /// Unix timestamp in seconds, filled at signing time when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl UnsignedEvent {
    /// Create a draft with no tags.
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
            created_at: None,
        }
    }

    /// Append a tag.
    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    /// Replace all tags.
    pub fn tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags = tags;
        self
    }

    /// Pin the creation timestamp.
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u16 = 4;
/// Outer envelope of a blinded (or legacy sealed) encrypted event.
pub const KIND_BLINDED_ENVELOPE: u16 = 99;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Generate a random 32-byte secret key.
///
/// The bytes are not checked against the curve order; use
/// [`crate::Keys::generate`] for a key that is guaranteed valid.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the x-only public key of a secret key.
pub fn get_public_key(secret_key: &SecretKey) -> XOnlyPublicKey {
    let secp = Secp256k1::signing_only();
    let (xonly, _parity) = secret_key.x_only_public_key(&secp);
    xonly
}

/// Get the public key as a lowercase hex string.
pub fn get_public_key_hex(secret_key: &SecretKey) -> String {
    hex::encode(get_public_key(secret_key).serialize())
}

/// Serialize the signed fields of an event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, Nip01Error> {
    if !is_lower_hex(pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing pubkey".to_string(),
        ));
    }

    serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))
        .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Get the event hash (id) of the signed fields.
pub fn get_event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, Nip01Error> {
    let serialized = serialize_event(pubkey, created_at, kind, tags, content)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Validate a signed event structure (not including signature verification).
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Sign a draft with a secret key, producing a complete signed event.
pub fn finalize_event(draft: &UnsignedEvent, secret_key: &SecretKey) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::signing_only();
    let keypair = Keypair::from_secret_key(&secp, secret_key);
    let (xonly_pk, _parity) = keypair.x_only_public_key();
    let pubkey = hex::encode(xonly_pk.serialize());
    let created_at = draft.created_at.unwrap_or_else(unix_now);

    let id = get_event_hash(&pubkey, created_at, draft.kind, &draft.tags, &draft.content)?;

    let mut digest = [0u8; 32];
    hex::decode_to_slice(&id, &mut digest)
        .map_err(|e| Nip01Error::Signing(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest(digest);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id,
        pubkey,
        created_at,
        kind: draft.kind,
        tags: draft.tags.clone(),
        content: draft.content.clone(),
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify an event's id and signature.
///
/// Malformed events verify as `false`; this never errors.
pub fn verify_event(event: &Event) -> bool {
    if !validate_event(event) {
        return false;
    }

    match event.compute_id() {
        Ok(computed) if computed == event.id => {}
        _ => return false,
    }

    let mut digest = [0u8; 32];
    if hex::decode_to_slice(&event.id, &mut digest).is_err() {
        return false;
    }
    let Ok(sig_bytes) = hex::decode(&event.sig) else {
        return false;
    };
    let Ok(sig) = schnorr::Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let Ok(pubkey_bytes) = hex::decode(&event.pubkey) else {
        return false;
    };
    let Ok(pubkey) = XOnlyPublicKey::from_slice(&pubkey_bytes) else {
        return false;
    };

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .is_ok()
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test private key used in nostr-tools tests
    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_secret_key() -> SecretKey {
        SecretKey::from_slice(&hex::decode(TEST_PRIVATE_KEY).unwrap()).unwrap()
    }

    fn note(content: &str) -> UnsignedEvent {
        UnsignedEvent::new(KIND_SHORT_TEXT_NOTE, content).created_at(1617932115)
    }

    #[test]
    fn test_finalize_event_creates_signed_event() {
        let sk = test_secret_key();
        let draft = note("Hello, world!");

        let event = finalize_event(&draft, &sk).unwrap();

        assert_eq!(event.kind, draft.kind);
        assert_eq!(event.tags, draft.tags);
        assert_eq!(event.content, draft.content);
        assert_eq!(event.created_at, 1617932115);
        assert_eq!(event.pubkey, get_public_key_hex(&sk));
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
    }

    #[test]
    fn test_finalize_event_stamps_wall_clock() {
        let before = unix_now();
        let event = finalize_event(&UnsignedEvent::new(1, "now"), &test_secret_key()).unwrap();
        assert!(event.created_at >= before);
        assert!(event.created_at <= unix_now());
    }

    #[test]
    fn test_serialize_event_format() {
        let pubkey = get_public_key_hex(&test_secret_key());
        let serialized = serialize_event(&pubkey, 1617932115, 1, &[], "Hello, world!").unwrap();

        let expected = format!("[0,\"{}\",1617932115,1,[],\"Hello, world!\"]", pubkey);
        assert_eq!(serialized, expected);
    }

    #[test]
    fn test_serialize_event_rejects_bad_pubkey() {
        assert!(serialize_event("invalid", 1, 1, &[], "").is_err());
        let upper = get_public_key_hex(&test_secret_key()).to_uppercase();
        assert!(serialize_event(&upper, 1, 1, &[], "").is_err());
    }

    #[test]
    fn test_id_is_hash_of_canonical_tuple() {
        let event = finalize_event(&note("hash me"), &test_secret_key()).unwrap();
        let expected = get_event_hash(
            &event.pubkey,
            event.created_at,
            event.kind,
            &event.tags,
            &event.content,
        )
        .unwrap();
        assert_eq!(event.id, expected);
    }

    #[test]
    fn test_verify_event_valid() {
        let event = finalize_event(&note("verify me"), &test_secret_key()).unwrap();
        assert!(verify_event(&event));
    }

    #[test]
    fn test_verify_event_detects_mutation() {
        let event = finalize_event(
            &note("original").tag(vec!["t".to_string(), "x".to_string()]),
            &test_secret_key(),
        )
        .unwrap();

        let mut content = event.clone();
        content.content = "originam".to_string();
        assert!(!verify_event(&content));

        let mut kind = event.clone();
        kind.kind = 2;
        assert!(!verify_event(&kind));

        let mut created = event.clone();
        created.created_at += 1;
        assert!(!verify_event(&created));

        let mut tags = event.clone();
        tags.tags.clear();
        assert!(!verify_event(&tags));

        let mut sig = event.clone();
        sig.sig.replace_range(0..2, if &event.sig[0..2] == "00" { "11" } else { "00" });
        assert!(!verify_event(&sig));
    }

    #[test]
    fn test_verify_event_malformed_is_false() {
        let mut event = finalize_event(&note("x"), &test_secret_key()).unwrap();
        event.pubkey = "zz".to_string();
        assert!(!verify_event(&event));
    }

    #[test]
    fn test_tag_value() {
        let event = finalize_event(
            &note("tags")
                .tag(vec!["e".to_string(), "event1".to_string()])
                .tag(vec!["p".to_string(), "peer".to_string()])
                .tag(vec!["p".to_string(), "second".to_string()]),
            &test_secret_key(),
        )
        .unwrap();

        assert_eq!(event.tag_value("p"), Some("peer"));
        assert_eq!(event.tag_value("e"), Some("event1"));
        assert_eq!(event.tag_value("d"), None);
    }

    #[test]
    fn test_event_json_roundtrip_shape() {
        let event = finalize_event(&note("wire"), &test_secret_key()).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        for field in ["id", "pubkey", "created_at", "kind", "tags", "content", "sig"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn test_sort_events() {
        let sk = test_secret_key();
        let mut events = vec![
            finalize_event(&UnsignedEvent::new(1, "a").created_at(1), &sk).unwrap(),
            finalize_event(&UnsignedEvent::new(1, "b").created_at(3), &sk).unwrap(),
            finalize_event(&UnsignedEvent::new(1, "c").created_at(2), &sk).unwrap(),
        ];
        sort_events(&mut events);
        let order: Vec<u64> = events.iter().map(|e| e.created_at).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }
}
