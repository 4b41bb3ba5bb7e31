//! The identity engine: one long-lived keypair plus every signing and encryption scheme.
//!
//! ```
//! use arcade_nostr::{EncryptionVersion, Identity, UnsignedEvent};
//!
//! let alice = Identity::generate();
//! let bob = Identity::generate();
//!
//! let envelope = bob
//!     .wrap_encrypt(&alice.public_key(), &UnsignedEvent::new(1, "hi"), EncryptionVersion::V1)
//!     .unwrap();
//! assert_eq!(alice.unwrap(&envelope).unwrap().content, "hi");
//! assert_eq!(bob.unwrap(&envelope).unwrap().content, "hi");
//! ```

use bitcoin::secp256k1::SecretKey;
use parking_lot::Mutex;
use tracing::debug;

use crate::blinded;
use crate::decrypt_cache::{DecryptCache, DecryptCacheConfig, Decrypted};
use crate::keys::{KeyError, Keys};
use crate::legacy;
use crate::nip01::{
    Event, KIND_ENCRYPTED_DIRECT_MESSAGE, Nip01Error, UnsignedEvent, finalize_event, verify_event,
};
use crate::nip04::{self, Nip04Error};
use crate::versioned::{self, EncryptionVersion, EnvelopeError};

/// A keypair-backed identity with a bounded decrypt cache.
pub struct Identity {
    keys: Keys,
    cache: Mutex<DecryptCache>,
}

impl Identity {
    /// Create an identity with a fresh random keypair.
    pub fn generate() -> Self {
        Self::new(Keys::generate())
    }

    pub fn new(keys: Keys) -> Self {
        Self::with_cache_config(keys, DecryptCacheConfig::default())
    }

    pub fn with_cache_config(keys: Keys, config: DecryptCacheConfig) -> Self {
        Self {
            keys,
            cache: Mutex::new(DecryptCache::with_config(config)),
        }
    }

    /// Load an identity from an `nsec1...` or hex secret key.
    pub fn parse(nsec_or_hex: &str) -> Result<Self, KeyError> {
        Ok(Self::new(Keys::parse(nsec_or_hex)?))
    }

    /// Hex-encoded x-only public key.
    pub fn public_key(&self) -> String {
        self.keys.public_hex()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    // =========================================================================
    // Signing
    // =========================================================================

    /// Sign a draft with this identity's key.
    pub fn sign(&self, draft: &UnsignedEvent) -> Result<Event, Nip01Error> {
        finalize_event(draft, self.keys.secret_key())
    }

    /// Sign a draft with an explicitly supplied key, e.g. an ephemeral one.
    pub fn sign_with(&self, draft: &UnsignedEvent, secret_key: &SecretKey) -> Result<Event, Nip01Error> {
        finalize_event(draft, secret_key)
    }

    pub fn verify(&self, event: &Event) -> bool {
        verify_event(event)
    }

    pub fn is_mine(&self, event: &Event) -> bool {
        event.pubkey == self.public_key()
    }

    // =========================================================================
    // Shared-secret direct messages
    // =========================================================================

    pub fn nip04_encrypt(&self, peer_pubkey: &str, plaintext: &str) -> Result<String, Nip04Error> {
        nip04::encrypt(self.keys.secret_key(), peer_pubkey, plaintext)
    }

    pub fn nip04_decrypt(&self, peer_pubkey: &str, payload: &str) -> Result<String, Nip04Error> {
        nip04::decrypt(self.keys.secret_key(), peer_pubkey, payload)
    }

    /// Decrypt a kind 4 event in either direction. Results are cached by event id.
    pub fn decrypt_direct_message(&self, event: &Event) -> Result<String, Nip04Error> {
        if event.kind != KIND_ENCRYPTED_DIRECT_MESSAGE {
            return Err(Nip04Error::InvalidFormat(format!(
                "expected kind {}, got {}",
                KIND_ENCRYPTED_DIRECT_MESSAGE, event.kind
            )));
        }
        if let Some(Decrypted::Text(text)) = self.cache.lock().get(&event.id) {
            return Ok(text);
        }

        let peer = if self.is_mine(event) {
            event
                .tag_value("p")
                .ok_or_else(|| Nip04Error::InvalidPublicKey("missing p tag".to_string()))?
        } else {
            event.pubkey.as_str()
        };
        let text = self.nip04_decrypt(peer, &event.content)?;

        self.cache
            .lock()
            .insert(event.id.clone(), Decrypted::Text(text.clone()));
        Ok(text)
    }

    /// Decrypt every readable direct message, dropping the rest.
    pub fn decrypt_direct_messages<'a>(
        &self,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Vec<(Event, String)> {
        events
            .into_iter()
            .filter_map(|event| match self.decrypt_direct_message(event) {
                Ok(text) => Some((event.clone(), text)),
                Err(e) => {
                    debug!("skipping unreadable direct message {}: {}", event.id, e);
                    None
                }
            })
            .collect()
    }

    // =========================================================================
    // Versioned envelopes
    // =========================================================================

    pub fn encrypt_versioned(
        &self,
        peer_pubkey: &str,
        plaintext: &str,
        version: EncryptionVersion,
    ) -> Result<String, EnvelopeError> {
        versioned::encrypt_versioned(self.keys.secret_key(), peer_pubkey, plaintext, version, None)
    }

    pub fn decrypt_versioned(&self, peer_pubkey: &str, payload: &str) -> Result<String, EnvelopeError> {
        versioned::decrypt_versioned(self.keys.secret_key(), peer_pubkey, payload)
    }

    /// Sign `inner` and wrap it in a blinded envelope addressed to `peer_pubkey`.
    pub fn wrap_encrypt(
        &self,
        peer_pubkey: &str,
        inner: &UnsignedEvent,
        version: EncryptionVersion,
    ) -> Result<Event, EnvelopeError> {
        blinded::wrap(&self.keys, peer_pubkey, inner, version)
    }

    /// Open a blinded envelope sent to or by this identity. Results are cached by event id.
    pub fn unwrap(&self, outer: &Event) -> Result<Event, EnvelopeError> {
        if let Some(Decrypted::Inner(inner)) = self.cache.lock().get(&outer.id) {
            return Ok(inner);
        }

        let inner = blinded::unwrap(&self.keys, outer)?;
        self.cache
            .lock()
            .insert(outer.id.clone(), Decrypted::Inner(inner.clone()));
        Ok(inner)
    }

    /// Open every readable envelope, dropping the rest.
    pub fn unwrap_all<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> Vec<Event> {
        events
            .into_iter()
            .filter_map(|outer| match self.unwrap(outer) {
                Ok(inner) => Some(inner),
                Err(e) => {
                    debug!("skipping unreadable envelope {}: {}", outer.id, e);
                    None
                }
            })
            .collect()
    }

    /// Seal `plaintext` without blinding.
    pub fn seal(
        &self,
        peer_pubkey: &str,
        plaintext: &str,
        version: EncryptionVersion,
    ) -> Result<Event, EnvelopeError> {
        legacy::seal(&self.keys, peer_pubkey, plaintext, version)
    }

    pub fn open(&self, peer_pubkey: &str, content: &str) -> Result<Event, EnvelopeError> {
        legacy::open(&self.keys, peer_pubkey, content)
    }

    // =========================================================================
    // Private-to-self records
    // =========================================================================

    /// Encrypt `content` so only this identity can read it.
    ///
    /// The output is `JSON([ephemeral_pubkey, payload])`.
    pub fn self_encrypt(&self, content: &str) -> Result<String, EnvelopeError> {
        let ephemeral = Keys::generate();
        let payload = versioned::encrypt_versioned(
            ephemeral.secret_key(),
            &self.public_key(),
            content,
            EncryptionVersion::CURRENT,
            None,
        )?;
        serde_json::to_string(&(ephemeral.public_hex(), payload))
            .map_err(|e| Nip01Error::Serialization(e.to_string()).into())
    }

    pub fn self_decrypt(&self, content: &str) -> Result<String, EnvelopeError> {
        let (ephemeral_pubkey, payload): (String, String) =
            serde_json::from_str(content).map_err(|e| EnvelopeError::Decrypt(e.to_string()))?;
        self.decrypt_versioned(&ephemeral_pubkey, &payload)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}
