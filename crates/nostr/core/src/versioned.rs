//! Versioned symmetric envelope.
//!
//! The ECDH x-coordinate is stretched with HKDF-SHA256, salted by a per-message IV, and
//! the result keys AES-256-CBC. The wire form carries the IV and a version tag:
//!
//! ```text
//! base64(ciphertext) ?? base64(iv) ?? version
//! ```
//!
//! The version tag is interpreted in exactly one place, [`EncryptionVersion::parse`]. An
//! unknown tag is rejected before any base64 or cipher work happens.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::secp256k1::{SecretKey, XOnlyPublicKey};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::crypto::{IV_LEN, aes_cbc_decrypt, aes_cbc_encrypt, random_iv, shared_x};
use crate::keys::parse_public_key;
use crate::nip01::Nip01Error;

const FIELD_SEPARATOR: &str = "??";

/// Errors shared by the versioned, blinded and legacy envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unsupported encryption version: {0:?}")]
    UnsupportedVersion(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("missing required tag: {0}")]
    MissingRequiredTag(String),

    #[error("inner event signature is invalid")]
    SignatureInvalid,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid blinding nonce: {0}")]
    InvalidNonce(String),

    #[error("event error: {0}")]
    Event(#[from] Nip01Error),
}

/// Closed set of envelope versions this engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionVersion {
    /// HKDF-SHA256(shared_x, salt = iv) keying AES-256-CBC.
    #[default]
    V1,
}

impl EncryptionVersion {
    /// The version new envelopes are written with.
    pub const CURRENT: Self = Self::V1;

    /// Interpret a wire version tag.
    pub fn parse(tag: &str) -> Result<Self, EnvelopeError> {
        match tag {
            "1" => Ok(Self::V1),
            other => Err(EnvelopeError::UnsupportedVersion(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "1",
        }
    }
}

impl fmt::Display for EncryptionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed envelope payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub version: EncryptionVersion,
}

/// Split a payload into its fields, validating the version tag first.
pub fn split_payload(payload: &str) -> Result<VersionedPayload, EnvelopeError> {
    let mut fields = payload.splitn(3, FIELD_SEPARATOR);
    let ciphertext_b64 = fields.next().unwrap_or_default();
    let iv_b64 = fields.next().unwrap_or_default();
    let version = EncryptionVersion::parse(fields.next().unwrap_or_default())?;

    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| EnvelopeError::Decrypt(format!("ciphertext: {}", e)))?;
    let iv = STANDARD
        .decode(iv_b64)
        .map_err(|e| EnvelopeError::Decrypt(format!("iv: {}", e)))?
        .try_into()
        .map_err(|_| EnvelopeError::Decrypt("iv must be 16 bytes".to_string()))?;

    Ok(VersionedPayload {
        ciphertext,
        iv,
        version,
    })
}

/// ECDH x-coordinate between `secret` and `peer`.
pub fn shared_key(secret: &SecretKey, peer: &XOnlyPublicKey) -> [u8; 32] {
    shared_x(secret, peer)
}

/// HKDF-SHA256 with the IV as salt and an empty info string.
pub fn derive_key(shared: &[u8; 32], iv: &[u8; IV_LEN]) -> Result<[u8; 32], EnvelopeError> {
    let hkdf = Hkdf::<Sha256>::new(Some(iv), shared);
    let mut key = [0u8; 32];
    hkdf.expand(&[], &mut key)
        .map_err(|e| EnvelopeError::Decrypt(format!("key derivation: {}", e)))?;
    Ok(key)
}

/// Encrypt `plaintext` from `secret` to `peer_pubkey`.
///
/// A random IV is drawn unless one is supplied; the blinded envelope supplies its own so
/// the ephemeral key and the cipher share the same nonce.
pub fn encrypt_versioned(
    secret: &SecretKey,
    peer_pubkey: &str,
    plaintext: &str,
    version: EncryptionVersion,
    iv: Option<[u8; IV_LEN]>,
) -> Result<String, EnvelopeError> {
    let peer = parse_public_key(peer_pubkey)
        .map_err(|e| EnvelopeError::InvalidPublicKey(e.to_string()))?;
    let iv = iv.unwrap_or_else(random_iv);

    let ciphertext = match version {
        EncryptionVersion::V1 => {
            let key = derive_key(&shared_key(secret, &peer), &iv)?;
            aes_cbc_encrypt(key, iv, plaintext.as_bytes())
        }
    };

    Ok(format!(
        "{ct}{sep}{iv}{sep}{version}",
        ct = STANDARD.encode(ciphertext),
        iv = STANDARD.encode(iv),
        sep = FIELD_SEPARATOR,
    ))
}

/// Inverse of [`encrypt_versioned`].
pub fn decrypt_versioned(
    secret: &SecretKey,
    peer_pubkey: &str,
    payload: &str,
) -> Result<String, EnvelopeError> {
    let parsed = split_payload(payload)?;
    let peer = parse_public_key(peer_pubkey)
        .map_err(|e| EnvelopeError::InvalidPublicKey(e.to_string()))?;

    let plaintext = match parsed.version {
        EncryptionVersion::V1 => {
            let key = derive_key(&shared_key(secret, &peer), &parsed.iv)?;
            aes_cbc_decrypt(key, parsed.iv, &parsed.ciphertext)
                .map_err(|e| EnvelopeError::Decrypt(e.to_string()))?
        }
    };

    String::from_utf8(plaintext).map_err(|e| EnvelopeError::Decrypt(e.to_string()))
}
