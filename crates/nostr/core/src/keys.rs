//! Keypairs and NIP-19 bech32 key encodings.

use bech32::{Bech32, Hrp};
use bitcoin::secp256k1::{Secp256k1, SecretKey, XOnlyPublicKey};
use thiserror::Error;

use crate::nip01::generate_secret_key;

/// Human-readable part for nsec (private key)
const NSEC_HRP: &str = "nsec";

/// Human-readable part for npub (public key)
const NPUB_HRP: &str = "npub";

/// Errors that can occur while parsing or encoding keys.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("bech32 encoding error: {0}")]
    Bech32Encode(String),

    #[error("bech32 decoding error: {0}")]
    Bech32Decode(String),

    #[error("invalid hrp: expected {expected}, got {got}")]
    InvalidHrp { expected: String, got: String },
}

/// A secp256k1 secret key and its x-only public key.
#[derive(Clone, PartialEq, Eq)]
pub struct Keys {
    secret: SecretKey,
    public: XOnlyPublicKey,
}

impl Keys {
    /// Wrap an existing secret key.
    pub fn new(secret: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let (public, _parity) = secret.x_only_public_key(&secp);
        Self { secret, public }
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        loop {
            // Rejection-sample the rare out-of-range scalar.
            if let Ok(secret) = SecretKey::from_slice(&generate_secret_key()) {
                return Self::new(secret);
            }
        }
    }

    /// Parse a 64-character hex secret key.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, KeyError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(secret_hex.trim(), &mut bytes)
            .map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Parse a bech32 `nsec1...` secret key.
    pub fn from_nsec(nsec: &str) -> Result<Self, KeyError> {
        let bytes = decode_bech32(NSEC_HRP, nsec.trim())?;
        Self::from_secret_bytes(&bytes)
    }

    /// Parse a secret key given either as `nsec1...` or as hex.
    pub fn parse(secret: &str) -> Result<Self, KeyError> {
        let secret = secret.trim();
        if secret.starts_with(NSEC_HRP) {
            Self::from_nsec(secret)
        } else {
            Self::from_secret_hex(secret)
        }
    }

    fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?;
        Ok(Self::new(secret))
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> &XOnlyPublicKey {
        &self.public
    }

    /// Get the secret key as a hex string.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    /// Get the public key as a hex string.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    /// Get the nsec (bech32-encoded secret key).
    pub fn nsec(&self) -> Result<String, KeyError> {
        encode_bech32(NSEC_HRP, &self.secret.secret_bytes())
    }

    /// Get the npub (bech32-encoded public key).
    pub fn npub(&self) -> Result<String, KeyError> {
        encode_bech32(NPUB_HRP, &self.public.serialize())
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_hex())
            .field("secret_key", &"[redacted]")
            .finish()
    }
}

/// Parse a 32-byte x-only public key from hex.
pub fn parse_public_key(public_hex: &str) -> Result<XOnlyPublicKey, KeyError> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(public_hex, &mut bytes)
        .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

/// Decode an npub bech32 string to a 32-byte public key.
pub fn npub_to_public_key(npub: &str) -> Result<[u8; 32], KeyError> {
    decode_bech32(NPUB_HRP, npub)
}

fn encode_bech32(hrp: &str, data: &[u8; 32]) -> Result<String, KeyError> {
    let hrp = Hrp::parse(hrp).map_err(|e| KeyError::Bech32Encode(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| KeyError::Bech32Encode(e.to_string()))
}

fn decode_bech32(expected_hrp: &str, encoded: &str) -> Result<[u8; 32], KeyError> {
    let expected = Hrp::parse(expected_hrp).map_err(|e| KeyError::Bech32Decode(e.to_string()))?;

    let (hrp, data) =
        bech32::decode(encoded).map_err(|e| KeyError::Bech32Decode(e.to_string()))?;

    if hrp != expected {
        return Err(KeyError::InvalidHrp {
            expected: expected_hrp.to_string(),
            got: hrp.to_string(),
        });
    }

    data.as_slice().try_into().map_err(|_| {
        KeyError::Bech32Decode(format!("expected 32 bytes, got {}", data.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_HEX: &str = "7f7ff03d123792d6ac594bfa67bf6d0c0ab55b6b1fdb6249303fe861f1ccba9a";
    const NSEC: &str = "nsec10allq0gjx7fddtzef0ax00mdps9t2kmtrldkyjfs8l5xruwvh2dq0lhhkp";
    const PUBLIC_HEX: &str = "17162c921dc4d2518f9a101db33695df1afb56ab82f5ff3e5da6eec3ca5cd917";
    const NPUB: &str = "npub1zutzeysacnf9rru6zqwmxd54mud0k44tst6l70ja5mhv8jjumytsd2x7nu";

    #[test]
    fn test_known_vector() {
        let keys = Keys::from_secret_hex(SECRET_HEX).unwrap();
        assert_eq!(keys.secret_hex(), SECRET_HEX);
        assert_eq!(keys.public_hex(), PUBLIC_HEX);
        assert_eq!(keys.nsec().unwrap(), NSEC);
        assert_eq!(keys.npub().unwrap(), NPUB);
    }

    #[test]
    fn test_parse_accepts_nsec_and_hex() {
        let from_nsec = Keys::parse(NSEC).unwrap();
        let from_hex = Keys::parse(SECRET_HEX).unwrap();
        assert_eq!(from_nsec, from_hex);
    }

    #[test]
    fn test_from_nsec_wrong_hrp() {
        match Keys::from_nsec(NPUB) {
            Err(KeyError::InvalidHrp { expected, got }) => {
                assert_eq!(expected, "nsec");
                assert_eq!(got, "npub");
            }
            other => panic!("expected InvalidHrp, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_secret() {
        assert!(Keys::from_secret_hex("not hex").is_err());
        assert!(Keys::from_secret_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_generate_is_random() {
        let a = Keys::generate();
        let b = Keys::generate();
        assert_ne!(a.secret_hex(), b.secret_hex());
        assert_eq!(a.public_hex().len(), 64);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let keys = Keys::from_secret_hex(SECRET_HEX).unwrap();
        let debug = format!("{:?}", keys);
        assert!(debug.contains(PUBLIC_HEX));
        assert!(!debug.contains(SECRET_HEX));
    }

    #[test]
    fn test_npub_decode_and_parse_public_key() {
        assert_eq!(hex::encode(npub_to_public_key(NPUB).unwrap()), PUBLIC_HEX);
        assert_eq!(hex::encode(parse_public_key(PUBLIC_HEX).unwrap().serialize()), PUBLIC_HEX);
        assert!(parse_public_key("abcd").is_err());
    }
}
