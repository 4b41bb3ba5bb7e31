//! NIP-04: Encrypted Direct Message.
//!
//! The raw ECDH x-coordinate is used directly as the AES-256-CBC key. There is no key
//! derivation and no forward secrecy; this scheme exists to read and write kind 4 events
//! produced by older clients.
//!
//! Wire form: `base64(ciphertext) + "?iv=" + base64(iv)`

use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::secp256k1::SecretKey;
use thiserror::Error;

use crate::crypto::{IV_LEN, aes_cbc_decrypt, aes_cbc_encrypt, random_iv, shared_x};
use crate::keys::parse_public_key;

const IV_SEPARATOR: &str = "?iv=";

/// Errors that can occur during NIP-04 operations.
#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid payload format: {0}")]
    InvalidFormat(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid utf-8 in plaintext")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encrypt `plaintext` for the holder of `peer_pubkey`.
pub fn encrypt(
    secret_key: &SecretKey,
    peer_pubkey: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let peer =
        parse_public_key(peer_pubkey).map_err(|e| Nip04Error::InvalidPublicKey(e.to_string()))?;
    let key = shared_x(secret_key, &peer);
    let iv = random_iv();
    let ciphertext = aes_cbc_encrypt(key, iv, plaintext.as_bytes());

    Ok(format!(
        "{}{}{}",
        STANDARD.encode(ciphertext),
        IV_SEPARATOR,
        STANDARD.encode(iv)
    ))
}

/// Decrypt a payload produced by [`encrypt`] between the same two keys.
pub fn decrypt(
    secret_key: &SecretKey,
    peer_pubkey: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    let peer =
        parse_public_key(peer_pubkey).map_err(|e| Nip04Error::InvalidPublicKey(e.to_string()))?;

    let (ciphertext_b64, iv_b64) = payload
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| Nip04Error::InvalidFormat("missing ?iv= separator".to_string()))?;

    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| Nip04Error::InvalidFormat(format!("ciphertext: {}", e)))?;
    let iv: [u8; IV_LEN] = STANDARD
        .decode(iv_b64)
        .map_err(|e| Nip04Error::InvalidFormat(format!("iv: {}", e)))?
        .try_into()
        .map_err(|_| Nip04Error::InvalidFormat("iv must be 16 bytes".to_string()))?;

    let key = shared_x(secret_key, &peer);
    let plaintext =
        aes_cbc_decrypt(key, iv, &ciphertext).map_err(|e| Nip04Error::Decryption(e.to_string()))?;

    Ok(String::from_utf8(plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keys;

    #[test]
    fn test_roundtrip_between_peers() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let payload = encrypt(alice.secret_key(), &bob.public_hex(), "hi bob").unwrap();
        assert!(payload.contains("?iv="));

        let plaintext = decrypt(bob.secret_key(), &alice.public_hex(), &payload).unwrap();
        assert_eq!(plaintext, "hi bob");
    }

    #[test]
    fn test_sender_can_decrypt_own_message() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let payload = encrypt(alice.secret_key(), &bob.public_hex(), "note to bob").unwrap();
        assert_eq!(
            decrypt(alice.secret_key(), &bob.public_hex(), &payload).unwrap(),
            "note to bob"
        );
    }

    #[test]
    fn test_random_iv_per_message() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let a = encrypt(alice.secret_key(), &bob.public_hex(), "same").unwrap();
        let b = encrypt(alice.secret_key(), &bob.public_hex(), "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_third_party_cannot_decrypt() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();
        let payload = encrypt(alice.secret_key(), &bob.public_hex(), "private").unwrap();

        match decrypt(eve.secret_key(), &alice.public_hex(), &payload) {
            Ok(text) => assert_ne!(text, "private"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_malformed_payloads() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let peer = alice.public_hex();

        assert!(matches!(
            decrypt(bob.secret_key(), &peer, "no separator"),
            Err(Nip04Error::InvalidFormat(_))
        ));
        assert!(matches!(
            decrypt(bob.secret_key(), &peer, "!!!?iv=AAAAAAAAAAAAAAAAAAAAAA=="),
            Err(Nip04Error::InvalidFormat(_))
        ));
        assert!(matches!(
            decrypt(bob.secret_key(), &peer, "AAAA?iv=AAAA"),
            Err(Nip04Error::InvalidFormat(_))
        ));
        assert!(matches!(
            encrypt(bob.secret_key(), "zz", "x"),
            Err(Nip04Error::InvalidPublicKey(_))
        ));
    }
}
