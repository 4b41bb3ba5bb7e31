//! ECDH and AES-256-CBC primitives shared by the encryption schemes.

use aes::cipher::block_padding::{Pkcs7, UnpadError};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bitcoin::secp256k1::{PublicKey, SecretKey, XOnlyPublicKey, ecdh};
use rand::RngCore;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub(crate) const IV_LEN: usize = 16;

/// X-coordinate of `secret * peer`, with the peer lifted to its even-y point.
pub(crate) fn shared_x(secret: &SecretKey, peer: &XOnlyPublicKey) -> [u8; 32] {
    let point = PublicKey::from_x_only_public_key(*peer, bitcoin::secp256k1::Parity::Even);
    let xy = ecdh::shared_secret_point(&point, secret);
    let mut x = [0u8; 32];
    x.copy_from_slice(&xy[..32]);
    x
}

pub(crate) fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    iv
}

pub(crate) fn aes_cbc_encrypt(key: [u8; 32], iv: [u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub(crate) fn aes_cbc_decrypt(
    key: [u8; 32],
    iv: [u8; IV_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, UnpadError> {
    Aes256CbcDec::new(&key.into(), &iv.into()).decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keys;

    #[test]
    fn test_shared_x_is_symmetric() {
        let a = Keys::generate();
        let b = Keys::generate();
        assert_eq!(
            shared_x(a.secret_key(), b.public_key()),
            shared_x(b.secret_key(), a.public_key())
        );
    }

    #[test]
    fn test_cbc_roundtrip_and_padding() {
        let key = [7u8; 32];
        let iv = random_iv();
        let ct = aes_cbc_encrypt(key, iv, b"exactly sixteen!");
        assert_eq!(ct.len(), 32);
        assert_eq!(aes_cbc_decrypt(key, iv, &ct).unwrap(), b"exactly sixteen!");
    }

    #[test]
    fn test_cbc_wrong_key_fails_or_garbles() {
        let iv = random_iv();
        let ct = aes_cbc_encrypt([1u8; 32], iv, b"secret");
        match aes_cbc_decrypt([2u8; 32], iv, &ct) {
            Ok(pt) => assert_ne!(pt, b"secret"),
            Err(_) => {}
        }
    }
}
