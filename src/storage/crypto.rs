//! At-rest encryption for stored interactions.
//!
//! A 32-byte session key is generated per registration and wrapped once with
//! the client's RSA public key using OAEP over SHA-256; only the wrapped form
//! leaves the process. Individual blobs are sealed with AES-256-GCM, the
//! random 96-bit nonce prepended to the ciphertext, and base64-encoded for
//! the poll wire format.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;

use crate::error::StorageError;

pub const SESSION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub fn generate_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Wrap a session key under a PEM public key (SPKI, with PKCS#1 fallback).
pub fn wrap_session_key(
    public_key_pem: &str,
    key: &[u8; SESSION_KEY_LEN],
) -> Result<String, StorageError> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
        .map_err(|_| StorageError::InvalidPublicKey)?;
    let wrapped = public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key)
        .map_err(|_| StorageError::Crypto)?;
    Ok(BASE64.encode(wrapped))
}

/// Seal one serialised interaction: base64(nonce || AES-256-GCM ciphertext).
pub fn seal_blob(key: &[u8; SESSION_KEY_LEN], plain: &[u8]) -> Result<String, StorageError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StorageError::Crypto)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plain)
        .map_err(|_| StorageError::Crypto)?;
    let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(framed))
}

#[cfg(test)]
pub(crate) fn open_blob(key: &[u8; SESSION_KEY_LEN], sealed: &str) -> Vec<u8> {
    let framed = BASE64.decode(sealed).unwrap();
    let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).unwrap();
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    #[test]
    fn seal_and_open_round_trip() {
        let key = generate_session_key();
        let sealed = seal_blob(&key, b"interaction payload").unwrap();
        assert_eq!(open_blob(&key, &sealed), b"interaction payload");
    }

    #[test]
    fn sealing_twice_differs_by_nonce() {
        let key = generate_session_key();
        let a = seal_blob(&key, b"same").unwrap();
        let b = seal_blob(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrap_rejects_garbage_pem() {
        let key = generate_session_key();
        let err = wrap_session_key("not a pem", &key).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPublicKey));
    }

    #[test]
    fn wrapped_key_unwraps_with_private_key() {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let key = generate_session_key();
        let wrapped = wrap_session_key(&pem, &key).unwrap();
        let unwrapped = private_key
            .decrypt(Oaep::new::<Sha256>(), &BASE64.decode(wrapped).unwrap())
            .unwrap();
        assert_eq!(unwrapped, key);
    }
}
