// Cache payload encryption
// AES-256-GCM with a key derived from the caller's own credential, so the
// cache file is unreadable without the password or service-account JWK

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CacheError;

const KEY_SALT: &[u8] = b"frodo-token-cache";
const KEY_INFO: &[u8] = b"aes-256-gcm";

/// Derives the cache key from a credential secret via HKDF-SHA256
pub(crate) fn derive_key(secret: &str) -> Result<[u8; 32], CacheError> {
    let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), secret.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(KEY_INFO, &mut key)
        .map_err(|e| CacheError::Crypto(e.to_string()))?;
    Ok(key)
}

pub(crate) fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<String, CacheError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CacheError::Crypto(e.to_string()))?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CacheError::Crypto(e.to_string()))?;

    // Prepend nonce to ciphertext, then base64 encode
    let mut combined = nonce_bytes.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(&combined))
}

pub(crate) fn decrypt(key: &[u8; 32], payload: &str) -> Result<Vec<u8>, CacheError> {
    let combined = STANDARD
        .decode(payload)
        .map_err(|e| CacheError::Crypto(e.to_string()))?;

    if combined.len() < 12 {
        return Err(CacheError::Crypto("payload too short".to_string()));
    }

    let (nonce_bytes, encrypted) = combined.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CacheError::Crypto(e.to_string()))?;

    cipher
        .decrypt(nonce, encrypted)
        .map_err(|e| CacheError::Crypto(e.to_string()))
}
