use aes_siv::aead::{Aead, KeyInit, Payload};
use aes_siv::{Aes256SivAead, Nonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::provider_err;
use blobnet::Result;

pub use blobnet::http::request::encode_url_parameters;

/// Lowercase hex of arbitrary bytes.
pub fn hex_encode(data: &[u8]) -> String {
    hex::encode(data)
}

pub fn hex_decode(data: &str) -> Result<Vec<u8>> {
    hex::decode(data).map_err(|err| provider_err(format!("invalid hex: {err}")))
}

pub fn base64_encode(data: &[u8]) -> String {
    base64::encode(data)
}

pub fn base64_decode(data: &str) -> Result<Vec<u8>> {
    base64::decode(data).map_err(|err| provider_err(format!("invalid base64: {err}")))
}

/// SHA-256 digest as lowercase hex, the form signatures embed.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

/// HMAC-SHA256; keys of any length, including empty.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac: Hmac<Sha256> =
        Mac::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Authenticated symmetric encryption (AES-SIV) for secrets at rest.
/// The key is 64 bytes, the nonce 16.
pub fn aes_encrypt(key: &[u8], nonce: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256SivAead::new_from_slice(key)
        .map_err(|_| provider_err("aes key must be 64 bytes"))?;
    if nonce.len() != 16 {
        return Err(provider_err("aes nonce must be 16 bytes"));
    }
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload::from(plain))
        .map_err(|_| provider_err("aes encryption failed"))
}

pub fn aes_decrypt(key: &[u8], nonce: &[u8], encrypted: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256SivAead::new_from_slice(key)
        .map_err(|_| provider_err("aes key must be 64 bytes"))?;
    if nonce.len() != 16 {
        return Err(provider_err("aes nonce must be 16 bytes"));
    }
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload::from(encrypted))
        .map_err(|_| provider_err("aes decryption failed"))
}
