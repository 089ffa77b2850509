//! One-way encryption of issued API keys.
//!
//! Keys are encrypted immediately after issuance and never decrypted by
//! this process again; only a holder of the password can recover the
//! plaintext. The blob is `base64(JSON{salt, iv, ciphertext, tag})` with
//! each component base64-encoded, so a WebCrypto consumer can unpack it
//! without custom framing.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Size of the per-blob salt in bytes
const SALT_SIZE: usize = 16;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Size of the derived encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count. Deliberately slow so a leaked blob
/// resists offline brute-force of the password.
const PBKDF2_ROUNDS: u32 = 600_000;

#[derive(Serialize, Deserialize)]
struct KeyBlob {
    salt: String,
    iv: String,
    ciphertext: String,
    tag: String,
}

/// Encrypts an issued API key under a password-derived AES-256-GCM key.
///
/// A fresh random salt and nonce are generated per call, so encrypting the
/// same plaintext twice yields two different blobs. Nonce reuse under the
/// same derived key would break GCM, hence no caching of derived keys.
pub fn encrypt_api_key(api_key: &str, password: &str) -> Result<String> {
    encrypt_with_rounds(api_key, password, PBKDF2_ROUNDS)
}

fn encrypt_with_rounds(api_key: &str, password: &str, rounds: u32) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut key);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| anyhow!("failed to create cipher: {}", e))?;

    // aes-gcm appends the 16-byte tag to the ciphertext; the blob format
    // carries them as separate fields
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), api_key.as_bytes())
        .map_err(|e| anyhow!("encryption failed: {}", e))?;
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    let blob = KeyBlob {
        salt: BASE64.encode(salt),
        iv: BASE64.encode(nonce),
        ciphertext: BASE64.encode(&sealed),
        tag: BASE64.encode(&tag),
    };

    let packaged = serde_json::to_vec(&blob).context("failed to package key blob")?;
    Ok(BASE64.encode(packaged))
}
