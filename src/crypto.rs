//! Passphrase-derived keys and authenticated chunk sealing.
//!
//! The repository passphrase is stretched with Argon2id into 64 bytes of key
//! material. The first half keys ChaCha20-Poly1305 for chunk contents, the
//! second half keys the BLAKE3 hash used to name chunks, so chunk identifiers
//! reveal nothing about plaintext to someone without the passphrase.

use crate::config::KdfParams;
use crate::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::fmt;
use zeroize::Zeroize;

/// Salt length stored in the repository config
pub const SALT_LEN: usize = 16;

/// Nonce prefix length of every sealed chunk
pub const NONCE_LEN: usize = 12;

const KEY_CHECK_CONTEXT: &[u8] = b"snapvault key check v1";

/// Key material derived from the repository passphrase
pub struct MasterKey {
    enc_key: [u8; 32],
    id_key: [u8; 32],
}

impl MasterKey {
    /// Run Argon2id over the passphrase and split the output into subkeys
    pub fn derive(passphrase: &[u8], salt: &[u8], kdf: &KdfParams) -> Result<Self> {
        let params = argon2_params(kdf)?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut okm = [0u8; 64];
        argon
            .hash_password_into(passphrase, salt, &mut okm)
            .map_err(|e| Error::Configuration {
                reason: format!("Key derivation failed: {}", e),
            })?;

        let mut key = Self {
            enc_key: [0u8; 32],
            id_key: [0u8; 32],
        };
        key.enc_key.copy_from_slice(&okm[..32]);
        key.id_key.copy_from_slice(&okm[32..]);
        okm.zeroize();

        Ok(key)
    }

    /// Keyed content hash used as the chunk identifier
    pub fn chunk_id(&self, data: &[u8]) -> blake3::Hash {
        blake3::keyed_hash(&self.id_key, data)
    }

    /// Value stored in the repository config to reject a wrong passphrase early
    pub fn key_check(&self) -> String {
        blake3::keyed_hash(&self.id_key, KEY_CHECK_CONTEXT)
            .to_hex()
            .to_string()
    }

    /// Encrypt a chunk; output is `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.enc_key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Integrity {
                reason: "Chunk encryption failed".to_string(),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt and authenticate a chunk produced by [`MasterKey::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::Integrity {
                reason: format!("Sealed chunk too short ({} bytes)", sealed.len()),
            });
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.enc_key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Integrity {
                reason: "Chunk authentication tag mismatch".to_string(),
            })
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.id_key.zeroize();
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Fresh random salt for a new repository
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn argon2_params(kdf: &KdfParams) -> Result<Params> {
    Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(64)).map_err(|e| {
        Error::Configuration {
            reason: format!("Invalid key derivation parameters: {}", e),
        }
    })
}
