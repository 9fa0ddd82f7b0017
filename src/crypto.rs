//! At-rest encryption for page images and WAL record payloads.
//!
//! When a 32-byte key is configured, page payload regions and WAL record
//! segments are wrapped in AES-256-GCM: a 12-byte random nonce followed by
//! the ciphertext with its 16-byte authentication tag. Decryption with the
//! wrong key fails authentication and surfaces as a checksum mismatch.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fs;
use std::path::Path;

use crate::error::{DirError, Result};

/// Length of the AES-256 key in bytes.
pub const KEY_LEN: usize = 32;
/// Random nonce length prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;
/// Total size overhead of a sealed payload over the plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Authenticated cipher applied to page payloads and WAL segments.
pub struct PageCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for PageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCipher").finish_non_exhaustive()
    }
}

impl PageCipher {
    /// Builds a cipher from a raw 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(DirError::InvalidArgument(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| DirError::InvalidArgument(format!("encryption key rejected: {e}")))?;
        Ok(Self { cipher })
    }

    /// Loads a key from a file holding exactly 32 raw bytes (or 64 hex chars).
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        if raw.len() == KEY_LEN {
            return Self::new(&raw);
        }
        let text = std::str::from_utf8(&raw)
            .map(str::trim)
            .unwrap_or_default();
        if text.len() == KEY_LEN * 2 {
            let mut key = [0u8; KEY_LEN];
            for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
                let hi = hex_digit(chunk[0])?;
                let lo = hex_digit(chunk[1])?;
                key[i] = (hi << 4) | lo;
            }
            return Self::new(&key);
        }
        Err(DirError::InvalidArgument(
            "encryption key file must hold 32 raw bytes or 64 hex characters".into(),
        ))
    }

    /// Encrypts `plain`, producing `nonce(12) | ciphertext+tag`.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plain)
            .map_err(|e| DirError::InvalidArgument(format!("encryption failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a payload produced by [`seal`](Self::seal). Authentication
    /// failure (wrong key or tampered bytes) yields `ChecksumMismatch`.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(DirError::Corrupted(
                "sealed payload shorter than nonce and tag".into(),
            ));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| {
                DirError::ChecksumMismatch("authenticated decryption failed".into())
            })
    }
}

fn hex_digit(byte: u8) -> Result<u8> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(DirError::InvalidArgument(
            "encryption key file holds non-hex characters".into(),
        )),
    }
}
