//! Frame encryption for the upstream link.
//!
//! A single 32-byte key is derived from the shared password with
//! PBKDF2-HMAC-SHA256 (fixed salt, 10000 iterations). Each binary frame is
//! `[12B nonce][ciphertext][16B tag]`, AES-256-GCM, no associated data.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::Sha256;

pub const KEY_SALT: &[u8] = b"irssi-fe-web-v1";
pub const KEY_ITERATIONS: u32 = 10_000;
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Smallest well-formed frame: nonce + empty ciphertext + tag.
pub const MIN_FRAME_LEN: usize = NONCE_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("frame too short: {0} bytes, need at least {MIN_FRAME_LEN}")]
    ShortFrame(usize),
    #[error("authentication failed")]
    Authentication,
    #[error("plaintext is not valid UTF-8")]
    Utf8,
}

/// Derive the symmetric frame key from the shared password.
pub fn derive_key(password: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), KEY_SALT, KEY_ITERATIONS, &mut key);
    key
}

/// AEAD cipher for upstream binary frames.
pub struct FrameCipher {
    cipher: Aes256Gcm,
}

impl FrameCipher {
    pub fn new(password: &str) -> FrameCipher {
        let key = derive_key(password);
        FrameCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Decrypt one binary frame and return the UTF-8 plaintext.
    pub fn open(&self, frame: &[u8]) -> Result<String, CryptoError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(CryptoError::ShortFrame(frame.len()));
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)?;
        String::from_utf8(plain).map_err(|_| CryptoError::Utf8)
    }

    /// Encrypt a plaintext under an explicit nonce. The peer encrypts with
    /// random nonces; a fixed nonce here keeps test vectors reproducible.
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Vec<u8> {
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .expect("AES-GCM encryption cannot fail for in-memory buffers");
        let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
        frame.extend_from_slice(nonce);
        frame.extend_from_slice(&sealed);
        frame
    }
}
