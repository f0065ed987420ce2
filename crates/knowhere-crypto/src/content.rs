//! Content cipher used for knowledge blobs and chunk texts.
//!
//! ## Blob format
//!
//! ```text
//! ┌─────────┬──────────────┬───────────────────────────────┐
//! │ 0x01    │ nonce (12 B) │ AES-256-GCM ciphertext + tag  │
//! └─────────┴──────────────┴───────────────────────────────┘
//! ```
//!
//! Every call to `encrypt` draws a fresh nonce, so encrypting the same
//! plaintext twice yields different blobs.

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use knowhere_core::ContentCipher;

use crate::cipher::{aes_gcm_decrypt, aes_gcm_encrypt, generate_nonce, NONCE_LEN, TAG_LEN};
use crate::error::{CryptoError, CryptoResult};

/// Current blob format version.
pub const BLOB_VERSION: u8 = 1;

/// Environment variable holding the base64-encoded 32-byte content key.
pub const ENV_CONTENT_KEY: &str = "KNOWHERE_CONTENT_KEY";

const HEADER_LEN: usize = 1 + NONCE_LEN;

/// AES-256-GCM implementation of [`ContentCipher`].
///
/// The key is zeroized on drop.
pub struct AesContentCipher {
    key: Zeroizing<[u8; 32]>,
}

impl AesContentCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> CryptoResult<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CryptoError::InvalidKey(format!("not valid base64: {}", e)))?,
        );
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(key))
    }

    /// Build from `KNOWHERE_CONTENT_KEY`.
    pub fn from_env() -> CryptoResult<Self> {
        let encoded = std::env::var(ENV_CONTENT_KEY)
            .map_err(|_| CryptoError::InvalidKey(format!("{} is not set", ENV_CONTENT_KEY)))?;
        Self::from_base64_key(&encoded)
    }

    fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = generate_nonce();
        let ciphertext = aes_gcm_encrypt(&self.key, &nonce, plaintext)?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open(&self, blob: &[u8]) -> CryptoResult<Vec<u8>> {
        if blob.len() < HEADER_LEN + TAG_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "blob of {} bytes is shorter than header and tag",
                blob.len()
            )));
        }
        if blob[0] != BLOB_VERSION {
            return Err(CryptoError::UnsupportedVersion(blob[0]));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[1..HEADER_LEN]);
        aes_gcm_decrypt(&self.key, &nonce, &blob[HEADER_LEN..])
    }
}

impl ContentCipher for AesContentCipher {
    fn encrypt(&self, plaintext: &[u8]) -> knowhere_core::Result<Vec<u8>> {
        Ok(self.seal(plaintext)?)
    }

    fn decrypt(&self, blob: &[u8]) -> knowhere_core::Result<Vec<u8>> {
        Ok(self.open(blob)?)
    }
}
