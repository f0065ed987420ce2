//! # knowhere-crypto
//!
//! Encryption-at-rest for knowhere.
//!
//! Knowledge content and chunk texts are stored as AES-256-GCM blobs. The
//! pipeline only sees the [`knowhere_core::ContentCipher`] trait; this crate
//! provides [`AesContentCipher`], keyed from `KNOWHERE_CONTENT_KEY`.
//!
//! ```rust
//! use knowhere_core::ContentCipher;
//! use knowhere_crypto::{generate_key, AesContentCipher};
//!
//! let cipher = AesContentCipher::new(generate_key());
//! let blob = cipher.encrypt(b"Confidential note").unwrap();
//! assert_eq!(cipher.decrypt(&blob).unwrap(), b"Confidential note");
//! ```

pub mod cipher;
pub mod content;
pub mod error;

pub use cipher::generate_key;
pub use content::{AesContentCipher, BLOB_VERSION, ENV_CONTENT_KEY};
pub use error::{CryptoError, CryptoResult};
