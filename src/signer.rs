//! HMAC-SHA256 credential signing.
//!
//! Signing is a pure function of a base64 key and a message. [`sign`] is the
//! free-standing form; [`SymmetricKeySigner`] decodes the key once and can be
//! shared between threads behind the [`Signer`] trait, which is what the token
//! lifecycle manager consumes.
//!
//! # Examples
//!
//! ```ignore
//! use devicelink::signer::{sign, Signer, SymmetricKeySigner};
//!
//! let signature = sign("Zm9v", b"hello")?;
//! let signer = SymmetricKeySigner::new("Zm9v")?;
//! assert_eq!(signer.sign(b"hello")?, signature);
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::PipelineError;

type HmacSha256 = Hmac<Sha256>;

/// Produces base64 signatures over arbitrary messages.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<String, PipelineError>;
}

/// Signs `message` with the base64-encoded `signing_key` and returns the
/// base64-encoded HMAC-SHA256 digest.
///
/// # Errors
///
/// - `InvalidKey` if `signing_key` is not valid base64
/// - `Signing` if the HMAC primitive rejects the key
pub fn sign(signing_key: &str, message: &[u8]) -> Result<String, PipelineError> {
    let key = decode_key(signing_key)?;
    sign_with_raw_key(&key, message)
}

fn decode_key(signing_key: &str) -> Result<Vec<u8>, PipelineError> {
    STANDARD
        .decode(signing_key.trim())
        .map_err(|e| PipelineError::InvalidKey(e.to_string()))
}

fn sign_with_raw_key(key: &[u8], message: &[u8]) -> Result<String, PipelineError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| PipelineError::Signing(e.to_string()))?;
    mac.update(message);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// A signer holding a decoded symmetric key.
#[derive(Clone)]
pub struct SymmetricKeySigner {
    key: Vec<u8>,
}

impl SymmetricKeySigner {
    /// Decodes `signing_key` up front so later signatures cannot fail on key format.
    pub fn new(signing_key: &str) -> Result<Self, PipelineError> {
        Ok(Self {
            key: decode_key(signing_key)?,
        })
    }
}

impl Signer for SymmetricKeySigner {
    fn sign(&self, message: &[u8]) -> Result<String, PipelineError> {
        sign_with_raw_key(&self.key, message)
    }
}

impl std::fmt::Debug for SymmetricKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKeySigner")
            .field("key", &"<redacted>")
            .finish()
    }
}
