//! The protected secret and its at-rest sealing.
//!
//! The secret is sealed with XChaCha20-Poly1305 under a key derived from the
//! genuine signing-certificate digest, so a re-signed build cannot unseal it
//! even after patching out every check.

// Allow deprecated from_slice until chacha20poly1305 upgrades to generic-array 1.x
#![allow(deprecated)]

use std::fmt;

use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::checksum::CertificateDigest;
use crate::error::GuardError;

/// XChaCha20-Poly1305 nonce size (24 bytes)
const NONCE_SIZE: usize = 24;

/// Key derivation domain tag.
const SECRET_KEY_DOMAIN: &[u8] = b"appguard-secret:v1";

/// The released credential.
///
/// Zeroised on drop. `Debug` never prints the value.
pub struct ProtectedSecret(Vec<u8>);

impl ProtectedSecret {
    /// Wrap released bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the secret for immediate use.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Secret as UTF-8, if it is text.
    pub fn expose_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for ProtectedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for ProtectedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtectedSecret([REDACTED; {}])", self.0.len())
    }
}

/// Secret sealed to a signing certificate: `nonce || ciphertext`.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSecret(Vec<u8>);

impl SealedSecret {
    /// Seal `plaintext` so that only `digest` can unseal it.
    pub fn seal(plaintext: &[u8], digest: &CertificateDigest) -> Result<Self, GuardError> {
        let cipher = cipher_for(digest)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| GuardError::SecretUnavailable {
                reason: format!("seal failed: {e}"),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(Self(sealed))
    }

    /// Unseal with the runtime certificate digest.
    ///
    /// Fails for any digest other than the one used to seal.
    pub fn unseal(&self, digest: &CertificateDigest) -> Result<ProtectedSecret, GuardError> {
        if self.0.len() <= NONCE_SIZE {
            return Err(GuardError::SecretUnavailable {
                reason: "sealed secret truncated".into(),
            });
        }
        let (nonce_bytes, ciphertext) = self.0.split_at(NONCE_SIZE);
        let cipher = cipher_for(digest)?;
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| GuardError::SecretUnavailable {
                reason: "sealed secret does not open under this certificate".into(),
            })?;
        Ok(ProtectedSecret(plaintext))
    }

    /// Decode from standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, GuardError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| GuardError::Baseline {
                message: format!("sealed secret is not base64: {e}"),
            })?;
        if bytes.len() <= NONCE_SIZE {
            return Err(GuardError::Baseline {
                message: "sealed secret too short".into(),
            });
        }
        Ok(Self(bytes))
    }

    /// Encode as standard base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedSecret({} bytes)", self.0.len())
    }
}

fn cipher_for(digest: &CertificateDigest) -> Result<XChaCha20Poly1305, GuardError> {
    let mut hasher = Sha256::new();
    hasher.update(SECRET_KEY_DOMAIN);
    hasher.update(digest.as_str().as_bytes());
    let key: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());
    XChaCha20Poly1305::new_from_slice(&key[..]).map_err(|e| GuardError::SecretUnavailable {
        reason: format!("cipher init failed: {e}"),
    })
}
