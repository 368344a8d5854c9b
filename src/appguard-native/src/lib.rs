//! # appguard-native
//!
//! Separately compiled attestation module. It carries its own copy of the
//! application identity, re-derives it independently of the host-side
//! checks, and is the only component besides the sealed baseline that can
//! produce the protected secret.
//!
//! The host binds the C ABI in [`exports`] with the platform dynamic loader.
//! A module built without identity constants refuses every check.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use appguard_native::ModuleIdentity;
//!
//! let identity = ModuleIdentity::compiled()?;
//! if identity.verify_identity("com.example.tv") {
//!     identity.verify_integrity()?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
// Allow deprecated from_slice until chacha20poly1305 upgrades to generic-array 1.x
#![allow(deprecated)]

pub mod exports;
mod integrity;

use std::fmt;

use base64::Engine;
use chacha20poly1305::{aead::Aead, KeyInit, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// ABI version exported by this module.
pub const ABI_VERSION: u32 = 1;

/// Key derivation domain tag shared with the host-side sealing.
const SECRET_KEY_DOMAIN: &[u8] = b"appguard-secret:v1";

/// XChaCha20-Poly1305 nonce size (24 bytes)
const NONCE_SIZE: usize = 24;

/// Errors raised inside the module. Each maps to a negative ABI code.
#[derive(Debug, Error)]
pub enum NativeError {
    /// Built without identity constants.
    #[error("module built without identity constants")]
    Unprovisioned,

    /// A pointer or string argument was unusable.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// The caller's identity does not match the compiled-in one.
    #[error("identity mismatch")]
    IdentityMismatch,

    /// The module's own integrity check failed.
    #[error("integrity check failed: {reason}")]
    IntegrityFailure {
        /// Failing check
        reason: String,
    },

    /// The sealed secret could not be opened.
    #[error("secret unavailable: {reason}")]
    SecretUnavailable {
        /// Why
        reason: String,
    },
}

impl NativeError {
    /// ABI error code (always negative).
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } => -1,
            Self::Unprovisioned => -2,
            Self::IdentityMismatch => -3,
            Self::IntegrityFailure { .. } => -4,
            Self::SecretUnavailable { .. } => -5,
        }
    }
}

/// The identity this module vouches for.
pub struct ModuleIdentity {
    package: String,
    cert_digest: String,
    sealed_secret: Vec<u8>,
}

impl ModuleIdentity {
    /// Build from explicit constants.
    ///
    /// `sealed_secret` is the standard base64 `nonce || ciphertext` blob.
    pub fn new(
        package: &str,
        cert_digest: &str,
        sealed_secret: &str,
    ) -> Result<Self, NativeError> {
        let package = package.trim();
        let cert_digest = cert_digest.trim();
        if package.is_empty() || cert_digest.is_empty() {
            return Err(NativeError::Unprovisioned);
        }
        let sealed_secret = base64::engine::general_purpose::STANDARD
            .decode(sealed_secret.trim())
            .map_err(|e| NativeError::InvalidArgument {
                reason: format!("sealed secret is not base64: {e}"),
            })?;
        if sealed_secret.len() <= NONCE_SIZE {
            return Err(NativeError::InvalidArgument {
                reason: "sealed secret too short".into(),
            });
        }
        Ok(Self {
            package: package.to_string(),
            cert_digest: cert_digest.to_string(),
            sealed_secret,
        })
    }

    /// The identity compiled into this build.
    #[cfg(appguard_native_provisioned)]
    pub fn compiled() -> Result<&'static Self, NativeError> {
        use std::sync::OnceLock;

        static COMPILED: OnceLock<Option<ModuleIdentity>> = OnceLock::new();
        COMPILED
            .get_or_init(|| {
                Self::new(
                    env!("APPGUARD_NATIVE_PACKAGE"),
                    env!("APPGUARD_NATIVE_CERT_DIGEST"),
                    env!("APPGUARD_NATIVE_SEALED_SECRET"),
                )
                .ok()
            })
            .as_ref()
            .ok_or(NativeError::Unprovisioned)
    }

    /// Unprovisioned build: there is no identity to vouch for.
    #[cfg(not(appguard_native_provisioned))]
    pub fn compiled() -> Result<&'static Self, NativeError> {
        Err(NativeError::Unprovisioned)
    }

    /// Whether `package` is this module's package.
    pub fn verify_identity(&self, package: &str) -> bool {
        let matches = constant_time_eq(package.as_bytes(), self.package.as_bytes());
        if !matches {
            warn!("Native: package identity mismatch");
        }
        matches
    }

    /// Tracer and process-name checks.
    pub fn verify_integrity(&self) -> Result<(), NativeError> {
        integrity::check(&self.package)
    }

    /// First 8 bytes (big endian) of SHA-256 over the compiled constants.
    pub fn checksum(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.package.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.cert_digest.as_bytes());
        hasher.update([0u8]);
        hasher.update(&self.sealed_secret);
        let hash = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash[..8]);
        u64::from_be_bytes(head)
    }

    /// Re-run every check, then unseal the secret under `cert_digest`.
    pub fn fetch_secret(
        &self,
        package: &str,
        cert_digest: &str,
    ) -> Result<Zeroizing<Vec<u8>>, NativeError> {
        if !self.verify_identity(package) {
            return Err(NativeError::IdentityMismatch);
        }
        if !constant_time_eq(cert_digest.as_bytes(), self.cert_digest.as_bytes()) {
            warn!("Native: certificate digest mismatch");
            return Err(NativeError::IdentityMismatch);
        }
        self.verify_integrity()?;

        let secret = self.unseal(cert_digest)?;
        debug!(len = secret.len(), "Native: secret released");
        Ok(secret)
    }

    fn unseal(&self, cert_digest: &str) -> Result<Zeroizing<Vec<u8>>, NativeError> {
        let mut hasher = Sha256::new();
        hasher.update(SECRET_KEY_DOMAIN);
        hasher.update(cert_digest.as_bytes());
        let key: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..]).map_err(|e| {
            NativeError::SecretUnavailable {
                reason: format!("cipher init failed: {e}"),
            }
        })?;

        let (nonce, ciphertext) = self.sealed_secret.split_at(NONCE_SIZE);
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| NativeError::SecretUnavailable {
                reason: "sealed secret does not open".into(),
            })
    }
}

impl fmt::Debug for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleIdentity")
            .field("package", &self.package)
            .field("checksum", &self.checksum())
            .finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
