//! Error types for verification and enforcement operations.

use thiserror::Error;

use crate::lock_state::LockReason;

/// Errors that can occur during verification and enforcement.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Runtime package name differs from the baseline.
    #[error("Package identity mismatch")]
    PackageMismatch,

    /// Signing certificate digest differs from the baseline.
    #[error("Signing certificate mismatch")]
    SignatureMismatch,

    /// Installed bundle or native module changed while running.
    #[error("Code integrity violation: {detail}")]
    CodeTampering {
        /// Which artifact failed (bundle, native).
        detail: String,
    },

    /// Resolved backend origin is not the allowed origin.
    #[error("Backend origin mismatch: {origin}")]
    BackendMismatch {
        /// Origin that was observed.
        origin: String,
    },

    /// The installation is locked; nothing is released.
    #[error("Installation locked: {reason:?}")]
    Locked {
        /// Persisted lock reason.
        reason: LockReason,
    },

    /// Native attestation module is not loaded.
    #[error("Native attestation module unavailable: {reason}")]
    NativeUnavailable {
        /// Why the module is unavailable.
        reason: String,
    },

    /// Native module returned an error or an ambiguous result.
    #[error("Native attestation failed: {reason}")]
    NativeFailure {
        /// Reason for the failure.
        reason: String,
    },

    /// The protected secret could not be released.
    #[error("Protected secret unavailable: {reason}")]
    SecretUnavailable {
        /// Reason the secret was withheld.
        reason: String,
    },

    /// Identity baseline is missing or malformed.
    #[error("Baseline error: {message}")]
    Baseline {
        /// Error message.
        message: String,
    },

    /// Host platform could not supply an identity input.
    #[error("Host platform error: {message}")]
    Host {
        /// Error message.
        message: String,
    },

    /// Lock state storage error.
    #[error("Storage error: {message}")]
    Storage {
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// Unlock grant did not verify.
    #[error("Unlock grant rejected: {reason}")]
    UnlockRejected {
        /// Reason for rejection.
        reason: String,
    },

    /// A checksum computation exceeded its time budget.
    #[error("Checksum timed out after {secs}s")]
    Timeout {
        /// Budget in seconds.
        secs: u64,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    /// Check if this error is a HARD violation that must lock the installation.
    #[must_use]
    pub fn is_hard_violation(&self) -> bool {
        self.lock_reason().is_some()
    }

    /// Lock reason this error maps to, if it is a HARD violation.
    #[must_use]
    pub fn lock_reason(&self) -> Option<LockReason> {
        match self {
            Self::PackageMismatch => Some(LockReason::PackageMismatch),
            Self::SignatureMismatch => Some(LockReason::SignatureMismatch),
            Self::CodeTampering { .. } => Some(LockReason::CodeTampering),
            Self::BackendMismatch { .. } => Some(LockReason::BackendMismatch),
            _ => None,
        }
    }
}
