//! Violation records and their classification.

use serde::{Deserialize, Serialize};

use crate::lock_state::LockReason;

/// Enforcement tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Locks the installation and blocks secret release.
    Hard,
    /// Logged only.
    Flexible,
}

/// What a verifier found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Package name differs from the baseline.
    PackageMismatch,
    /// Signing certificate digest differs from the baseline.
    SignatureMismatch,
    /// Native module rejected the package name.
    NativeIdentityMismatch,
    /// Native module integrity check failed.
    NativeIntegrityFailure,
    /// Installed bundle checksum changed.
    BundleTampered,
    /// Native module checksum changed.
    NativeChecksumMismatch,
    /// Service origin is not the official backend.
    BackendMismatch,
    /// Root indicators present.
    RootDetected,
    /// Emulator indicators present.
    EmulatorDetected,
    /// Debugger or tracer attached.
    DebuggerDetected,
    /// Hooking framework indicators present.
    HookingFramework,
}

impl ViolationKind {
    /// Tier of this kind.
    pub fn severity(self) -> Severity {
        match self {
            Self::RootDetected
            | Self::EmulatorDetected
            | Self::DebuggerDetected
            | Self::HookingFramework => Severity::Flexible,
            _ => Severity::Hard,
        }
    }

    /// Lock reason recorded for a HARD kind.
    pub fn lock_reason(self) -> Option<LockReason> {
        match self {
            Self::PackageMismatch | Self::NativeIdentityMismatch => {
                Some(LockReason::PackageMismatch)
            },
            Self::SignatureMismatch => Some(LockReason::SignatureMismatch),
            Self::NativeIntegrityFailure | Self::BundleTampered | Self::NativeChecksumMismatch => {
                Some(LockReason::CodeTampering)
            },
            Self::BackendMismatch => Some(LockReason::BackendMismatch),
            Self::RootDetected
            | Self::EmulatorDetected
            | Self::DebuggerDetected
            | Self::HookingFramework => None,
        }
    }
}

/// A single finding. Consumed immediately, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// What was found.
    pub kind: ViolationKind,
    /// Tier, derived from the kind.
    pub severity: Severity,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl ViolationRecord {
    /// Record `kind` now.
    pub fn now(kind: ViolationKind) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether this record must lock the installation.
    pub fn is_hard(&self) -> bool {
        self.severity == Severity::Hard
    }
}
