//! # appguard-core
//!
//! Client-side identity and integrity enforcement. Detects repackaging,
//! re-signing, binary tampering and backend substitution, and answers with
//! a two-tier policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    SecurityOrchestrator                      │
//! │                                                              │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │ LockController │  │ IdentityVerifier │  │ NativeBridge │  │
//! │  │ (durable lock) │  │ (package, cert)  │  │ (redundancy) │  │
//! │  └────────────────┘  └──────────────────┘  └──────────────┘  │
//! │           ▲                                                  │
//! │           │ HARD         ┌──────────────────────────────┐    │
//! │           ├──────────────│ TamperMonitor (worker thread)│    │
//! │           │              │ bundle, native, certificate  │    │
//! │           │              └──────────────────────────────┘    │
//! │           │              ┌──────────────────────────────┐    │
//! │           └──────────────│ BackendBindingVerifier       │    │
//! │                          │ (fail open on connectivity)  │    │
//! │                          └──────────────────────────────┘    │
//! │                                                              │
//! │  EnvironmentScanner: root, emulator, debugger, hooks (logged) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! - **Fail-closed secret**: released only when package, certificate and
//!   (if present) the native module all verify
//! - **Monotonic lock**: no automated path returns LOCKED to UNLOCKED
//! - **Fail-open backend**: connectivity errors never lock an installation
//! - **Flexible environment**: root, emulator, debugger and hooks are logged only

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod backend;
pub mod baseline;
pub mod checksum;
pub mod config;
pub mod error;
pub mod host;
pub mod identity;
pub mod lock_state;
pub mod monitor;
pub mod native;
pub mod orchestrator;
pub mod secret;
pub mod security;
pub mod types;

pub use backend::{BackendBindingVerifier, OriginResolver, RedirectProbe, ResolveError, StaticOrigin};
pub use baseline::{BackendOrigin, IdentityBaseline, PackageName};
pub use checksum::{BundleChecksum, CertificateDigest, ChecksumEngine};
pub use config::{GuardConfig, ResponseStrategy};
pub use error::GuardError;
pub use host::{HostPlatform, RuntimeSnapshot, StaticHost};
pub use identity::IdentityVerifier;
pub use lock_state::{
    lock_message, FileLockStore, LockController, LockReason, LockState, LockStateStore,
    MemoryLockStore, UnlockGrant,
};
pub use monitor::{MonitorHandle, MonitoringSession, TamperMonitor, TickOutcome};
pub use native::{DylibModule, NativeAttestationBridge, NativeModule, NATIVE_ABI_VERSION};
pub use orchestrator::{SecurityContext, SecurityContextBuilder, SecurityOrchestrator, Terminator};
pub use secret::{ProtectedSecret, SealedSecret};
pub use security::{EnvironmentReport, EnvironmentScanner};
pub use types::{Severity, ViolationKind, ViolationRecord};
