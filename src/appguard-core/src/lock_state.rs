//! Durable lock state.
//!
//! The installation is either unlocked or locked with a reason. Automated
//! code paths only ever move it from unlocked to locked. The record is read
//! once at startup and replaced as a whole on every write.
//!
//! The on-disk record is sealed with XChaCha20-Poly1305 under a key derived
//! from the installation id, and written through a temp file plus `rename`
//! so a process kill mid-write leaves either the old or the new record.

// Allow deprecated from_slice until chacha20poly1305 upgrades to generic-array 1.x
#![allow(deprecated)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::GuardError;

/// XChaCha20-Poly1305 nonce size (24 bytes)
const NONCE_SIZE: usize = 24;

/// Namespace directory under the state dir.
const STATE_NAMESPACE: &str = "appguard";

/// Record file name.
const STATE_FILE: &str = "lock_state.enc";

/// Domain tag for the record key.
const STATE_KEY_DOMAIN: &[u8] = b"appguard-lock-state:";

/// Domain tag for unlock grant messages.
const UNLOCK_DOMAIN: &str = "appguard-unlock:v1:";

/// Why the installation was locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum LockReason {
    /// Not locked.
    None = 0,
    /// Runtime package name did not match.
    PackageMismatch = 1,
    /// Signing certificate did not match.
    SignatureMismatch = 2,
    /// Bundle or native module was modified.
    CodeTampering = 3,
    /// Service origin was not the official backend.
    BackendMismatch = 4,
    /// Record unreadable or reason not recognised.
    Unknown = 99,
}

impl LockReason {
    /// Persisted integer code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a persisted code. Unrecognised codes become `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::PackageMismatch,
            2 => Self::SignatureMismatch,
            3 => Self::CodeTampering,
            4 => Self::BackendMismatch,
            _ => Self::Unknown,
        }
    }

    /// Short internal description, for logs.
    pub fn description(self) -> &'static str {
        match self {
            Self::None => "no security violation",
            Self::PackageMismatch => "package verification failed",
            Self::SignatureMismatch => "signature verification failed",
            Self::CodeTampering => "code integrity violation",
            Self::BackendMismatch => "backend verification failed",
            Self::Unknown => "unknown security violation",
        }
    }
}

/// User-facing message for a lock reason. One fixed string per reason.
pub fn lock_message(reason: LockReason) -> &'static str {
    match reason {
        LockReason::None => "",
        LockReason::PackageMismatch => {
            "This app has been modified and cannot be verified. Install the official version to continue."
        },
        LockReason::SignatureMismatch => {
            "This app's signing certificate is not valid. Install the official version to continue."
        },
        LockReason::CodeTampering => {
            "This app has been tampered with and can no longer be used. Install the official version to continue."
        },
        LockReason::BackendMismatch => {
            "This app is not connected to the official service. Install the official version to continue."
        },
        LockReason::Unknown => {
            "A security problem was detected. Install the official version to continue."
        },
    }
}

/// Lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    /// Whether the installation is locked.
    pub locked: bool,
    /// Reason, `None` while unlocked.
    pub reason: LockReason,
    /// Unix milliseconds of the transition, 0 while unlocked.
    pub timestamp: i64,
}

impl LockState {
    /// The initial state.
    pub const fn unlocked() -> Self {
        Self {
            locked: false,
            reason: LockReason::None,
            timestamp: 0,
        }
    }

    /// A locked record stamped with the current time.
    pub fn locked_now(reason: LockReason) -> Self {
        Self {
            locked: true,
            reason,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl Default for LockState {
    fn default() -> Self {
        Self::unlocked()
    }
}

/// Persisted layout: `{locked, reason_code, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedLockState {
    locked: bool,
    reason_code: i32,
    timestamp: i64,
}

impl From<&LockState> for PersistedLockState {
    fn from(state: &LockState) -> Self {
        Self {
            locked: state.locked,
            reason_code: state.reason.code(),
            timestamp: state.timestamp,
        }
    }
}

impl From<PersistedLockState> for LockState {
    fn from(record: PersistedLockState) -> Self {
        let reason = LockReason::from_code(record.reason_code);
        if record.locked {
            // A locked record never decodes to "locked for no reason".
            let reason = if reason == LockReason::None {
                LockReason::Unknown
            } else {
                reason
            };
            Self {
                locked: true,
                reason,
                timestamp: record.timestamp,
            }
        } else {
            Self::unlocked()
        }
    }
}

/// Storage for the lock record.
pub trait LockStateStore: Send + Sync {
    /// Read the record. A missing record is `Ok(LockState::unlocked())`.
    fn load(&self) -> Result<LockState, GuardError>;

    /// Replace the whole record.
    fn store(&self, state: &LockState) -> Result<(), GuardError>;
}

/// Encrypted file-backed store at `<state_dir>/appguard/lock_state.enc`.
pub struct FileLockStore {
    dir: PathBuf,
    encryption_key: [u8; 32],
}

impl FileLockStore {
    /// Create a store under `state_dir`, keyed to `installation_id`.
    pub fn new(state_dir: &Path, installation_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(STATE_KEY_DOMAIN);
        hasher.update(installation_id.as_bytes());
        let encryption_key: [u8; 32] = hasher.finalize().into();

        Self {
            dir: state_dir.join(STATE_NAMESPACE),
            encryption_key,
        }
    }

    /// Path of the record file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, GuardError> {
        XChaCha20Poly1305::new_from_slice(&self.encryption_key).map_err(|e| GuardError::Storage {
            message: format!("cipher init failed: {e}"),
        })
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, GuardError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()?
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| GuardError::Storage {
                message: format!("encrypt failed: {e}"),
            })?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, GuardError> {
        if data.len() < NONCE_SIZE {
            return Err(GuardError::Storage {
                message: "record truncated".into(),
            });
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher()?
            .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| GuardError::Storage {
                message: "record failed authentication".into(),
            })
    }
}

impl LockStateStore for FileLockStore {
    fn load(&self) -> Result<LockState, GuardError> {
        let path = self.path();
        let encrypted = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("LockStore: no record at {}", path.display());
                return Ok(LockState::unlocked());
            },
            Err(e) => return Err(e.into()),
        };

        let decrypted = self.decrypt(&encrypted)?;
        let record: PersistedLockState =
            serde_json::from_slice(&decrypted).map_err(|e| GuardError::Storage {
                message: format!("record unparseable: {e}"),
            })?;
        Ok(record.into())
    }

    fn store(&self, state: &LockState) -> Result<(), GuardError> {
        fs::create_dir_all(&self.dir)?;

        let data =
            serde_json::to_vec(&PersistedLockState::from(state)).map_err(|e| GuardError::Storage {
                message: format!("serialize failed: {e}"),
            })?;
        let encrypted = self.encrypt(&data)?;

        let target = self.path();
        let temp = self.dir.join(format!("{STATE_FILE}.tmp"));
        {
            let mut file = File::create(&temp)?;
            file.write_all(&encrypted)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &target)?;

        debug!(
            locked = state.locked,
            reason_code = state.reason.code(),
            "LockStore: record written"
        );
        Ok(())
    }
}

/// In-memory store for hosts without storage, and for tests.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    state: Mutex<Option<LockState>>,
    writes: Mutex<u32>,
}

impl MemoryLockStore {
    /// An empty store (unlocked).
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with a record, as if persisted by an earlier run.
    pub fn with_state(state: LockState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            writes: Mutex::new(0),
        }
    }

    /// Number of writes performed.
    pub fn write_count(&self) -> u32 {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }
}

impl LockStateStore for MemoryLockStore {
    fn load(&self) -> Result<LockState, GuardError> {
        let state = self.state.lock().map_err(|_| GuardError::Storage {
            message: "memory store poisoned".into(),
        })?;
        Ok(state.unwrap_or_default())
    }

    fn store(&self, state: &LockState) -> Result<(), GuardError> {
        let mut slot = self.state.lock().map_err(|_| GuardError::Storage {
            message: "memory store poisoned".into(),
        })?;
        *slot = Some(*state);
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }
}

/// Backend-issued permission to clear a lock.
///
/// The signature covers `"appguard-unlock:v1:" || installation_id || ":" ||
/// locked_at`, so a grant only clears the exact lock it was issued for.
#[derive(Debug, Clone)]
pub struct UnlockGrant {
    /// Ed25519 signature bytes.
    pub signature: [u8; 64],
}

impl UnlockGrant {
    /// Message a grant must sign.
    pub fn message(installation_id: &str, locked_at: i64) -> Vec<u8> {
        format!("{UNLOCK_DOMAIN}{installation_id}:{locked_at}").into_bytes()
    }
}

/// Owns the lock record for the process.
///
/// Loads the record once, serves every later read from memory, and applies
/// the monotonic transition rule.
pub struct LockController {
    store: Box<dyn LockStateStore>,
    state: RwLock<Option<LockState>>,
    installation_id: String,
    unlock_key: Option<[u8; 32]>,
}

impl LockController {
    /// Wrap a store.
    pub fn new(
        store: Box<dyn LockStateStore>,
        installation_id: impl Into<String>,
        unlock_key: Option<[u8; 32]>,
    ) -> Self {
        Self {
            store,
            state: RwLock::new(None),
            installation_id: installation_id.into(),
            unlock_key,
        }
    }

    /// Load the record, once.
    ///
    /// An unreadable record is replaced by a persisted `LOCKED(Unknown)`, so
    /// its timestamp stays stable across restarts and an unlock grant can be
    /// issued for it.
    pub fn load(&self) -> LockState {
        if let Ok(guard) = self.state.read() {
            if let Some(state) = *guard {
                return state;
            }
        }

        let mut guard = match self.state.write() {
            Ok(g) => g,
            Err(_) => return LockState::locked_now(LockReason::Unknown),
        };
        if let Some(state) = *guard {
            return state;
        }

        let state = match self.store.load() {
            Ok(state) => state,
            Err(e) => {
                error!("LockStore: record unreadable, treating as locked: {}", e);
                let state = LockState::locked_now(LockReason::Unknown);
                if let Err(e) = self.store.store(&state) {
                    error!("LockStore: failed to persist fail-closed record: {}", e);
                }
                state
            },
        };
        if state.locked {
            warn!(
                reason = ?state.reason,
                "Installation is locked: {}",
                state.reason.description()
            );
        } else {
            debug!("Lock state loaded: unlocked");
        }
        *guard = Some(state);
        state
    }

    /// Current state.
    pub fn current(&self) -> LockState {
        self.load()
    }

    /// Whether the installation is locked.
    pub fn is_locked(&self) -> bool {
        self.load().locked
    }

    /// Lock the installation.
    ///
    /// Already locked: no-op that keeps the first reason. A failed write
    /// still locks the running process.
    pub fn lock(&self, reason: LockReason) -> LockState {
        let current = self.load();
        if current.locked {
            debug!(
                existing = ?current.reason,
                requested = ?reason,
                "Lock already in place"
            );
            return current;
        }

        let reason = if reason == LockReason::None {
            LockReason::Unknown
        } else {
            reason
        };

        let mut guard = match self.state.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = *guard {
            if existing.locked {
                return existing;
            }
        }

        let state = LockState::locked_now(reason);
        error!(
            reason = ?reason,
            code = reason.code(),
            "ENTERING LOCK: {}",
            reason.description()
        );
        if let Err(e) = self.store.store(&state) {
            error!("LockStore: failed to persist lock: {}", e);
        }
        *guard = Some(state);
        state
    }

    /// Clear the lock with a backend-signed grant.
    pub fn reset(&self, grant: &UnlockGrant) -> Result<(), GuardError> {
        let key = self.unlock_key.ok_or_else(|| GuardError::UnlockRejected {
            reason: "no unlock key configured".into(),
        })?;
        let current = self.load();
        if !current.locked {
            return Ok(());
        }

        let verifying_key =
            VerifyingKey::from_bytes(&key).map_err(|e| GuardError::UnlockRejected {
                reason: format!("invalid unlock key: {e}"),
            })?;
        let message = UnlockGrant::message(&self.installation_id, current.timestamp);
        verifying_key
            .verify(&message, &Signature::from_bytes(&grant.signature))
            .map_err(|_| GuardError::UnlockRejected {
                reason: "signature does not verify".into(),
            })?;

        let unlocked = LockState::unlocked();
        self.store.store(&unlocked)?;
        let mut guard = match self.state.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(unlocked);
        info!("Lock cleared by signed unlock grant");
        Ok(())
    }

    /// Installation id the record is bound to.
    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    /// Multi-line support string.
    pub fn technical_details(&self) -> String {
        let state = self.load();
        format!(
            "Security Lock Status:\n- Locked: {}\n- Reason: {:?}\n- Reason Code: {}\n- Timestamp: {}",
            state.locked,
            state.reason,
            state.reason.code(),
            state.timestamp
        )
    }
}
