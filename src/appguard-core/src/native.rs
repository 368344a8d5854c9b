//! Native attestation bridge.
//!
//! A separately compiled module re-derives identity on its own and gates
//! the protected secret. The bridge binds it once at startup:
//!
//! - **present**: every check goes to the module; errors count as failure.
//! - **absent**: identity and integrity checks pass vacuously, so HARD
//!   gating falls back to the high-level checks, but `fetch_secret` always
//!   errors.
//!
//! ## C ABI
//!
//! | symbol | signature | result |
//! |--------|-----------|--------|
//! | `appguard_native_abi_version` | `() -> u32` | must be 1 |
//! | `appguard_native_verify_identity` | `(*const c_char) -> i32` | 1 match, 0 mismatch, <0 error |
//! | `appguard_native_verify_integrity` | `() -> i32` | 1 ok, 0 failed, <0 error |
//! | `appguard_native_checksum` | `(*mut u64) -> i32` | 0 ok |
//! | `appguard_native_fetch_secret` | `(*const c_char, *const c_char, *mut *mut u8, *mut usize) -> i32` | 0 ok |
//! | `appguard_native_free` | `(*mut u8, usize)` | |

use std::path::Path;
use std::sync::OnceLock;

use tracing::{debug, error, info, warn};

use crate::checksum::CertificateDigest;
use crate::error::GuardError;
use crate::secret::ProtectedSecret;

/// ABI version this bridge speaks.
pub const NATIVE_ABI_VERSION: u32 = 1;

/// Capability surface of the native module.
pub trait NativeModule: Send + Sync {
    /// Whether the module accepts `package_name` as its own.
    fn verify_identity(&self, package_name: &str) -> Result<bool, GuardError>;

    /// Module-side integrity check.
    fn verify_integrity(&self) -> Result<bool, GuardError>;

    /// Checksum over the module's compiled-in constants.
    fn compute_checksum(&self) -> Result<u64, GuardError>;

    /// Release the secret. The module re-runs its own checks.
    fn fetch_secret(
        &self,
        package_name: &str,
        digest: &CertificateDigest,
    ) -> Result<ProtectedSecret, GuardError>;
}

enum BridgeMode {
    Present(Box<dyn NativeModule>),
    Absent(String),
}

/// Present-or-absent wrapper over a [`NativeModule`], chosen at startup.
pub struct NativeAttestationBridge {
    mode: BridgeMode,
    expected_checksum: OnceLock<u64>,
}

impl NativeAttestationBridge {
    /// Load the module at `path`. Any failure selects absent mode.
    ///
    /// `expected_checksum` is the build-time pin, if any.
    pub fn load(path: Option<&Path>, expected_checksum: Option<u64>) -> Self {
        let Some(path) = path else {
            info!("Native attestation module not configured; running without it");
            return Self::absent("not configured");
        };

        match DylibModule::load(path) {
            Ok(module) => {
                info!(path = %path.display(), "Native attestation module loaded");
                Self::with_module(Box::new(module), expected_checksum)
            },
            Err(e) => {
                warn!(
                    path = %path.display(),
                    "Native attestation module failed to load, native checks skipped: {}",
                    e
                );
                Self::absent(e.to_string())
            },
        }
    }

    /// Bridge over an already bound module.
    pub fn with_module(module: Box<dyn NativeModule>, expected_checksum: Option<u64>) -> Self {
        let pinned = OnceLock::new();
        if let Some(checksum) = expected_checksum {
            let _ = pinned.set(checksum);
        }
        Self {
            mode: BridgeMode::Present(module),
            expected_checksum: pinned,
        }
    }

    /// Bridge without a module.
    pub fn absent(reason: impl Into<String>) -> Self {
        Self {
            mode: BridgeMode::Absent(reason.into()),
            expected_checksum: OnceLock::new(),
        }
    }

    /// Whether a module is bound.
    pub fn is_present(&self) -> bool {
        matches!(self.mode, BridgeMode::Present(_))
    }

    /// Module identity check. Absent: `true`. Errors: `false`.
    pub fn verify_identity(&self, package_name: &str) -> bool {
        match &self.mode {
            BridgeMode::Absent(_) => true,
            BridgeMode::Present(module) => match module.verify_identity(package_name) {
                Ok(ok) => ok,
                Err(e) => {
                    error!("Native identity check errored: {}", e);
                    false
                },
            },
        }
    }

    /// Module integrity check. Absent: `true`. Errors: `false`.
    pub fn verify_integrity(&self) -> bool {
        match &self.mode {
            BridgeMode::Absent(_) => true,
            BridgeMode::Present(module) => match module.verify_integrity() {
                Ok(ok) => ok,
                Err(e) => {
                    error!("Native integrity check errored: {}", e);
                    false
                },
            },
        }
    }

    /// Current module checksum. `None` when absent or on error.
    pub fn compute_checksum(&self) -> Option<u64> {
        match &self.mode {
            BridgeMode::Absent(_) => None,
            BridgeMode::Present(module) => match module.compute_checksum() {
                Ok(checksum) => Some(checksum),
                Err(e) => {
                    error!("Native checksum errored: {}", e);
                    None
                },
            },
        }
    }

    /// Expected checksum: the build-time pin, or the value pinned at startup.
    pub fn expected_checksum(&self) -> Option<u64> {
        self.expected_checksum.get().copied()
    }

    /// Pin the current checksum if no build-time value exists.
    ///
    /// Returns the expected checksum, or `None` when absent or unreadable.
    pub fn pin_checksum(&self) -> Option<u64> {
        if let Some(expected) = self.expected_checksum() {
            return Some(expected);
        }
        let current = self.compute_checksum()?;
        let pinned = *self.expected_checksum.get_or_init(|| current);
        debug!(checksum = pinned, "Native checksum pinned at startup");
        Some(pinned)
    }

    /// Whether the module checksum equals the expected one.
    ///
    /// Absent: `true`. No expected value or unreadable checksum: `false`.
    pub fn checksum_matches(&self) -> bool {
        if !self.is_present() {
            return true;
        }
        let (Some(expected), Some(current)) = (self.expected_checksum(), self.compute_checksum())
        else {
            return false;
        };
        if expected != current {
            error!(expected, current, "Native checksum mismatch");
            return false;
        }
        true
    }

    /// Release the secret.
    ///
    /// Errors in every state except: module present, identity ok,
    /// integrity ok and checksum matching.
    pub fn fetch_secret(
        &self,
        package_name: &str,
        digest: &CertificateDigest,
    ) -> Result<ProtectedSecret, GuardError> {
        let module = match &self.mode {
            BridgeMode::Absent(reason) => {
                return Err(GuardError::NativeUnavailable {
                    reason: reason.clone(),
                })
            },
            BridgeMode::Present(module) => module,
        };

        if !self.verify_identity(package_name) {
            return Err(GuardError::SecretUnavailable {
                reason: "native identity check failed".into(),
            });
        }
        if !self.verify_integrity() {
            return Err(GuardError::SecretUnavailable {
                reason: "native integrity check failed".into(),
            });
        }
        if !self.checksum_matches() {
            return Err(GuardError::SecretUnavailable {
                reason: "native checksum does not match".into(),
            });
        }

        module
            .fetch_secret(package_name, digest)
            .map_err(|e| GuardError::SecretUnavailable {
                reason: format!("native module refused: {e}"),
            })
    }
}

impl std::fmt::Debug for NativeAttestationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.mode {
            BridgeMode::Present(_) => f
                .debug_struct("NativeAttestationBridge")
                .field("present", &true)
                .field("expected_checksum", &self.expected_checksum())
                .finish(),
            BridgeMode::Absent(reason) => f
                .debug_struct("NativeAttestationBridge")
                .field("present", &false)
                .field("reason", reason)
                .finish(),
        }
    }
}

pub use dylib::DylibModule;

#[cfg(unix)]
mod dylib {
    use std::ffi::{c_char, c_void, CStr, CString};
    use std::path::Path;

    use super::{NativeModule, NATIVE_ABI_VERSION};
    use crate::checksum::CertificateDigest;
    use crate::error::GuardError;
    use crate::secret::ProtectedSecret;

    type AbiVersionFn = unsafe extern "C" fn() -> u32;
    type VerifyIdentityFn = unsafe extern "C" fn(*const c_char) -> i32;
    type VerifyIntegrityFn = unsafe extern "C" fn() -> i32;
    type ChecksumFn = unsafe extern "C" fn(*mut u64) -> i32;
    type FetchSecretFn =
        unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut u8, *mut usize) -> i32;
    type FreeFn = unsafe extern "C" fn(*mut u8, usize);

    /// Native module bound through the platform dynamic loader.
    pub struct DylibModule {
        handle: *mut c_void,
        verify_identity: VerifyIdentityFn,
        verify_integrity: VerifyIntegrityFn,
        checksum: ChecksumFn,
        fetch_secret: FetchSecretFn,
        free: FreeFn,
    }

    // SAFETY: the handle is only used for dlclose in Drop, and the exported
    // functions are required to be thread-safe by the module contract.
    unsafe impl Send for DylibModule {}
    unsafe impl Sync for DylibModule {}

    impl DylibModule {
        /// `dlopen` the module and resolve every symbol.
        pub fn load(path: &Path) -> Result<Self, GuardError> {
            let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
                GuardError::NativeUnavailable {
                    reason: "module path contains NUL".into(),
                }
            })?;

            // SAFETY: c_path is a valid C string for the duration of the call.
            let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
            if handle.is_null() {
                return Err(GuardError::NativeUnavailable {
                    reason: last_dl_error(),
                });
            }

            // SAFETY: handle is a live dlopen handle; on any error it is closed below.
            let bound = unsafe { Self::bind(handle) };
            if bound.is_err() {
                // SAFETY: handle came from dlopen and is not used afterwards.
                unsafe {
                    libc::dlclose(handle);
                }
            }
            bound
        }

        unsafe fn bind(handle: *mut c_void) -> Result<Self, GuardError> {
            let abi_version: AbiVersionFn = symbol(handle, c"appguard_native_abi_version")?;
            let version = abi_version();
            if version != NATIVE_ABI_VERSION {
                return Err(GuardError::NativeUnavailable {
                    reason: format!("ABI version {version}, expected {NATIVE_ABI_VERSION}"),
                });
            }

            Ok(Self {
                handle,
                verify_identity: symbol(handle, c"appguard_native_verify_identity")?,
                verify_integrity: symbol(handle, c"appguard_native_verify_integrity")?,
                checksum: symbol(handle, c"appguard_native_checksum")?,
                fetch_secret: symbol(handle, c"appguard_native_fetch_secret")?,
                free: symbol(handle, c"appguard_native_free")?,
            })
        }
    }

    /// Resolve `name` as a function pointer of type `T`.
    unsafe fn symbol<T: Copy>(handle: *mut c_void, name: &CStr) -> Result<T, GuardError> {
        let ptr = libc::dlsym(handle, name.as_ptr());
        if ptr.is_null() {
            return Err(GuardError::NativeUnavailable {
                reason: format!("missing symbol {}", name.to_string_lossy()),
            });
        }
        Ok(std::mem::transmute_copy::<*mut c_void, T>(&ptr))
    }

    fn last_dl_error() -> String {
        // SAFETY: dlerror returns NULL or a thread-local C string.
        unsafe {
            let err = libc::dlerror();
            if err.is_null() {
                "dlopen failed".into()
            } else {
                CStr::from_ptr(err).to_string_lossy().into_owned()
            }
        }
    }

    fn tri_state(code: i32, what: &str) -> Result<bool, GuardError> {
        match code {
            1 => Ok(true),
            0 => Ok(false),
            other => Err(GuardError::NativeFailure {
                reason: format!("{what} returned {other}"),
            }),
        }
    }

    fn c_string(value: &str) -> Result<CString, GuardError> {
        CString::new(value).map_err(|_| GuardError::NativeFailure {
            reason: "argument contains NUL".into(),
        })
    }

    impl NativeModule for DylibModule {
        fn verify_identity(&self, package_name: &str) -> Result<bool, GuardError> {
            let package = c_string(package_name)?;
            // SAFETY: package outlives the call.
            let code = unsafe { (self.verify_identity)(package.as_ptr()) };
            tri_state(code, "verify_identity")
        }

        fn verify_integrity(&self) -> Result<bool, GuardError> {
            // SAFETY: no arguments.
            let code = unsafe { (self.verify_integrity)() };
            tri_state(code, "verify_integrity")
        }

        fn compute_checksum(&self) -> Result<u64, GuardError> {
            let mut out = 0u64;
            // SAFETY: out is a valid, writable u64.
            let code = unsafe { (self.checksum)(&mut out) };
            if code != 0 {
                return Err(GuardError::NativeFailure {
                    reason: format!("checksum returned {code}"),
                });
            }
            Ok(out)
        }

        fn fetch_secret(
            &self,
            package_name: &str,
            digest: &CertificateDigest,
        ) -> Result<ProtectedSecret, GuardError> {
            let package = c_string(package_name)?;
            let digest = c_string(digest.as_str())?;
            let mut data: *mut u8 = std::ptr::null_mut();
            let mut len: usize = 0;

            // SAFETY: arguments outlive the call; out pointers are valid.
            let code = unsafe {
                (self.fetch_secret)(package.as_ptr(), digest.as_ptr(), &mut data, &mut len)
            };
            if code != 0 || data.is_null() {
                return Err(GuardError::NativeFailure {
                    reason: format!("fetch_secret returned {code}"),
                });
            }

            // SAFETY: on success the module hands over `len` readable bytes at
            // `data`, released with its own free function.
            let bytes = unsafe { std::slice::from_raw_parts(data, len).to_vec() };
            unsafe { (self.free)(data, len) };
            Ok(ProtectedSecret::new(bytes))
        }
    }

    impl Drop for DylibModule {
        fn drop(&mut self) {
            // SAFETY: handle came from dlopen and is closed exactly once.
            unsafe {
                libc::dlclose(self.handle);
            }
        }
    }
}

#[cfg(not(unix))]
mod dylib {
    use std::path::Path;

    use super::NativeModule;
    use crate::checksum::CertificateDigest;
    use crate::error::GuardError;
    use crate::secret::ProtectedSecret;

    /// Dynamic loading is not supported on this platform.
    pub struct DylibModule(());

    impl DylibModule {
        /// Always fails; the bridge falls back to absent mode.
        pub fn load(_path: &Path) -> Result<Self, GuardError> {
            Err(GuardError::NativeUnavailable {
                reason: "dynamic loading unsupported on this platform".into(),
            })
        }
    }

    impl NativeModule for DylibModule {
        fn verify_identity(&self, _package_name: &str) -> Result<bool, GuardError> {
            Ok(false)
        }

        fn verify_integrity(&self) -> Result<bool, GuardError> {
            Ok(false)
        }

        fn compute_checksum(&self) -> Result<u64, GuardError> {
            Err(GuardError::NativeUnavailable {
                reason: "unsupported".into(),
            })
        }

        fn fetch_secret(
            &self,
            _package_name: &str,
            _digest: &CertificateDigest,
        ) -> Result<ProtectedSecret, GuardError> {
            Err(GuardError::NativeUnavailable {
                reason: "unsupported".into(),
            })
        }
    }
}
