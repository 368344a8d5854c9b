//! # appguard-ffi
//!
//! C-compatible FFI interface for AppGuard.
//!
//! The host supplies the identity it observes at runtime (package name,
//! signing certificate, installed bundle path, configured backend URL).
//! The expected identity is compiled in with the `embedded-baseline`
//! feature; without it `appguard_init` always fails.
//!
//! ## Usage
//!
//! ```c
//! #include "appguard.h"
//!
//! int main() {
//!     AppGuardHandle* guard = appguard_init(
//!         "{\"state_dir\": \"/data/data/com.example.tv/files/appguard\"}",
//!         "com.example.tv", cert, cert_len,
//!         "/data/app/com.example.tv/base.apk", "https://api.example.live/");
//!     if (!guard) {
//!         return 1;
//!     }
//!
//!     if (appguard_is_locked(guard) == 1) {
//!         char* message = NULL;
//!         size_t message_len = 0;
//!         appguard_lock_message(guard, (uint8_t**)&message, &message_len);
//!         show_lock_screen(message);
//!         appguard_free(message, message_len);
//!     } else {
//!         uint8_t* key = NULL;
//!         size_t key_len = 0;
//!         if (appguard_fetch_secret(guard, &key, &key_len) == 0) {
//!             connect(key, key_len);
//!             appguard_free(key, key_len);
//!         }
//!     }
//!
//!     appguard_destroy(guard);
//!     return 0;
//! }
//! ```

#![allow(clippy::missing_safety_doc)] // FFI functions are inherently unsafe

#[cfg(target_os = "android")]
mod android;

use std::ffi::{c_void, CStr};
use std::path::PathBuf;
use std::ptr;
use std::sync::{Arc, Once};
use std::time::Duration;

use appguard_core::{
    GuardConfig, GuardError, IdentityBaseline, OriginResolver, RedirectProbe, SecurityContext,
    SecurityOrchestrator, StaticHost, StaticOrigin, UnlockGrant,
};

/// Timeout for the backend redirect probe when no URL is supplied.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque handle to an AppGuard instance.
pub struct AppGuardHandle {
    orchestrator: SecurityOrchestrator,
}

/// Error codes returned by FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppGuardError {
    /// Success.
    Success = 0,
    /// Invalid argument.
    InvalidArgument = -1,
    /// Initialization failed.
    InitializationFailed = -2,
    /// The installation is locked.
    Locked = -3,
    /// The secret could not be released.
    SecretUnavailable = -4,
    /// A verification step failed.
    VerificationFailed = -5,
    /// Internal error.
    InternalError = -99,
}

impl From<&GuardError> for AppGuardError {
    fn from(e: &GuardError) -> Self {
        match e {
            GuardError::Locked { .. } => Self::Locked,
            GuardError::SecretUnavailable { .. } | GuardError::NativeUnavailable { .. } => {
                Self::SecretUnavailable
            },
            GuardError::Baseline { .. } | GuardError::Config { .. } => Self::InitializationFailed,
            e if e.is_hard_violation() => Self::VerificationFailed,
            _ => Self::InternalError,
        }
    }
}

/// Runtime identity observed by the host.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    /// Installed package name.
    pub package_name: String,
    /// Raw signing certificate bytes.
    pub certificate: Vec<u8>,
    /// Path of the installed bundle.
    pub bundle_path: PathBuf,
    /// Backend URL the app is configured with. `None` probes the baseline origin.
    pub backend_url: Option<String>,
}

impl AppGuardHandle {
    /// Build the orchestrator and run the startup sequence.
    ///
    /// The config must name a `state_dir`; without one the lock record
    /// could not survive a restart and `GuardError::Config` is returned.
    pub fn open(
        config_json: Option<&str>,
        baseline: IdentityBaseline,
        identity: HostIdentity,
    ) -> Result<Self, GuardError> {
        let config = match config_json {
            Some(json) => {
                let config: GuardConfig =
                    serde_json::from_str(json).map_err(|e| GuardError::Config {
                        message: format!("invalid config JSON: {e}"),
                    })?;
                config.validate()?;
                config
            },
            None => GuardConfig::default(),
        };

        let resolver: Arc<dyn OriginResolver> = match identity.backend_url {
            Some(url) => Arc::new(StaticOrigin(url)),
            None => Arc::new(RedirectProbe::new(
                baseline.backend_origin().to_string(),
                PROBE_TIMEOUT,
            )),
        };
        let host = Arc::new(StaticHost::new(
            identity.package_name,
            identity.certificate,
            identity.bundle_path,
        ));

        let context = SecurityContext::builder(config, baseline, host, resolver).build()?;
        let orchestrator = SecurityOrchestrator::new(context);
        let state = orchestrator.start();
        tracing::info!(locked = state.locked, reason = ?state.reason, "AppGuard initialized");
        Ok(Self { orchestrator })
    }

    /// The wrapped orchestrator.
    pub fn orchestrator(&self) -> &SecurityOrchestrator {
        &self.orchestrator
    }
}

/// Set up platform logging, once per process.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        #[cfg(target_os = "android")]
        {
            android_logger::init_once(
                android_logger::Config::default()
                    .with_max_level(log::LevelFilter::Info)
                    .with_tag("AppGuard"),
            );
        }

        #[cfg(not(target_os = "android"))]
        {
            // A host that installed its own subscriber keeps it.
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .with_target(false)
                .try_init();
        }
    });
}

/// Initialize AppGuard and run the startup verification.
///
/// Returns NULL on failure. A locked installation still yields a handle;
/// query it with `appguard_is_locked`.
///
/// # Arguments
///
/// * `config_json` - `GuardConfig` as JSON; must name a writable `state_dir`
/// * `package_name` - Installed package name
/// * `cert_data` / `cert_len` - Raw signing certificate
/// * `bundle_path` - Installed bundle path
/// * `backend_url` - Configured backend URL, or NULL to probe the baseline origin
///
/// # Safety
///
/// String arguments must be NULL or valid NUL-terminated strings and
/// `cert_data` must point to `cert_len` readable bytes. The returned handle
/// must be freed with `appguard_destroy`.
#[no_mangle]
pub unsafe extern "C" fn appguard_init(
    config_json: *const libc::c_char,
    package_name: *const libc::c_char,
    cert_data: *const u8,
    cert_len: usize,
    bundle_path: *const libc::c_char,
    backend_url: *const libc::c_char,
) -> *mut AppGuardHandle {
    init_logging();

    if package_name.is_null() || cert_data.is_null() || bundle_path.is_null() {
        tracing::error!("appguard_init: required argument is NULL");
        return ptr::null_mut();
    }
    let (Some(package_name), Some(bundle_path)) = (opt_str(package_name), opt_str(bundle_path))
    else {
        tracing::error!("appguard_init: argument is not UTF-8");
        return ptr::null_mut();
    };
    let config_json = opt_str(config_json);
    let backend_url = opt_str(backend_url);

    let baseline = match IdentityBaseline::embedded() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("Failed to load baseline: {}", e);
            return ptr::null_mut();
        },
    };

    let identity = HostIdentity {
        package_name: package_name.to_string(),
        certificate: std::slice::from_raw_parts(cert_data, cert_len).to_vec(),
        bundle_path: PathBuf::from(bundle_path),
        backend_url: backend_url.map(str::to_string),
    };

    match AppGuardHandle::open(config_json, baseline, identity) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            tracing::error!("Failed to initialize AppGuard: {}", e);
            ptr::null_mut()
        },
    }
}

/// 1 if locked, 0 if not, negative on error.
///
/// # Safety
///
/// `handle` must be NULL or a valid handle from `appguard_init`.
#[no_mangle]
pub unsafe extern "C" fn appguard_is_locked(handle: *const AppGuardHandle) -> i32 {
    match handle.as_ref() {
        Some(handle) => i32::from(handle.orchestrator.is_locked()),
        None => AppGuardError::InvalidArgument as i32,
    }
}

/// Lock reason code (0 when unlocked), negative on error.
///
/// # Safety
///
/// `handle` must be NULL or a valid handle from `appguard_init`.
#[no_mangle]
pub unsafe extern "C" fn appguard_lock_reason(handle: *const AppGuardHandle) -> i32 {
    match handle.as_ref() {
        Some(handle) => handle.orchestrator.lock_reason().code(),
        None => AppGuardError::InvalidArgument as i32,
    }
}

/// User-facing lock message as a NUL-terminated string (empty when unlocked).
///
/// # Safety
///
/// `handle` must be a valid handle; `out_data` and `out_len` must be valid
/// pointers. Free the result with `appguard_free`.
#[no_mangle]
pub unsafe extern "C" fn appguard_lock_message(
    handle: *const AppGuardHandle,
    out_data: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let Some(handle) = handle.as_ref() else {
        return AppGuardError::InvalidArgument as i32;
    };
    write_out(handle.orchestrator.lock_message().as_bytes(), out_data, out_len)
}

/// Multi-line support string describing the lock record.
///
/// # Safety
///
/// Same contract as `appguard_lock_message`.
#[no_mangle]
pub unsafe extern "C" fn appguard_technical_details(
    handle: *const AppGuardHandle,
    out_data: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let Some(handle) = handle.as_ref() else {
        return AppGuardError::InvalidArgument as i32;
    };
    write_out(handle.orchestrator.technical_details().as_bytes(), out_data, out_len)
}

/// Re-run the HARD identity checks now.
///
/// # Safety
///
/// `handle` must be NULL or a valid handle from `appguard_init`.
#[no_mangle]
pub unsafe extern "C" fn appguard_verify_now(handle: *const AppGuardHandle) -> i32 {
    let Some(handle) = handle.as_ref() else {
        return AppGuardError::InvalidArgument as i32;
    };
    match handle.orchestrator.verify_now() {
        Ok(()) => AppGuardError::Success as i32,
        Err(e) => AppGuardError::from(&e) as i32,
    }
}

/// Clear the lock with a backend-signed Ed25519 unlock grant.
///
/// # Safety
///
/// `handle` must be a valid handle; `signature` must point to `signature_len`
/// readable bytes.
#[no_mangle]
pub unsafe extern "C" fn appguard_reset(
    handle: *const AppGuardHandle,
    signature: *const u8,
    signature_len: usize,
) -> i32 {
    let Some(handle) = handle.as_ref() else {
        return AppGuardError::InvalidArgument as i32;
    };
    if signature.is_null() {
        return AppGuardError::InvalidArgument as i32;
    }
    let Ok(signature) = <[u8; 64]>::try_from(std::slice::from_raw_parts(signature, signature_len))
    else {
        return AppGuardError::InvalidArgument as i32;
    };
    match handle.orchestrator.reset(&UnlockGrant { signature }) {
        Ok(()) => AppGuardError::Success as i32,
        Err(e) => {
            tracing::warn!("Unlock grant rejected: {}", e);
            AppGuardError::VerificationFailed as i32
        },
    }
}

/// Release the protected secret.
///
/// # Safety
///
/// `handle` must be a valid handle; `out_data` and `out_len` must be valid
/// pointers. The caller must release the secret with `appguard_free`,
/// which wipes it.
#[no_mangle]
pub unsafe extern "C" fn appguard_fetch_secret(
    handle: *const AppGuardHandle,
    out_data: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let Some(handle) = handle.as_ref() else {
        return AppGuardError::InvalidArgument as i32;
    };
    match handle.orchestrator.fetch_secret() {
        Ok(secret) => write_out(secret.expose(), out_data, out_len),
        Err(e) => {
            tracing::warn!("Secret request refused: {}", e);
            AppGuardError::from(&e) as i32
        },
    }
}

/// Wipe and free memory returned by AppGuard functions.
///
/// # Safety
///
/// `data` must be NULL or a pointer returned by an AppGuard function, with
/// the length it reported.
#[no_mangle]
pub unsafe extern "C" fn appguard_free(data: *mut c_void, len: usize) {
    if !data.is_null() {
        ptr::write_bytes(data.cast::<u8>(), 0, len);
        libc::free(data);
    }
}

/// Stop monitoring and release the handle.
///
/// # Safety
///
/// `handle` must be a valid handle from `appguard_init`.
/// After this call, the handle is invalid and must not be used.
#[no_mangle]
pub unsafe extern "C" fn appguard_destroy(handle: *mut AppGuardHandle) {
    if !handle.is_null() {
        let handle = Box::from_raw(handle);
        handle.orchestrator.shutdown();
    }
}

/// Get the library version.
///
/// Returns a static string with the version number.
#[no_mangle]
pub extern "C" fn appguard_version() -> *const libc::c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const libc::c_char
}

/// Copy `bytes` into a malloc'd, NUL-terminated buffer.
unsafe fn write_out(bytes: &[u8], out_data: *mut *mut u8, out_len: *mut usize) -> i32 {
    if out_data.is_null() || out_len.is_null() {
        return AppGuardError::InvalidArgument as i32;
    }

    let len = bytes.len();
    let buffer = libc::malloc(len + 1).cast::<u8>();
    if buffer.is_null() {
        return AppGuardError::InternalError as i32;
    }
    ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, len);
    *buffer.add(len) = 0;

    *out_data = buffer;
    *out_len = len;
    AppGuardError::Success as i32
}

unsafe fn opt_str<'a>(ptr: *const libc::c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}
