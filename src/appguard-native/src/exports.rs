//! C ABI bound by the host bridge.
//!
//! Tri-state results: `1` pass, `0` fail, negative [`NativeError`] code on
//! error. Status results: `0` ok, negative code on error. Memory returned
//! by [`appguard_native_fetch_secret`] is released with
//! [`appguard_native_free`], which also wipes it.

#![allow(clippy::missing_safety_doc)] // FFI functions are inherently unsafe

use std::ffi::CStr;

use libc::c_char;
use zeroize::Zeroize;

use crate::{ModuleIdentity, NativeError, ABI_VERSION};

/// ABI version; the host refuses any other value.
#[no_mangle]
pub extern "C" fn appguard_native_abi_version() -> u32 {
    ABI_VERSION
}

/// Whether `package` is this module's package.
///
/// # Safety
///
/// `package` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn appguard_native_verify_identity(package: *const c_char) -> i32 {
    let package = match read_str(package) {
        Ok(p) => p,
        Err(e) => return e.code(),
    };
    match ModuleIdentity::compiled() {
        Ok(identity) => i32::from(identity.verify_identity(package)),
        Err(e) => e.code(),
    }
}

/// Module-side integrity check.
#[no_mangle]
pub extern "C" fn appguard_native_verify_integrity() -> i32 {
    match ModuleIdentity::compiled() {
        Ok(identity) => match identity.verify_integrity() {
            Ok(()) => 1,
            Err(NativeError::IntegrityFailure { .. }) => 0,
            Err(e) => e.code(),
        },
        Err(e) => e.code(),
    }
}

/// Write the module checksum to `out`.
///
/// # Safety
///
/// `out` must be NULL or valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn appguard_native_checksum(out: *mut u64) -> i32 {
    if out.is_null() {
        return invalid("null checksum pointer");
    }
    match ModuleIdentity::compiled() {
        Ok(identity) => {
            *out = identity.checksum();
            0
        },
        Err(e) => e.code(),
    }
}

/// Release the secret for `package` signed with `cert_digest`.
///
/// On success `*out_data` points at `*out_len` bytes owned by the caller,
/// to be released with [`appguard_native_free`].
///
/// # Safety
///
/// - `package` and `cert_digest` must be NULL or valid NUL-terminated strings
/// - `out_data` and `out_len` must be NULL or valid for writes
#[no_mangle]
pub unsafe extern "C" fn appguard_native_fetch_secret(
    package: *const c_char,
    cert_digest: *const c_char,
    out_data: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    if out_data.is_null() || out_len.is_null() {
        return invalid("null output pointer");
    }
    let (package, cert_digest) = match (read_str(package), read_str(cert_digest)) {
        (Ok(p), Ok(d)) => (p, d),
        (Err(e), _) | (_, Err(e)) => return e.code(),
    };

    let identity = match ModuleIdentity::compiled() {
        Ok(identity) => identity,
        Err(e) => return e.code(),
    };
    match identity.fetch_secret(package, cert_digest) {
        Ok(secret) => {
            let boxed: Box<[u8]> = secret.as_slice().into();
            *out_len = boxed.len();
            *out_data = Box::into_raw(boxed).cast::<u8>();
            0
        },
        Err(e) => e.code(),
    }
}

/// Wipe and release memory returned by [`appguard_native_fetch_secret`].
///
/// # Safety
///
/// `data` must be NULL or a pointer returned by
/// [`appguard_native_fetch_secret`] together with its length, freed once.
#[no_mangle]
pub unsafe extern "C" fn appguard_native_free(data: *mut u8, len: usize) {
    if data.is_null() {
        return;
    }
    let mut boxed: Box<[u8]> = Box::from_raw(std::ptr::slice_from_raw_parts_mut(data, len));
    Zeroize::zeroize(&mut boxed[..]);
}

unsafe fn read_str<'a>(ptr: *const c_char) -> Result<&'a str, NativeError> {
    if ptr.is_null() {
        return Err(NativeError::InvalidArgument {
            reason: "null string".into(),
        });
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| NativeError::InvalidArgument {
            reason: "string is not UTF-8".into(),
        })
}

fn invalid(reason: &str) -> i32 {
    NativeError::InvalidArgument {
        reason: reason.into(),
    }
    .code()
}
