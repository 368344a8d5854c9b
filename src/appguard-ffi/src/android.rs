//! Android JNI bindings for `dev.appguard.AppGuard`.
//!
//! Handles cross the boundary as `jlong`. Every entry point treats a zero
//! handle as locked, so a failed init cannot be mistaken for a genuine one.

use std::path::PathBuf;

use jni::objects::{JByteArray, JClass, JString};
use jni::sys::{jboolean, jbyteArray, jint, jlong, jstring, JNI_TRUE};
use jni::JNIEnv;

use appguard_core::{lock_message, IdentityBaseline, LockReason};

use super::{init_logging, AppGuardHandle, HostIdentity};

fn read_string(env: &mut JNIEnv, value: &JString) -> Option<String> {
    if value.is_null() {
        return None;
    }
    env.get_string(value).ok().map(Into::into)
}

fn handle_ref<'a>(handle: jlong) -> Option<&'a AppGuardHandle> {
    // SAFETY: non-zero handles come from nativeInit and stay valid until nativeDestroy.
    unsafe { (handle as *const AppGuardHandle).as_ref() }
}

#[no_mangle]
pub extern "system" fn Java_dev_appguard_AppGuard_nativeInit<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    config_json: JString<'local>,
    package_name: JString<'local>,
    certificate: JByteArray<'local>,
    bundle_path: JString<'local>,
    backend_url: JString<'local>,
) -> jlong {
    init_logging();

    let (Some(package_name), Some(bundle_path)) = (
        read_string(&mut env, &package_name),
        read_string(&mut env, &bundle_path),
    ) else {
        tracing::error!("nativeInit: package name or bundle path missing");
        return 0;
    };
    let certificate = match env.convert_byte_array(&certificate) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("nativeInit: certificate unreadable: {}", e);
            return 0;
        },
    };
    let config_json = read_string(&mut env, &config_json);
    let backend_url = read_string(&mut env, &backend_url);

    let baseline = match IdentityBaseline::embedded() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("nativeInit: {}", e);
            return 0;
        },
    };
    let identity = HostIdentity {
        package_name,
        certificate,
        bundle_path: PathBuf::from(bundle_path),
        backend_url,
    };

    match AppGuardHandle::open(config_json.as_deref(), baseline, identity) {
        Ok(handle) => Box::into_raw(Box::new(handle)) as jlong,
        Err(e) => {
            tracing::error!("nativeInit failed: {}", e);
            0
        },
    }
}

#[no_mangle]
pub extern "system" fn Java_dev_appguard_AppGuard_nativeIsLocked(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jboolean {
    match handle_ref(handle) {
        Some(h) => jboolean::from(h.orchestrator.is_locked()),
        None => JNI_TRUE,
    }
}

#[no_mangle]
pub extern "system" fn Java_dev_appguard_AppGuard_nativeLockReason(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jint {
    match handle_ref(handle) {
        Some(h) => h.orchestrator.lock_reason().code(),
        None => LockReason::Unknown.code(),
    }
}

#[no_mangle]
pub extern "system" fn Java_dev_appguard_AppGuard_nativeLockMessage<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> jstring {
    let message = match handle_ref(handle) {
        Some(h) => h.orchestrator.lock_message(),
        None => lock_message(LockReason::Unknown),
    };
    env.new_string(message)
        .map(JString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

#[no_mangle]
pub extern "system" fn Java_dev_appguard_AppGuard_nativeTechnicalDetails<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> jstring {
    let Some(h) = handle_ref(handle) else {
        return std::ptr::null_mut();
    };
    env.new_string(h.orchestrator.technical_details())
        .map(JString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

/// The secret bytes, or `null` when refused.
#[no_mangle]
pub extern "system" fn Java_dev_appguard_AppGuard_nativeFetchSecret<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> jbyteArray {
    let Some(h) = handle_ref(handle) else {
        return std::ptr::null_mut();
    };
    match h.orchestrator.fetch_secret() {
        Ok(secret) => env
            .byte_array_from_slice(secret.expose())
            .map(JByteArray::into_raw)
            .unwrap_or(std::ptr::null_mut()),
        Err(e) => {
            tracing::warn!("nativeFetchSecret refused: {}", e);
            std::ptr::null_mut()
        },
    }
}

#[no_mangle]
pub extern "system" fn Java_dev_appguard_AppGuard_nativeDestroy(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if handle != 0 {
        // SAFETY: the handle came from nativeInit and is destroyed once.
        let handle = unsafe { Box::from_raw(handle as *mut AppGuardHandle) };
        handle.orchestrator.shutdown();
    }
}
