//! Build script for appguard-core.
//!
//! With the `embedded-baseline` feature the identity baseline is compiled in
//! from `APPGUARD_*` environment variables. A missing or malformed value is a
//! build failure, so an unconfigured release cannot be produced.

use base64::Engine;

const REQUIRED: &[&str] = &[
    "APPGUARD_PACKAGE_NAME",
    "APPGUARD_CERT_DIGEST",
    "APPGUARD_BACKEND_ORIGIN",
];

const OPTIONAL: &[&str] = &[
    "APPGUARD_NATIVE_CHECKSUM",
    "APPGUARD_SEALED_SECRET",
    "APPGUARD_UNLOCK_PUBKEY",
    "APPGUARD_CERT_PINS",
];

fn main() {
    println!("cargo::rustc-check-cfg=cfg(appguard_embedded_baseline)");
    for var in REQUIRED.iter().chain(OPTIONAL) {
        println!("cargo::rerun-if-env-changed={var}");
    }

    if std::env::var_os("CARGO_FEATURE_EMBEDDED_BASELINE").is_none() {
        return;
    }

    for var in REQUIRED {
        let value = std::env::var(var).unwrap_or_default();
        if value.trim().is_empty() {
            panic!("embedded-baseline: {var} must be set at build time");
        }
    }

    let digest = std::env::var("APPGUARD_CERT_DIGEST").unwrap_or_default();
    match base64::engine::general_purpose::STANDARD.decode(digest.trim()) {
        Ok(bytes) if bytes.len() == 32 => {},
        _ => panic!("embedded-baseline: APPGUARD_CERT_DIGEST must be base64 of a SHA-256 digest"),
    }

    let origin = std::env::var("APPGUARD_BACKEND_ORIGIN").unwrap_or_default();
    if !origin.starts_with("https://") {
        panic!("embedded-baseline: APPGUARD_BACKEND_ORIGIN must be an https:// origin");
    }

    if let Ok(checksum) = std::env::var("APPGUARD_NATIVE_CHECKSUM") {
        if checksum.trim().parse::<u64>().is_err() {
            panic!("embedded-baseline: APPGUARD_NATIVE_CHECKSUM must be a decimal u64");
        }
    }

    if let Ok(key) = std::env::var("APPGUARD_UNLOCK_PUBKEY") {
        match hex::decode(key.trim()) {
            Ok(bytes) if bytes.len() == 32 => {},
            _ => panic!("embedded-baseline: APPGUARD_UNLOCK_PUBKEY must be 32 hex-encoded bytes"),
        }
    }

    // Optional values are exposed as empty strings when unset so `env!` works.
    for var in OPTIONAL {
        let value = std::env::var(var).unwrap_or_default();
        println!("cargo::rustc-env={var}={}", value.trim());
    }

    println!("cargo::rustc-cfg=appguard_embedded_baseline");
}
