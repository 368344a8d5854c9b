//! Build script for appguard-native.
//!
//! Compiles the module's identity constants in from the same `APPGUARD_*`
//! variables as the core baseline. When any of them is missing the module
//! still builds, but every export refuses: it can never vouch for an
//! identity it was not given.

use base64::Engine;

const VARS: &[&str] = &[
    "APPGUARD_PACKAGE_NAME",
    "APPGUARD_CERT_DIGEST",
    "APPGUARD_SEALED_SECRET",
];

fn main() {
    println!("cargo::rustc-check-cfg=cfg(appguard_native_provisioned)");
    for var in VARS {
        println!("cargo::rerun-if-env-changed={var}");
    }

    let values: Vec<String> = VARS
        .iter()
        .map(|var| std::env::var(var).unwrap_or_default().trim().to_string())
        .collect();

    if let Some(missing) = VARS.iter().zip(&values).find(|(_, v)| v.is_empty()) {
        println!(
            "cargo::warning=appguard-native: {} not set, module will refuse every check",
            missing.0
        );
        return;
    }

    let engine = base64::engine::general_purpose::STANDARD;
    match engine.decode(&values[1]) {
        Ok(bytes) if bytes.len() == 32 => {},
        _ => panic!("appguard-native: APPGUARD_CERT_DIGEST must be base64 of a SHA-256 digest"),
    }
    if engine.decode(&values[2]).is_err() {
        panic!("appguard-native: APPGUARD_SEALED_SECRET must be base64");
    }

    println!("cargo::rustc-env=APPGUARD_NATIVE_PACKAGE={}", values[0]);
    println!("cargo::rustc-env=APPGUARD_NATIVE_CERT_DIGEST={}", values[1]);
    println!("cargo::rustc-env=APPGUARD_NATIVE_SEALED_SECRET={}", values[2]);
    println!("cargo::rustc-cfg=appguard_native_provisioned");
}
