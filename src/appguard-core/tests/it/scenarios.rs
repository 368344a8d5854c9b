//! End-to-end verification scenarios.

use std::path::Path;
use std::sync::Arc;

use appguard_core::{
    BackendOrigin, CertificateDigest, FileLockStore, GuardError, IdentityBaseline,
    IdentityVerifier, LockReason, LockState, LockStateStore, NativeAttestationBridge, PackageName,
    ResolveError, StaticHost, StaticOrigin,
};

use crate::support::{
    FailingResolver, MutableHost, Workspace, BACKEND, PACKAGE, RELEASE_CERT, SECRET,
};

/// Digest standing for the certificate labelled `label`.
fn labelled_digest(label: &str) -> CertificateDigest {
    CertificateDigest::parse(CertificateDigest::of_certificate(label.as_bytes()).as_str()).unwrap()
}

fn digest_baseline(label: &str) -> IdentityBaseline {
    IdentityBaseline::new(
        PackageName::parse(PACKAGE).unwrap(),
        labelled_digest(label),
        BackendOrigin::parse(BACKEND).unwrap(),
    )
}

// =============================================================================
// Signature digests
// =============================================================================

#[test]
fn matching_signature_digest_passes() {
    let verifier = IdentityVerifier::new(digest_baseline("ABC123"));
    let runtime = labelled_digest("ABC123");
    assert!(verifier.verify_certificate_digest(&runtime).is_ok());
}

#[test]
fn different_signature_digest_fails_and_locks() {
    let verifier = IdentityVerifier::new(digest_baseline("ABC123"));
    let runtime = labelled_digest("XYZ999");
    assert!(matches!(
        verifier.verify_certificate_digest(&runtime),
        Err(GuardError::SignatureMismatch)
    ));

    let ws = Workspace::new();
    let host = Arc::new(StaticHost::new(PACKAGE, RELEASE_CERT.to_vec(), ws.bundle()));
    let context = appguard_core::SecurityContext::builder(
        ws.config(),
        digest_baseline("ABC123"),
        host,
        Arc::new(StaticOrigin(BACKEND.into())),
    )
    .native(NativeAttestationBridge::absent("not configured"))
    .scanner(appguard_core::EnvironmentScanner::with_root(ws.scan_root()))
    .build()
    .unwrap();
    let orchestrator = appguard_core::SecurityOrchestrator::new(context);

    let state = orchestrator.start();
    assert!(state.locked);
    assert_eq!(state.reason, LockReason::SignatureMismatch);
}

// =============================================================================
// Persisted lock short-circuits everything
// =============================================================================

#[test]
fn persisted_lock_skips_all_checks() {
    let ws = Workspace::new();
    let stored = LockState {
        locked: true,
        reason: LockReason::CodeTampering,
        timestamp: 1_700_000_000_000,
    };
    FileLockStore::new(&ws.state_dir(), "tv-01").store(&stored).unwrap();

    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator(host.clone(), Arc::new(StaticOrigin(BACKEND.into())));

    let state = orchestrator.start();
    assert_eq!(state, stored);
    assert!(!orchestrator.monitor_running());

    assert!(matches!(
        orchestrator.fetch_secret(),
        Err(GuardError::Locked {
            reason: LockReason::CodeTampering
        })
    ));
    assert_eq!(host.read_count(), 0, "no identity input may be read while locked");
    assert!(orchestrator.lock_message().contains("tampered"));
}

// =============================================================================
// Native module absent
// =============================================================================

#[test]
fn missing_native_module_is_not_a_violation() {
    let ws = Workspace::new();
    let bridge = NativeAttestationBridge::load(
        Some(Path::new("/nonexistent/libappguard_native.so")),
        None,
    );
    assert!(!bridge.is_present());

    let host = Arc::new(StaticHost::new(PACKAGE, RELEASE_CERT.to_vec(), ws.bundle()));
    let orchestrator =
        ws.orchestrator_with(host, Arc::new(StaticOrigin(BACKEND.into())), bridge);

    assert!(!orchestrator.start().locked);
    assert_eq!(orchestrator.fetch_secret().unwrap().expose(), SECRET);
    orchestrator.shutdown();
}

#[test]
fn missing_native_module_still_enforces_high_level_checks() {
    let ws = Workspace::new();
    let bridge = NativeAttestationBridge::load(
        Some(Path::new("/nonexistent/libappguard_native.so")),
        None,
    );
    let host = Arc::new(StaticHost::new(
        "com.example.tv.mod",
        RELEASE_CERT.to_vec(),
        ws.bundle(),
    ));
    let orchestrator =
        ws.orchestrator_with(host, Arc::new(StaticOrigin(BACKEND.into())), bridge);

    let state = orchestrator.start();
    assert!(state.locked);
    assert_eq!(state.reason, LockReason::PackageMismatch);
    assert!(orchestrator.fetch_secret().is_err());
}

// =============================================================================
// Backend binding
// =============================================================================

#[test]
fn connectivity_errors_never_lock() {
    for error in [
        ResolveError::Dns("no such host".into()),
        ResolveError::Tls("handshake failure".into()),
        ResolveError::Timeout("deadline".into()),
    ] {
        let ws = Workspace::new();
        let host = Arc::new(StaticHost::new(PACKAGE, RELEASE_CERT.to_vec(), ws.bundle()));
        let orchestrator = ws.orchestrator(host, Arc::new(FailingResolver(error)));
        assert!(!orchestrator.start().locked);
        assert!(orchestrator.fetch_secret().is_ok());
        orchestrator.shutdown();
    }
}

#[test]
fn substituted_backend_locks() {
    let ws = Workspace::new();
    let host = Arc::new(StaticHost::new(PACKAGE, RELEASE_CERT.to_vec(), ws.bundle()));
    let orchestrator = ws.orchestrator(
        host,
        Arc::new(StaticOrigin("https://api.example.live.mirror.example/".into())),
    );
    let state = orchestrator.start();
    assert_eq!(state.reason, LockReason::BackendMismatch);
    assert!(orchestrator.certificate_pins().is_err());
    orchestrator.shutdown();
}

// =============================================================================
// Environment anomalies
// =============================================================================

#[test]
fn environment_anomalies_never_lock() {
    let ws = Workspace::new();
    let root = ws.scan_root();
    std::fs::create_dir_all(root.join("system/xbin")).unwrap();
    std::fs::write(root.join("system/xbin/su"), b"").unwrap();
    std::fs::create_dir_all(root.join("dev")).unwrap();
    std::fs::write(root.join("dev/qemu_pipe"), b"").unwrap();

    let host = Arc::new(
        StaticHost::new(PACKAGE, RELEASE_CERT.to_vec(), ws.bundle())
            .with_debugger(true)
            .with_stack_frames(vec!["de.robv.android.xposed.XposedBridge".into()]),
    );
    let orchestrator = ws.orchestrator(host, Arc::new(StaticOrigin(BACKEND.into())));

    assert!(!orchestrator.start().locked);
    let report = orchestrator.scan_environment();
    assert_eq!(report.anomalies().len(), 4);
    assert!(orchestrator.fetch_secret().is_ok());
    orchestrator.shutdown();
}
