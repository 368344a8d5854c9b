//! Lock persistence, runtime monitoring and unlock grants.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use appguard_core::{
    FileLockStore, GuardConfig, GuardError, LockReason, LockStateStore, NativeAttestationBridge,
    ResponseStrategy, SecurityOrchestrator, StaticOrigin, UnlockGrant,
};
use ed25519_dalek::{Signer, SigningKey};

use crate::support::{
    baseline, wait_for, AdjustableNative, MutableHost, Workspace, BACKEND, PACKAGE, RELEASE_CERT,
    SECRET,
};

const DETECTION_DEADLINE: Duration = Duration::from_secs(5);

fn fast_config(ws: &Workspace) -> GuardConfig {
    GuardConfig {
        monitor_interval: Duration::from_millis(50),
        revalidation_ttl: Duration::from_secs(3600),
        ..ws.config()
    }
}

// =============================================================================
// Persistence across restarts
// =============================================================================

#[test]
fn lock_survives_restart() {
    let ws = Workspace::new();

    {
        let host = Arc::new(MutableHost::new("com.example.tv.clone", RELEASE_CERT, &ws.bundle()));
        let orchestrator = ws.orchestrator(host, Arc::new(StaticOrigin(BACKEND.into())));
        let state = orchestrator.start();
        assert_eq!(state.reason, LockReason::PackageMismatch);
    }

    // The attacker restores the genuine identity; the lock stays.
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator(host.clone(), Arc::new(StaticOrigin(BACKEND.into())));
    let state = orchestrator.start();
    assert!(state.locked);
    assert_eq!(state.reason, LockReason::PackageMismatch);
    assert!(orchestrator.fetch_secret().is_err());
    assert_eq!(host.read_count(), 0);
}

#[test]
fn corrupt_lock_record_is_treated_as_locked() {
    let ws = Workspace::new();
    let store = FileLockStore::new(&ws.state_dir(), "tv-01");
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(store.path(), b"definitely not ciphertext").unwrap();

    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator(host, Arc::new(StaticOrigin(BACKEND.into())));
    let state = orchestrator.start();
    assert!(state.locked);
    assert_eq!(state.reason, LockReason::Unknown);

    // The fail-closed record replaces the corrupt one, so the lock keeps
    // one timestamp across restarts.
    assert_eq!(store.load().unwrap(), state);
    drop(orchestrator);
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let restarted = ws.orchestrator(host, Arc::new(StaticOrigin(BACKEND.into())));
    assert_eq!(restarted.start(), state);
}

#[test]
fn lock_record_is_bound_to_installation() {
    let ws = Workspace::new();
    let host = Arc::new(MutableHost::new(PACKAGE, b"resigned", &ws.bundle()));
    let orchestrator = ws.orchestrator(host, Arc::new(StaticOrigin(BACKEND.into())));
    assert!(orchestrator.start().locked);

    assert!(FileLockStore::new(&ws.state_dir(), "tv-01").load().unwrap().locked);
    // A record sealed for another installation does not decrypt.
    assert!(FileLockStore::new(&ws.state_dir(), "tv-02").load().is_err());
}

// =============================================================================
// Runtime monitoring
// =============================================================================

#[test]
fn monitor_locks_when_bundle_is_overwritten() {
    let ws = Workspace::new();
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator_from(fast_config(&ws), baseline(), host);

    assert!(!orchestrator.start().locked);
    assert!(orchestrator.monitor_running());
    std::thread::sleep(Duration::from_millis(300));

    std::fs::write(ws.bundle(), b"patched bundle with hooks").unwrap();

    assert!(wait_for(DETECTION_DEADLINE, || orchestrator.is_locked()));
    assert_eq!(orchestrator.lock_reason(), LockReason::CodeTampering);
    assert!(matches!(
        orchestrator.fetch_secret(),
        Err(GuardError::Locked {
            reason: LockReason::CodeTampering
        })
    ));
    assert!(wait_for(DETECTION_DEADLINE, || !orchestrator.monitor_running()));

    let persisted = FileLockStore::new(&ws.state_dir(), "tv-01").load().unwrap();
    assert_eq!(persisted.reason, LockReason::CodeTampering);
}

#[test]
fn monitor_locks_when_certificate_changes() {
    let ws = Workspace::new();
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator_from(fast_config(&ws), baseline(), host.clone());

    assert!(!orchestrator.start().locked);
    host.set_certificate(b"attacker-certificate");

    assert!(wait_for(DETECTION_DEADLINE, || orchestrator.is_locked()));
    assert_eq!(orchestrator.lock_reason(), LockReason::SignatureMismatch);
    orchestrator.shutdown();
}

#[test]
fn monitor_locks_when_native_checksum_drifts() {
    let ws = Workspace::new();
    let (module, checksum) = AdjustableNative::new(0x5eed);
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let context = ws
        .context_builder(fast_config(&ws), host)
        .native(NativeAttestationBridge::with_module(Box::new(module), None))
        .build()
        .unwrap();
    let orchestrator = SecurityOrchestrator::new(context);

    assert!(!orchestrator.start().locked);
    assert_eq!(orchestrator.fetch_secret().unwrap().expose(), SECRET);
    std::thread::sleep(Duration::from_millis(300));
    assert!(!orchestrator.is_locked());

    checksum.store(0xbad, Ordering::SeqCst);

    assert!(wait_for(DETECTION_DEADLINE, || orchestrator.is_locked()));
    assert_eq!(orchestrator.lock_reason(), LockReason::CodeTampering);
    assert!(wait_for(DETECTION_DEADLINE, || !orchestrator.monitor_running()));
    assert!(orchestrator.fetch_secret().is_err());
    let persisted = FileLockStore::new(&ws.state_dir(), "tv-01").load().unwrap();
    assert_eq!(persisted.reason, LockReason::CodeTampering);
}

#[cfg(unix)]
#[test]
fn stalled_bundle_reads_escalate_to_a_lock() {
    use crate::support::{make_fifo, release_fifo};

    let ws = Workspace::new();
    let config = GuardConfig {
        checksum_timeout: Duration::from_millis(100),
        max_checksum_timeouts: 2,
        ..fast_config(&ws)
    };
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator_from(config, baseline(), host);

    assert!(!orchestrator.start().locked);
    std::thread::sleep(Duration::from_millis(300));
    assert!(!orchestrator.is_locked());

    // Replace the bundle with storage that never answers.
    std::fs::remove_file(ws.bundle()).unwrap();
    make_fifo(&ws.bundle());

    assert!(wait_for(DETECTION_DEADLINE, || orchestrator.is_locked()));
    assert_eq!(orchestrator.lock_reason(), LockReason::CodeTampering);
    assert!(wait_for(DETECTION_DEADLINE, || !orchestrator.monitor_running()));

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        orchestrator.shutdown();
        let _ = tx.send(());
    });
    let returned = rx.recv_timeout(DETECTION_DEADLINE).is_ok();
    release_fifo(&ws.bundle());
    assert!(returned, "shutdown waited on a stalled bundle read");
}

#[cfg(unix)]
#[test]
fn shutdown_does_not_wait_for_a_stalled_bundle_read() {
    use crate::support::{make_fifo, release_fifo};

    let ws = Workspace::new();
    let stalled = ws.dir.path().join("stalled.apk");
    make_fifo(&stalled);
    let config = GuardConfig {
        checksum_timeout: Duration::from_millis(200),
        ..fast_config(&ws)
    };
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &stalled));
    let orchestrator = ws.orchestrator_from(config, baseline(), host);

    assert!(!orchestrator.start().locked);
    assert!(orchestrator.monitor_running());
    // Past the checksum timeout; the read itself is still blocked.
    std::thread::sleep(Duration::from_millis(400));

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        orchestrator.shutdown();
        let _ = tx.send(orchestrator.monitor_running());
    });
    let outcome = rx.recv_timeout(DETECTION_DEADLINE);
    release_fifo(&stalled);
    assert_eq!(outcome, Ok(false), "shutdown waited on a stalled bundle read");
}

#[test]
fn monitor_violation_applies_terminate_strategy() {
    let ws = Workspace::new();
    let config = GuardConfig {
        response: ResponseStrategy::Terminate,
        ..fast_config(&ws)
    };
    let terminations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));
    let state_dir = ws.state_dir();

    let counter = terminations.clone();
    let reasons = seen.clone();
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let context = ws
        .context_builder(config, host.clone())
        .native(NativeAttestationBridge::absent("not configured"))
        .terminator(Arc::new(move |reason: LockReason| {
            // The lock is on disk before the process would exit.
            let persisted = FileLockStore::new(&state_dir, "tv-01").load();
            *reasons.lock().unwrap() = Some((reason, persisted.map(|s| s.locked).ok()));
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .unwrap();
    let orchestrator = SecurityOrchestrator::new(context);

    assert!(!orchestrator.start().locked);
    assert_eq!(terminations.load(Ordering::SeqCst), 0);

    host.set_certificate(b"attacker-certificate");

    assert!(wait_for(DETECTION_DEADLINE, || terminations.load(Ordering::SeqCst) == 1));
    assert_eq!(
        *seen.lock().unwrap(),
        Some((LockReason::SignatureMismatch, Some(true)))
    );
    assert!(orchestrator.is_locked());
    orchestrator.shutdown();
    assert_eq!(terminations.load(Ordering::SeqCst), 1);
}

#[test]
fn secret_request_revalidates_identity() {
    let ws = Workspace::new();
    let config = GuardConfig {
        revalidation_ttl: Duration::ZERO,
        ..ws.config()
    };
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator_from(config, baseline(), host.clone());

    assert!(!orchestrator.start().locked);
    assert!(orchestrator.fetch_secret().is_ok());

    host.set_package("com.example.tv.clone");
    assert!(matches!(
        orchestrator.fetch_secret(),
        Err(GuardError::Locked {
            reason: LockReason::PackageMismatch
        })
    ));
    orchestrator.shutdown();
}

// =============================================================================
// Monotonic lock
// =============================================================================

#[test]
fn first_lock_reason_is_kept() {
    let ws = Workspace::new();
    let host = Arc::new(MutableHost::new(PACKAGE, b"resigned", &ws.bundle()));
    let orchestrator = ws.orchestrator(host.clone(), Arc::new(StaticOrigin(BACKEND.into())));

    assert_eq!(orchestrator.start().reason, LockReason::SignatureMismatch);
    let first = orchestrator.lock_state();

    host.set_package("com.example.tv.clone");
    host.set_certificate(RELEASE_CERT);
    assert!(matches!(orchestrator.verify_now(), Err(GuardError::Locked { .. })));
    assert_eq!(orchestrator.lock_state(), first);
    assert!(orchestrator.technical_details().contains("Reason Code: 2"));
}

// =============================================================================
// Unlock grants
// =============================================================================

#[test]
fn signed_grant_clears_the_lock() {
    let ws = Workspace::new();
    let signing = SigningKey::from_bytes(&[7u8; 32]);
    let baseline = baseline().with_unlock_key(signing.verifying_key().to_bytes());
    let host = Arc::new(MutableHost::new(PACKAGE, b"resigned", &ws.bundle()));
    let orchestrator = ws.orchestrator_from(ws.config(), baseline, host.clone());

    let locked = orchestrator.start();
    assert!(locked.locked);

    let forged = UnlockGrant {
        signature: [0u8; 64],
    };
    assert!(matches!(
        orchestrator.reset(&forged),
        Err(GuardError::UnlockRejected { .. })
    ));
    assert!(orchestrator.is_locked());

    let message = UnlockGrant::message("tv-01", locked.timestamp);
    let grant = UnlockGrant {
        signature: signing.sign(&message).to_bytes(),
    };
    orchestrator.reset(&grant).unwrap();
    assert!(!orchestrator.is_locked());
    assert!(!FileLockStore::new(&ws.state_dir(), "tv-01").load().unwrap().locked);

    host.set_certificate(RELEASE_CERT);
    assert!(!orchestrator.start().locked);
    assert!(orchestrator.fetch_secret().is_ok());
    orchestrator.shutdown();
}

#[test]
fn monitoring_resumes_after_grant_and_restart() {
    let ws = Workspace::new();
    let signing = SigningKey::from_bytes(&[7u8; 32]);
    let baseline = baseline().with_unlock_key(signing.verifying_key().to_bytes());
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator_from(fast_config(&ws), baseline, host.clone());

    assert!(!orchestrator.start().locked);
    host.set_certificate(b"attacker-certificate");
    assert!(wait_for(DETECTION_DEADLINE, || orchestrator.is_locked()));
    assert!(wait_for(DETECTION_DEADLINE, || !orchestrator.monitor_running()));

    host.set_certificate(RELEASE_CERT);
    let locked_at = orchestrator.lock_state().timestamp;
    let grant = UnlockGrant {
        signature: signing
            .sign(&UnlockGrant::message("tv-01", locked_at))
            .to_bytes(),
    };
    orchestrator.reset(&grant).unwrap();
    assert!(!orchestrator.start().locked);
    assert!(orchestrator.monitor_running());

    // The new monitor still detects tampering.
    host.set_certificate(b"attacker-certificate");
    assert!(wait_for(DETECTION_DEADLINE, || orchestrator.is_locked()));
    assert_eq!(orchestrator.lock_reason(), LockReason::SignatureMismatch);
    orchestrator.shutdown();
}

#[test]
fn grant_without_unlock_key_is_rejected() {
    let ws = Workspace::new();
    let host = Arc::new(MutableHost::new(PACKAGE, b"resigned", &ws.bundle()));
    let orchestrator = ws.orchestrator(host, Arc::new(StaticOrigin(BACKEND.into())));
    assert!(orchestrator.start().locked);

    let grant = UnlockGrant {
        signature: [1u8; 64],
    };
    assert!(orchestrator.reset(&grant).is_err());
    assert!(orchestrator.is_locked());
}

// =============================================================================
// Certificate pins and configuration
// =============================================================================

#[test]
fn certificate_pins_follow_lock_state() {
    let ws = Workspace::new();
    let pins = vec!["sha256/AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()];
    let baseline = baseline().with_certificate_pins(pins.clone());
    let host = Arc::new(MutableHost::new(PACKAGE, RELEASE_CERT, &ws.bundle()));
    let orchestrator = ws.orchestrator_from(ws.config(), baseline, host);

    assert!(!orchestrator.start().locked);
    assert_eq!(orchestrator.certificate_pins().unwrap(), pins);
    orchestrator.shutdown();
}

#[test]
fn config_file_fills_missing_fields_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("appguard.json");
    std::fs::write(
        &path,
        r#"{ "installation_id": "tv-42", "response": "terminate", "monitor_interval": 15 }"#,
    )
    .unwrap();

    let config = GuardConfig::from_json_file(&path).unwrap();
    assert_eq!(config.installation_id, "tv-42");
    assert_eq!(config.monitor_interval, Duration::from_secs(15));
    assert_eq!(config.checksum_timeout, Duration::from_secs(30));
    assert_eq!(config.max_checksum_timeouts, 3);
    assert_eq!(config.response, appguard_core::ResponseStrategy::Terminate);
}

#[test]
fn config_file_with_zero_interval_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("appguard.json");
    std::fs::write(&path, r#"{ "monitor_interval": 0 }"#).unwrap();
    assert!(matches!(
        GuardConfig::from_json_file(&path),
        Err(GuardError::Config { .. })
    ));
}
