//! Property-based tests for the enforcement invariants.

use std::sync::Arc;

use proptest::prelude::*;

use appguard_core::{
    BackendBindingVerifier, BackendOrigin, CertificateDigest, ChecksumEngine, GuardError,
    LockController, LockReason, MemoryLockStore, NativeAttestationBridge, NativeModule,
    ProtectedSecret, StaticHost, StaticOrigin,
};

use crate::support::{SharedStore, Workspace, BACKEND, PACKAGE, RELEASE_CERT, SECRET};

/// Native module that is genuine or not as a whole.
struct FakeNative {
    genuine: bool,
}

impl NativeModule for FakeNative {
    fn verify_identity(&self, package_name: &str) -> Result<bool, GuardError> {
        Ok(self.genuine && package_name == PACKAGE)
    }

    fn verify_integrity(&self) -> Result<bool, GuardError> {
        Ok(self.genuine)
    }

    fn compute_checksum(&self) -> Result<u64, GuardError> {
        Ok(0x5eed)
    }

    fn fetch_secret(
        &self,
        _package_name: &str,
        _digest: &CertificateDigest,
    ) -> Result<ProtectedSecret, GuardError> {
        Ok(ProtectedSecret::new(SECRET.to_vec()))
    }
}

fn lock_reason() -> impl Strategy<Value = LockReason> {
    prop_oneof![
        Just(LockReason::None),
        Just(LockReason::PackageMismatch),
        Just(LockReason::SignatureMismatch),
        Just(LockReason::CodeTampering),
        Just(LockReason::BackendMismatch),
        Just(LockReason::Unknown),
    ]
}

/// `None` means the module is not installed.
fn native_state() -> impl Strategy<Value = Option<bool>> {
    prop_oneof![Just(None), Just(Some(true)), Just(Some(false))]
}

proptest! {
    // Every case spins up a monitor thread; keep the count low.
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    // ========================================================================
    // Checksums
    // ========================================================================

    /// The same bytes always hash to the same checksum, by any route.
    #[test]
    fn checksum_is_deterministic(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let direct = ChecksumEngine::digest_bytes(&data);
        let streamed = ChecksumEngine::digest_reader(data.as_slice()).unwrap();
        prop_assert!(direct.matches(&streamed));
        prop_assert_eq!(direct.to_hex(), ChecksumEngine::digest_bytes(&data).to_hex());
    }

    /// Flipping any byte changes the checksum.
    #[test]
    fn checksum_detects_single_byte_change(
        data in prop::collection::vec(any::<u8>(), 1..1024),
        pos in 0usize..1024,
        delta in 1u8..=255
    ) {
        let pos = pos % data.len();
        let mut patched = data.clone();
        patched[pos] = patched[pos].wrapping_add(delta);
        prop_assert!(!ChecksumEngine::digest_bytes(&data)
            .matches(&ChecksumEngine::digest_bytes(&patched)));
    }

    /// Distinct certificates never share a digest.
    #[test]
    fn certificate_digest_separates_certificates(
        a in prop::collection::vec(any::<u8>(), 1..256),
        b in prop::collection::vec(any::<u8>(), 1..256)
    ) {
        let same = CertificateDigest::of_certificate(&a)
            .matches(&CertificateDigest::of_certificate(&b));
        prop_assert_eq!(same, a == b);
    }

    // ========================================================================
    // Lock state
    // ========================================================================

    /// The first lock wins; later requests change nothing and write nothing.
    #[test]
    fn lock_is_monotonic(reasons in prop::collection::vec(lock_reason(), 1..12)) {
        let store = Arc::new(MemoryLockStore::new());
        let controller = LockController::new(Box::new(SharedStore(store.clone())), "tv-01", None);

        let first = controller.lock(reasons[0]);
        for reason in &reasons[1..] {
            let state = controller.lock(*reason);
            prop_assert_eq!(state, first);
        }

        let expected = if reasons[0] == LockReason::None {
            LockReason::Unknown
        } else {
            reasons[0]
        };
        prop_assert!(controller.is_locked());
        prop_assert_eq!(controller.current().reason, expected);
        prop_assert_eq!(store.write_count(), 1);
    }

    // ========================================================================
    // Secret release
    // ========================================================================

    /// The secret is released only when every identity input is genuine.
    #[test]
    fn secret_release_is_fail_closed(
        package_ok in any::<bool>(),
        certificate_ok in any::<bool>(),
        native in native_state()
    ) {
        let ws = Workspace::new();
        let package = if package_ok { PACKAGE } else { "com.example.tv.clone" };
        let certificate: &[u8] = if certificate_ok { RELEASE_CERT } else { b"resigned" };
        let host = Arc::new(StaticHost::new(package, certificate.to_vec(), ws.bundle()));
        let bridge = match native {
            None => NativeAttestationBridge::absent("not installed"),
            Some(genuine) => {
                NativeAttestationBridge::with_module(Box::new(FakeNative { genuine }), None)
            },
        };
        let orchestrator =
            ws.orchestrator_with(host, Arc::new(StaticOrigin(BACKEND.into())), bridge);

        let genuine = package_ok && certificate_ok && native.unwrap_or(true);
        let state = orchestrator.start();
        let secret = orchestrator.fetch_secret();
        orchestrator.shutdown();

        prop_assert_eq!(state.locked, !genuine);
        prop_assert_eq!(secret.is_ok(), genuine);
        if let Ok(secret) = secret {
            prop_assert_eq!(secret.expose(), SECRET);
        }
    }

    /// Repeated verification of a genuine install never locks it.
    #[test]
    fn verification_is_idempotent(rounds in 1usize..6) {
        let ws = Workspace::new();
        let host = Arc::new(StaticHost::new(PACKAGE, RELEASE_CERT.to_vec(), ws.bundle()));
        let orchestrator = ws.orchestrator(host, Arc::new(StaticOrigin(BACKEND.into())));

        prop_assert!(!orchestrator.start().locked);
        for _ in 0..rounds {
            prop_assert!(orchestrator.verify_now().is_ok());
            prop_assert!(orchestrator.fetch_secret().is_ok());
        }
        prop_assert!(!orchestrator.is_locked());
        orchestrator.shutdown();
    }

    // ========================================================================
    // Backend origin
    // ========================================================================

    /// Case, the default port, path and query never change the origin.
    #[test]
    fn origin_ignores_case_default_port_and_path(
        upper in any::<bool>(),
        explicit_port in any::<bool>(),
        path in "[a-z0-9/]{0,16}",
        query in prop::option::of("[a-z0-9=&]{1,12}")
    ) {
        let host = if upper { "API.Example.LIVE" } else { "api.example.live" };
        let mut url = format!("https://{host}");
        if explicit_port {
            url.push_str(":443");
        }
        url.push('/');
        url.push_str(&path);
        if let Some(query) = query {
            url.push('?');
            url.push_str(&query);
        }

        let verifier = BackendBindingVerifier::new(BackendOrigin::parse(BACKEND).unwrap());
        prop_assert!(verifier.is_official_backend(&url), "{}", url);
    }

    /// Any non-default port is a different backend.
    #[test]
    fn origin_rejects_other_ports(port in 1u16..=u16::MAX) {
        prop_assume!(port != 443);
        let verifier = BackendBindingVerifier::new(BackendOrigin::parse(BACKEND).unwrap());
        let url = format!("https://api.example.live:{port}/");
        prop_assert!(!verifier.is_official_backend(&url), "{}", url);
    }

    /// Any other host label is a different backend.
    #[test]
    fn origin_rejects_other_hosts(label in "[a-z]{1,12}") {
        prop_assume!(label != "api");
        let verifier = BackendBindingVerifier::new(BackendOrigin::parse(BACKEND).unwrap());
        let url = format!("https://{label}.example.live/");
        prop_assert!(!verifier.is_official_backend(&url));
        prop_assert!(verifier.verify_origin(&url).is_err());
    }
}
