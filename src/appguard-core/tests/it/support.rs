//! Shared fixtures.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use appguard_core::{
    BackendOrigin, CertificateDigest, EnvironmentScanner, GuardConfig, GuardError, HostPlatform,
    IdentityBaseline, LockState, LockStateStore, MemoryLockStore, NativeAttestationBridge,
    NativeModule, OriginResolver, PackageName, ProtectedSecret, ResolveError, SealedSecret,
    SecurityContext, SecurityContextBuilder, SecurityOrchestrator, StaticOrigin,
};

pub const PACKAGE: &str = "com.example.tv";
pub const RELEASE_CERT: &[u8] = b"release-certificate";
pub const BACKEND: &str = "https://api.example.live/";
pub const SECRET: &[u8] = b"APP-KEY-7f3a";

/// Host whose identity can change while the process runs.
pub struct MutableHost {
    package: Mutex<String>,
    certificate: Mutex<Vec<u8>>,
    bundle: PathBuf,
    pub reads: AtomicUsize,
}

impl MutableHost {
    pub fn new(package: &str, certificate: &[u8], bundle: &Path) -> Self {
        Self {
            package: Mutex::new(package.into()),
            certificate: Mutex::new(certificate.to_vec()),
            bundle: bundle.to_path_buf(),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn set_package(&self, package: &str) {
        *self.package.lock().unwrap() = package.into();
    }

    pub fn set_certificate(&self, certificate: &[u8]) {
        *self.certificate.lock().unwrap() = certificate.to_vec();
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl HostPlatform for MutableHost {
    fn package_name(&self) -> Result<String, GuardError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.package.lock().unwrap().clone())
    }

    fn signing_certificate(&self) -> Result<Vec<u8>, GuardError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.certificate.lock().unwrap().clone())
    }

    fn bundle_path(&self) -> Result<PathBuf, GuardError> {
        Ok(self.bundle.clone())
    }
}

/// Genuine native module whose reported checksum can be changed.
pub struct AdjustableNative {
    checksum: Arc<AtomicU64>,
}

impl AdjustableNative {
    pub fn new(checksum: u64) -> (Self, Arc<AtomicU64>) {
        let shared = Arc::new(AtomicU64::new(checksum));
        (
            Self {
                checksum: shared.clone(),
            },
            shared,
        )
    }
}

impl NativeModule for AdjustableNative {
    fn verify_identity(&self, package_name: &str) -> Result<bool, GuardError> {
        Ok(package_name == PACKAGE)
    }

    fn verify_integrity(&self) -> Result<bool, GuardError> {
        Ok(true)
    }

    fn compute_checksum(&self) -> Result<u64, GuardError> {
        Ok(self.checksum.load(Ordering::SeqCst))
    }

    fn fetch_secret(
        &self,
        _package_name: &str,
        _digest: &CertificateDigest,
    ) -> Result<ProtectedSecret, GuardError> {
        Ok(ProtectedSecret::new(SECRET.to_vec()))
    }
}

/// Resolver that always fails with a fixed error.
pub struct FailingResolver(pub ResolveError);

impl OriginResolver for FailingResolver {
    fn resolve(&self) -> Result<String, ResolveError> {
        Err(self.0.clone())
    }
}

/// Resolver whose answer can change.
pub struct SwitchableResolver(pub Mutex<String>);

impl OriginResolver for SwitchableResolver {
    fn resolve(&self) -> Result<String, ResolveError> {
        Ok(self.0.lock().unwrap().clone())
    }
}

/// Store shared with the test so writes can be observed.
pub struct SharedStore(pub Arc<MemoryLockStore>);

impl LockStateStore for SharedStore {
    fn load(&self) -> Result<LockState, GuardError> {
        self.0.load()
    }

    fn store(&self, state: &LockState) -> Result<(), GuardError> {
        self.0.store(state)
    }
}

pub fn release_digest() -> CertificateDigest {
    CertificateDigest::of_certificate(RELEASE_CERT)
}

pub fn baseline() -> IdentityBaseline {
    IdentityBaseline::new(
        PackageName::parse(PACKAGE).unwrap(),
        release_digest(),
        BackendOrigin::parse(BACKEND).unwrap(),
    )
    .with_sealed_secret(SealedSecret::seal(SECRET, &release_digest()).unwrap())
}

/// Temp dir with a fake bundle and an empty scan root.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.apk"), b"installed bundle").unwrap();
        std::fs::create_dir_all(dir.path().join("root")).unwrap();
        Self { dir }
    }

    pub fn bundle(&self) -> PathBuf {
        self.dir.path().join("base.apk")
    }

    pub fn scan_root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn config(&self) -> GuardConfig {
        GuardConfig {
            state_dir: Some(self.state_dir()),
            installation_id: "tv-01".into(),
            ..GuardConfig::default()
        }
    }

    /// Orchestrator persisting to this workspace, native module absent.
    pub fn orchestrator(
        &self,
        host: Arc<dyn HostPlatform>,
        resolver: Arc<dyn OriginResolver>,
    ) -> SecurityOrchestrator {
        self.orchestrator_with(host, resolver, NativeAttestationBridge::absent("not configured"))
    }

    pub fn orchestrator_with(
        &self,
        host: Arc<dyn HostPlatform>,
        resolver: Arc<dyn OriginResolver>,
        native: NativeAttestationBridge,
    ) -> SecurityOrchestrator {
        let context = SecurityContext::builder(self.config(), baseline(), host, resolver)
            .native(native)
            .scanner(EnvironmentScanner::with_root(self.scan_root()))
            .build()
            .unwrap();
        SecurityOrchestrator::new(context)
    }

    /// Context builder persisting to this workspace, scanning the empty root.
    pub fn context_builder(
        &self,
        config: GuardConfig,
        host: Arc<dyn HostPlatform>,
    ) -> SecurityContextBuilder {
        SecurityContext::builder(config, baseline(), host, Arc::new(StaticOrigin(BACKEND.into())))
            .scanner(EnvironmentScanner::with_root(self.scan_root()))
    }

    /// Orchestrator with a caller-supplied config and baseline.
    pub fn orchestrator_from(
        &self,
        config: GuardConfig,
        baseline: IdentityBaseline,
        host: Arc<dyn HostPlatform>,
    ) -> SecurityOrchestrator {
        let resolver = Arc::new(StaticOrigin(BACKEND.into()));
        let context = SecurityContext::builder(config, baseline, host, resolver)
            .native(NativeAttestationBridge::absent("not configured"))
            .scanner(EnvironmentScanner::with_root(self.scan_root()))
            .build()
            .unwrap();
        SecurityOrchestrator::new(context)
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Create a named pipe at `path`. Opening it for reading blocks until a
/// writer appears, which stands in for storage that never answers.
#[cfg(unix)]
pub fn make_fifo(path: &Path) {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
}

/// Unblock readers stuck opening the pipe at `path`.
#[cfg(unix)]
pub fn release_fifo(path: &Path) {
    use std::os::unix::fs::OpenOptionsExt;

    let _ = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path);
}
