//! Host platform inputs.
//!
//! The host supplies the runtime identity of the installed bundle: its
//! package name, the raw signing certificate and a path to the installed
//! binary. Everything else in the crate derives from these.

use std::path::PathBuf;

use crate::checksum::CertificateDigest;
use crate::error::GuardError;

/// Runtime identity source.
pub trait HostPlatform: Send + Sync {
    /// Package name of the running installation.
    fn package_name(&self) -> Result<String, GuardError>;

    /// Raw bytes of the signing certificate.
    fn signing_certificate(&self) -> Result<Vec<u8>, GuardError>;

    /// Path of the installed binary bundle.
    fn bundle_path(&self) -> Result<PathBuf, GuardError>;

    /// Whether a managed-runtime debugger is connected.
    fn debugger_connected(&self) -> bool {
        false
    }

    /// Whether the installation is marked debuggable.
    fn is_debuggable(&self) -> bool {
        false
    }

    /// Class or symbol names on the current call stack.
    fn stack_frames(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Host whose values are fixed when constructed.
#[derive(Debug, Clone)]
pub struct StaticHost {
    package_name: String,
    certificate: Vec<u8>,
    bundle_path: PathBuf,
    debugger_connected: bool,
    debuggable: bool,
    stack_frames: Vec<String>,
}

impl StaticHost {
    /// Create a host from its identity inputs.
    pub fn new(
        package_name: impl Into<String>,
        certificate: Vec<u8>,
        bundle_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            certificate,
            bundle_path: bundle_path.into(),
            debugger_connected: false,
            debuggable: false,
            stack_frames: Vec::new(),
        }
    }

    /// Report a connected debugger.
    pub fn with_debugger(mut self, connected: bool) -> Self {
        self.debugger_connected = connected;
        self
    }

    /// Report the debuggable flag.
    pub fn with_debuggable(mut self, debuggable: bool) -> Self {
        self.debuggable = debuggable;
        self
    }

    /// Report stack frame names.
    pub fn with_stack_frames(mut self, frames: Vec<String>) -> Self {
        self.stack_frames = frames;
        self
    }
}

impl HostPlatform for StaticHost {
    fn package_name(&self) -> Result<String, GuardError> {
        Ok(self.package_name.clone())
    }

    fn signing_certificate(&self) -> Result<Vec<u8>, GuardError> {
        if self.certificate.is_empty() {
            return Err(GuardError::Host {
                message: "no signing certificate".into(),
            });
        }
        Ok(self.certificate.clone())
    }

    fn bundle_path(&self) -> Result<PathBuf, GuardError> {
        Ok(self.bundle_path.clone())
    }

    fn debugger_connected(&self) -> bool {
        self.debugger_connected
    }

    fn is_debuggable(&self) -> bool {
        self.debuggable
    }

    fn stack_frames(&self) -> Vec<String> {
        self.stack_frames.clone()
    }
}

/// Runtime identity gathered by one check. Discarded after comparison.
///
/// Bundle and native checksums are compared inside the tamper monitor's
/// tick and the backend origin inside the binding verifier, so neither is
/// carried here.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSnapshot {
    /// Current package name.
    pub package_name: Option<String>,
    /// Current certificate digest.
    pub certificate_digest: Option<CertificateDigest>,
}

impl RuntimeSnapshot {
    /// Read package name and certificate digest from the host.
    ///
    /// Fields the host cannot supply stay `None`; comparing `None` against
    /// a baseline is a mismatch.
    pub fn capture_identity(host: &dyn HostPlatform) -> Self {
        let package_name = host.package_name().ok();
        let certificate_digest = host
            .signing_certificate()
            .ok()
            .map(|cert| CertificateDigest::of_certificate(&cert));
        Self {
            package_name,
            certificate_digest,
        }
    }
}
