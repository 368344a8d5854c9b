//! Package and signing-certificate verification.
//!
//! Both checks are exact comparisons against the baseline. There is no
//! development-mode pass: a baseline cannot hold a placeholder digest.

use tracing::{debug, error};

use crate::baseline::IdentityBaseline;
use crate::checksum::CertificateDigest;
use crate::error::GuardError;
use crate::host::{HostPlatform, RuntimeSnapshot};

/// Compares runtime identity against the baseline.
#[derive(Debug, Clone)]
pub struct IdentityVerifier {
    baseline: IdentityBaseline,
}

impl IdentityVerifier {
    /// Verifier for `baseline`.
    pub fn new(baseline: IdentityBaseline) -> Self {
        Self { baseline }
    }

    /// Baseline in use.
    pub fn baseline(&self) -> &IdentityBaseline {
        &self.baseline
    }

    /// Exact byte equality, no normalisation.
    pub fn verify_package_identity(&self, current: &str) -> Result<(), GuardError> {
        if current == self.baseline.package_name().as_str() {
            debug!(package = current, "Package identity verified");
            Ok(())
        } else {
            error!(
                expected = %self.baseline.package_name(),
                actual = current,
                "Package identity mismatch"
            );
            Err(GuardError::PackageMismatch)
        }
    }

    /// Digest the raw certificate and compare.
    pub fn verify_signing_certificate(&self, current: &[u8]) -> Result<(), GuardError> {
        self.verify_certificate_digest(&CertificateDigest::of_certificate(current))
    }

    /// Compare an already computed digest.
    pub fn verify_certificate_digest(&self, current: &CertificateDigest) -> Result<(), GuardError> {
        if self.baseline.certificate_digest().matches(current) {
            debug!(digest = current.short(), "Signing certificate verified");
            Ok(())
        } else {
            error!(
                expected = self.baseline.certificate_digest().short(),
                actual = current.short(),
                "Signing certificate mismatch"
            );
            Err(GuardError::SignatureMismatch)
        }
    }

    /// Check a snapshot. Missing values count as mismatches.
    pub fn verify_snapshot(&self, snapshot: &RuntimeSnapshot) -> Result<(), GuardError> {
        match snapshot.package_name.as_deref() {
            Some(package) => self.verify_package_identity(package)?,
            None => {
                error!("Package name unavailable");
                return Err(GuardError::PackageMismatch);
            },
        }
        match &snapshot.certificate_digest {
            Some(digest) => self.verify_certificate_digest(digest),
            None => {
                error!("Signing certificate unavailable");
                Err(GuardError::SignatureMismatch)
            },
        }
    }

    /// Read identity from the host and check it.
    pub fn verify_host(&self, host: &dyn HostPlatform) -> Result<RuntimeSnapshot, GuardError> {
        let snapshot = RuntimeSnapshot::capture_identity(host);
        self.verify_snapshot(&snapshot)?;
        Ok(snapshot)
    }
}
