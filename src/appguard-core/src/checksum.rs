//! Deterministic digests over installed artifacts.
//!
//! All functions here are read-only and safe to call from any thread. They
//! are I/O and CPU bound, so callers keep them off UI threads; the tamper
//! monitor runs them on the blocking pool under a time budget.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GuardError;
use crate::security::constant_time_eq;

/// Read buffer size for streaming digests.
const CHUNK_SIZE: usize = 8192;

/// Base64 (standard alphabet) SHA-256 digest of a signing certificate.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CertificateDigest(String);

impl CertificateDigest {
    /// Parse a digest string: standard base64 of exactly 32 bytes.
    ///
    /// The classic `REPLACE_WITH_...` placeholder and any other value that
    /// is not a SHA-256 digest cannot be represented.
    pub fn parse(value: &str) -> Result<Self, GuardError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(GuardError::Baseline {
                message: "certificate digest is empty".into(),
            });
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|e| GuardError::Baseline {
                message: format!("certificate digest is not base64: {e}"),
            })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| GuardError::Baseline {
            message: format!("certificate digest must be 32 bytes, got {}", b.len()),
        })?;
        Ok(Self(base64::engine::general_purpose::STANDARD.encode(bytes)))
    }

    /// Digest the raw bytes of a signing certificate.
    pub fn of_certificate(certificate: &[u8]) -> Self {
        let hash = Sha256::digest(certificate);
        Self(base64::engine::general_purpose::STANDARD.encode(hash))
    }

    /// The digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against another digest.
    pub fn matches(&self, other: &CertificateDigest) -> bool {
        constant_time_eq(self.0.as_bytes(), other.0.as_bytes())
    }

    /// Shortened form for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl fmt::Debug for CertificateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateDigest({}…)", self.short())
    }
}

impl fmt::Display for CertificateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CertificateDigest {
    type Error = GuardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CertificateDigest> for String {
    fn from(value: CertificateDigest) -> Self {
        value.0
    }
}

/// SHA-256 over a full installed artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleChecksum([u8; 32]);

impl BundleChecksum {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &BundleChecksum) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for BundleChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleChecksum({}…)", &self.to_hex()[..16])
    }
}

impl fmt::Display for BundleChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Computes digests over byte streams.
#[derive(Debug, Clone)]
pub struct ChecksumEngine {
    timeout: Duration,
}

impl ChecksumEngine {
    /// Create an engine with the given time budget for bounded computations.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Time budget for [`ChecksumEngine::digest_file_bounded`].
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stream a reader through SHA-256.
    pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<BundleChecksum> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(BundleChecksum(hasher.finalize().into()))
    }

    /// Digest an in-memory buffer.
    pub fn digest_bytes(data: &[u8]) -> BundleChecksum {
        BundleChecksum(Sha256::digest(data).into())
    }

    /// Digest a file on disk.
    pub fn digest_file(path: &Path) -> Result<BundleChecksum, GuardError> {
        let file = std::fs::File::open(path)?;
        Ok(Self::digest_reader(std::io::BufReader::new(file))?)
    }

    /// Digest a file on the blocking pool, bounded by the engine's timeout.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn digest_file_bounded(&self, path: PathBuf) -> Result<BundleChecksum, GuardError> {
        let task = tokio::task::spawn_blocking(move || Self::digest_file(&path));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(GuardError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("checksum task failed: {join}"),
            ))),
            Err(_) => Err(GuardError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
