//! Build-time identity baseline.
//!
//! The baseline is immutable once constructed. Every field is a validated
//! type, so there is no "unset" state that a check could mistake for a
//! development build.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checksum::CertificateDigest;
use crate::error::GuardError;
use crate::secret::SealedSecret;

/// Application package name, compared byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    /// Parse a package name. No normalisation is applied.
    pub fn parse(value: &str) -> Result<Self, GuardError> {
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(GuardError::Baseline {
                message: format!("invalid package name {value:?}"),
            });
        }
        Ok(Self(value.to_string()))
    }

    /// The package name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PackageName {
    type Error = GuardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PackageName> for String {
    fn from(value: PackageName) -> Self {
        value.0
    }
}

/// A `(scheme, host, port)` origin.
///
/// Parsed from a URL; path, query and user info are dropped, scheme and
/// host are lowercased, and the scheme's default port (443 for `https`, 80
/// for `http`) is folded into "no port". Any other port is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendOrigin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl BackendOrigin {
    /// Parse an origin from a URL such as `https://api.example.com/v1/`.
    pub fn parse(url: &str) -> Result<Self, GuardError> {
        let url = url.trim();
        let (scheme, rest) = url.split_once("://").ok_or_else(|| GuardError::Config {
            message: format!("origin {url:?} has no scheme"),
        })?;

        let authority = rest
            .split(|c| c == '/' || c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        let host_port = authority.rsplit('@').next().unwrap_or_default();
        let (host, port) = match host_port.strip_prefix('[') {
            // IPv6 literal
            Some(v6) => {
                let (host, after) = v6.split_once(']').unwrap_or((v6, ""));
                (host, after.strip_prefix(':'))
            },
            None => match host_port.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            },
        };

        if scheme.is_empty() || host.is_empty() {
            return Err(GuardError::Config {
                message: format!("origin {url:?} is incomplete"),
            });
        }

        let scheme = scheme.to_ascii_lowercase();
        let port = match port.filter(|p| !p.is_empty()) {
            Some(p) => Some(p.parse::<u16>().map_err(|_| GuardError::Config {
                message: format!("origin {url:?} has an invalid port"),
            })?),
            None => None,
        };
        let port = port.filter(|p| Some(*p) != default_port(&scheme));

        Ok(Self {
            host: host.trim_end_matches('.').to_ascii_lowercase(),
            scheme,
            port,
        })
    }

    /// URL scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit non-default port, if any.
    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "https" => Some(443),
        "http" => Some(80),
        _ => None,
    }
}

impl fmt::Display for BackendOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => write!(f, "{}://{}:{}/", self.scheme, host, port),
            None => write!(f, "{}://{}/", self.scheme, host),
        }
    }
}

/// Expected identity values fixed at build time.
#[derive(Debug, Clone)]
pub struct IdentityBaseline {
    package_name: PackageName,
    certificate_digest: CertificateDigest,
    backend_origin: BackendOrigin,
    native_checksum: Option<u64>,
    sealed_secret: Option<SealedSecret>,
    unlock_key: Option<[u8; 32]>,
    certificate_pins: Vec<String>,
}

impl IdentityBaseline {
    /// Create a baseline from the three mandatory values.
    pub fn new(
        package_name: PackageName,
        certificate_digest: CertificateDigest,
        backend_origin: BackendOrigin,
    ) -> Self {
        Self {
            package_name,
            certificate_digest,
            backend_origin,
            native_checksum: None,
            sealed_secret: None,
            unlock_key: None,
            certificate_pins: Vec::new(),
        }
    }

    /// Expected checksum reported by the native attestation module.
    pub fn with_native_checksum(mut self, checksum: u64) -> Self {
        self.native_checksum = Some(checksum);
        self
    }

    /// Secret sealed to the release certificate.
    pub fn with_sealed_secret(mut self, sealed: SealedSecret) -> Self {
        self.sealed_secret = Some(sealed);
        self
    }

    /// Ed25519 public key that signs administrative unlock grants.
    pub fn with_unlock_key(mut self, key: [u8; 32]) -> Self {
        self.unlock_key = Some(key);
        self
    }

    /// SPKI SHA-256 pins (base64) for the backend host.
    pub fn with_certificate_pins(mut self, pins: Vec<String>) -> Self {
        self.certificate_pins = pins;
        self
    }

    /// The baseline compiled in with the `embedded-baseline` feature.
    #[cfg(appguard_embedded_baseline)]
    pub fn embedded() -> Result<Self, GuardError> {
        let mut baseline = Self::new(
            PackageName::parse(env!("APPGUARD_PACKAGE_NAME"))?,
            CertificateDigest::parse(env!("APPGUARD_CERT_DIGEST"))?,
            BackendOrigin::parse(env!("APPGUARD_BACKEND_ORIGIN"))?,
        );

        let checksum = env!("APPGUARD_NATIVE_CHECKSUM");
        if !checksum.is_empty() {
            let value = checksum.parse::<u64>().map_err(|e| GuardError::Baseline {
                message: format!("native checksum: {e}"),
            })?;
            baseline = baseline.with_native_checksum(value);
        }

        let sealed = env!("APPGUARD_SEALED_SECRET");
        if !sealed.is_empty() {
            baseline = baseline.with_sealed_secret(SealedSecret::from_base64(sealed)?);
        }

        let unlock = env!("APPGUARD_UNLOCK_PUBKEY");
        if !unlock.is_empty() {
            let bytes = hex::decode(unlock).map_err(|e| GuardError::Baseline {
                message: format!("unlock key: {e}"),
            })?;
            let key: [u8; 32] = bytes.try_into().map_err(|_| GuardError::Baseline {
                message: "unlock key must be 32 bytes".into(),
            })?;
            baseline = baseline.with_unlock_key(key);
        }

        let pins = env!("APPGUARD_CERT_PINS");
        if !pins.is_empty() {
            baseline = baseline.with_certificate_pins(
                pins.split(',').map(|p| p.trim().to_string()).collect(),
            );
        }

        Ok(baseline)
    }

    /// Without the `embedded-baseline` feature there is nothing to load.
    #[cfg(not(appguard_embedded_baseline))]
    pub fn embedded() -> Result<Self, GuardError> {
        Err(GuardError::Baseline {
            message: "built without embedded-baseline; supply a baseline explicitly".into(),
        })
    }

    /// Expected package name.
    pub fn package_name(&self) -> &PackageName {
        &self.package_name
    }

    /// Expected signing-certificate digest.
    pub fn certificate_digest(&self) -> &CertificateDigest {
        &self.certificate_digest
    }

    /// The single allowed backend origin.
    pub fn backend_origin(&self) -> &BackendOrigin {
        &self.backend_origin
    }

    /// Expected native module checksum, if pinned at build time.
    pub fn native_checksum(&self) -> Option<u64> {
        self.native_checksum
    }

    /// Sealed secret for the high-level release path.
    pub fn sealed_secret(&self) -> Option<&SealedSecret> {
        self.sealed_secret.as_ref()
    }

    /// Unlock grant verification key.
    pub fn unlock_key(&self) -> Option<&[u8; 32]> {
        self.unlock_key.as_ref()
    }

    /// Backend certificate pins.
    pub fn certificate_pins(&self) -> &[String] {
        &self.certificate_pins
    }
}
