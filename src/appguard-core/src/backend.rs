//! Backend origin binding.
//!
//! The resolved service origin must equal the single allowed
//! `(scheme, host)` pair from the baseline. Resolution failures (DNS, TLS,
//! timeout, refused connection) are treated as a pass: flaky networks must
//! not lock a genuine installation. A resolved origin that differs is a
//! HARD violation.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::baseline::BackendOrigin;
use crate::error::GuardError;

/// Why the origin could not be resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Name resolution failed.
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    /// TLS handshake or certificate failure.
    #[error("TLS failure: {0}")]
    Tls(String),
    /// Request timed out.
    #[error("Timed out: {0}")]
    Timeout(String),
    /// Connection refused or reset.
    #[error("Connection failed: {0}")]
    Connect(String),
    /// Anything else on the transport.
    #[error("Transport error: {0}")]
    Other(String),
}

/// Supplies the origin the network client actually talks to.
pub trait OriginResolver: Send + Sync {
    /// Resolved origin URL.
    fn resolve(&self) -> Result<String, ResolveError>;
}

/// Origin handed over by a configuration collaborator.
#[derive(Debug, Clone)]
pub struct StaticOrigin(pub String);

impl OriginResolver for StaticOrigin {
    fn resolve(&self) -> Result<String, ResolveError> {
        Ok(self.0.clone())
    }
}

/// Follows redirects from a configured URL and reports the final URL.
pub struct RedirectProbe {
    url: String,
    agent: ureq::Agent,
}

impl RedirectProbe {
    /// Probe `url` with the given read timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(timeout)
            .timeout_write(Duration::from_secs(5))
            .redirects(5)
            .user_agent(&format!("AppGuard/{}", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }
}

impl OriginResolver for RedirectProbe {
    fn resolve(&self) -> Result<String, ResolveError> {
        match self.agent.head(&self.url).call() {
            Ok(response) => Ok(response.get_url().to_string()),
            // Any HTTP status means the server was reached.
            Err(ureq::Error::Status(_, response)) => Ok(response.get_url().to_string()),
            Err(ureq::Error::Transport(transport)) => Err(categorize_transport(&transport)),
        }
    }
}

fn categorize_transport(transport: &ureq::Transport) -> ResolveError {
    let message = transport.to_string();
    let lower = message.to_lowercase();
    match transport.kind() {
        ureq::ErrorKind::Dns => ResolveError::Dns(message),
        ureq::ErrorKind::ConnectionFailed => ResolveError::Connect(message),
        ureq::ErrorKind::Io if lower.contains("timed out") || lower.contains("timeout") => {
            ResolveError::Timeout(message)
        },
        ureq::ErrorKind::Io if lower.contains("tls") || lower.contains("certificate") => {
            ResolveError::Tls(message)
        },
        ureq::ErrorKind::Io => ResolveError::Connect(message),
        _ => ResolveError::Other(message),
    }
}

/// Checks the resolved origin against the allowed one.
#[derive(Debug, Clone)]
pub struct BackendBindingVerifier {
    allowed: BackendOrigin,
}

impl BackendBindingVerifier {
    /// Verifier for `allowed`.
    pub fn new(allowed: BackendOrigin) -> Self {
        Self { allowed }
    }

    /// The allowed origin.
    pub fn allowed(&self) -> &BackendOrigin {
        &self.allowed
    }

    /// Whether `url` points at the allowed origin.
    pub fn is_official_backend(&self, url: &str) -> bool {
        BackendOrigin::parse(url).is_ok_and(|origin| origin == self.allowed)
    }

    /// Compare a resolved origin.
    pub fn verify_origin(&self, resolved: &str) -> Result<(), GuardError> {
        if self.is_official_backend(resolved) {
            debug!(origin = %self.allowed, "Backend origin verified");
            Ok(())
        } else {
            error!(
                expected = %self.allowed,
                actual = resolved,
                "Backend origin mismatch"
            );
            Err(GuardError::BackendMismatch {
                origin: resolved.to_string(),
            })
        }
    }

    /// Resolve and compare. Resolution errors pass (fail open).
    pub fn verify(&self, resolver: &dyn OriginResolver) -> Result<(), GuardError> {
        match resolver.resolve() {
            Ok(resolved) => self.verify_origin(&resolved),
            Err(e) => {
                warn!("Backend origin indeterminate, allowing: {}", e);
                Ok(())
            },
        }
    }
}
