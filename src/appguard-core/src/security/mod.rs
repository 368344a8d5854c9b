//! Environment anomaly probes.
//!
//! Root, emulator, debugger and hooking-framework indicators. Every probe
//! here is FLEXIBLE: results are reported and logged, never used to lock
//! the installation or withhold the secret.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use appguard_core::security::EnvironmentScanner;
//!
//! let report = EnvironmentScanner::new().scan(&host);
//! for kind in report.anomalies() {
//!     tracing::warn!(?kind, "environment anomaly");
//! }
//! ```

mod anti_tamper;
mod platform;

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::host::HostPlatform;
use crate::types::{ViolationKind, ViolationRecord};

pub use anti_tamper::{hook_indicator_in_frames, hook_indicator_in_maps, tracer_pid_from_status};

/// Result of one environment scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentReport {
    /// Root indicator found, if any.
    pub root_indicator: Option<String>,
    /// Emulator indicator found, if any.
    pub emulator_indicator: Option<String>,
    /// Debugger or tracer attached.
    pub debugger_attached: bool,
    /// Hooking-framework indicator found, if any.
    pub hook_indicator: Option<String>,
}

impl EnvironmentReport {
    /// Anomalies found, in a fixed order.
    pub fn anomalies(&self) -> Vec<ViolationKind> {
        let mut kinds = Vec::new();
        if self.root_indicator.is_some() {
            kinds.push(ViolationKind::RootDetected);
        }
        if self.emulator_indicator.is_some() {
            kinds.push(ViolationKind::EmulatorDetected);
        }
        if self.debugger_attached {
            kinds.push(ViolationKind::DebuggerDetected);
        }
        if self.hook_indicator.is_some() {
            kinds.push(ViolationKind::HookingFramework);
        }
        kinds
    }

    /// Whether nothing was found.
    pub fn is_clean(&self) -> bool {
        self.anomalies().is_empty()
    }

    /// Log every anomaly at `warn!` and return the records.
    pub fn log(&self) -> Vec<ViolationRecord> {
        let records: Vec<ViolationRecord> = self
            .anomalies()
            .into_iter()
            .map(ViolationRecord::now)
            .collect();
        for record in &records {
            let indicator = match record.kind {
                ViolationKind::RootDetected => self.root_indicator.as_deref(),
                ViolationKind::EmulatorDetected => self.emulator_indicator.as_deref(),
                ViolationKind::HookingFramework => self.hook_indicator.as_deref(),
                _ => None,
            };
            warn!(
                kind = ?record.kind,
                indicator = indicator.unwrap_or("-"),
                "Environment anomaly (flexible, not enforced)"
            );
        }
        records
    }
}

/// Reads environment indicators from the filesystem and the host.
///
/// All paths are resolved under `root`, which is `/` in production.
#[derive(Debug, Clone)]
pub struct EnvironmentScanner {
    root: PathBuf,
}

impl EnvironmentScanner {
    /// Scanner over the real filesystem.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    /// Scanner over a different filesystem root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem root in use.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run every probe.
    pub fn scan(&self, host: &dyn HostPlatform) -> EnvironmentReport {
        EnvironmentReport {
            root_indicator: platform::root_indicator(&self.root),
            emulator_indicator: platform::emulator_indicator(&self.root),
            debugger_attached: self.debugger_attached(host),
            hook_indicator: self.hook_indicator(host),
        }
    }

    /// Debugger check: host flags, then the kernel tracer.
    pub fn debugger_attached(&self, host: &dyn HostPlatform) -> bool {
        host.debugger_connected() || host.is_debuggable() || anti_tamper::traced(&self.root)
    }

    /// Hooking check: stack frames, loaded modules, then the Frida port.
    pub fn hook_indicator(&self, host: &dyn HostPlatform) -> Option<String> {
        hook_indicator_in_frames(&host.stack_frames())
            .or_else(|| anti_tamper::hook_indicator_in_loaded_modules(&self.root))
            .or_else(anti_tamper::frida_port_indicator)
    }
}

impl Default for EnvironmentScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve an absolute device path under `root`.
fn under_root(root: &Path, absolute: &str) -> PathBuf {
    root.join(absolute.trim_start_matches('/'))
}

/// Constant-time byte comparison.
///
/// Prevents timing attacks by always comparing all bytes regardless
/// of where a mismatch occurs.
#[inline(never)]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}
