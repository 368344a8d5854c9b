//! In-module integrity checks.
//!
//! These mirror the host-side probes but run from inside the module, so
//! patching the host checks alone does not unlock the secret.

use crate::NativeError;

/// Fail when a tracer is attached or the process is not `package`.
pub(crate) fn check(package: &str) -> Result<(), NativeError> {
    if let Some(pid) = tracer_pid() {
        if pid != 0 {
            return Err(NativeError::IntegrityFailure {
                reason: format!("tracer attached (pid {pid})"),
            });
        }
    }
    check_process_name(package)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn tracer_pid() -> Option<u32> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_tracer_pid(&status)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn tracer_pid() -> Option<u32> {
    None
}

/// On Android the process name is the package, optionally `:suffixed`.
#[cfg(target_os = "android")]
fn check_process_name(package: &str) -> Result<(), NativeError> {
    let cmdline = std::fs::read("/proc/self/cmdline").map_err(|e| {
        NativeError::IntegrityFailure {
            reason: format!("cmdline unreadable: {e}"),
        }
    })?;
    let name = process_name(&cmdline);
    if name == package {
        Ok(())
    } else {
        Err(NativeError::IntegrityFailure {
            reason: "process name does not match package".into(),
        })
    }
}

#[cfg(not(target_os = "android"))]
fn check_process_name(_package: &str) -> Result<(), NativeError> {
    Ok(())
}

#[cfg_attr(
    not(any(target_os = "linux", target_os = "android")),
    allow(dead_code)
)]
fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg_attr(not(target_os = "android"), allow(dead_code))]
fn process_name(cmdline: &[u8]) -> String {
    let first = cmdline.split(|b| *b == 0).next().unwrap_or_default();
    let name = String::from_utf8_lossy(first);
    name.split(':').next().unwrap_or_default().to_string()
}
