//! Debugger and hooking-framework detection.
//!
//! Detects:
//! - Tracers (`TracerPid` in `/proc/self/status`)
//! - Hooking libraries in `/proc/self/maps` (Frida, Xposed, Substrate)
//! - Hook bridge classes on the call stack
//! - Frida's default listening port (Android only)
//!
//! These raise the bar for casual tampering. They are not proof of intent,
//! so callers only log them.

use std::path::Path;

use super::under_root;

/// Library names that mark an injected hooking framework.
const HOOK_LIBRARIES: &[&str] = &[
    "frida-agent",
    "frida-gadget",
    "frida",
    "xposed",
    "substrate",
    "libhook",
];

/// Stack frame fragments left by hook bridges.
const HOOK_FRAMES: &[&str] = &[
    "de.robv.android.xposed",
    "XposedBridge",
    "Xposed",
    "com.saurik.substrate",
    "frida",
];

/// Frida server default port.
#[cfg(target_os = "android")]
const FRIDA_PORT: u16 = 27042;

/// Parse the tracer pid out of `/proc/<pid>/status` contents.
pub fn tracer_pid_from_status(status: &str) -> Option<i32> {
    status
        .lines()
        .find(|line| line.starts_with("TracerPid:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|pid| pid.parse::<i32>().ok())
}

/// First hooking library named in `/proc/<pid>/maps` contents.
pub fn hook_indicator_in_maps(maps: &str) -> Option<&'static str> {
    let lower = maps.to_lowercase();
    HOOK_LIBRARIES
        .iter()
        .copied()
        .find(|pattern| lower.contains(pattern))
}

/// First stack frame carrying a hook bridge name.
pub fn hook_indicator_in_frames(frames: &[String]) -> Option<String> {
    frames
        .iter()
        .find(|frame| HOOK_FRAMES.iter().any(|pattern| frame.contains(pattern)))
        .cloned()
}

/// Whether the kernel reports a tracer on this process.
pub(super) fn traced(root: &Path) -> bool {
    std::fs::read_to_string(under_root(root, "/proc/self/status"))
        .ok()
        .and_then(|status| tracer_pid_from_status(&status))
        .is_some_and(|pid| pid != 0)
}

/// Hooking library mapped into this process.
pub(super) fn hook_indicator_in_loaded_modules(root: &Path) -> Option<String> {
    let maps = std::fs::read_to_string(under_root(root, "/proc/self/maps")).ok()?;
    hook_indicator_in_maps(&maps).map(|lib| format!("maps:{lib}"))
}

/// Frida server listening on its default port.
#[cfg(target_os = "android")]
pub(super) fn frida_port_indicator() -> Option<String> {
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    let addr = SocketAddr::from(([127, 0, 0, 1], FRIDA_PORT));
    TcpStream::connect_timeout(&addr, Duration::from_millis(100))
        .ok()
        .map(|_| format!("port:{FRIDA_PORT}"))
}

#[cfg(not(target_os = "android"))]
pub(super) fn frida_port_indicator() -> Option<String> {
    None
}
