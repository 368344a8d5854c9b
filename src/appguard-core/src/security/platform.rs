//! Root and emulator detection.
//!
//! A rooted device or an emulator does not prove the app was tampered
//! with, but it means hardware-backed guarantees cannot be trusted. The
//! probes only read files; nothing is executed.

use std::path::Path;

use super::under_root;

/// `su` binaries and root manager remnants.
const ROOT_PATHS: &[&str] = &[
    "/system/bin/su",
    "/system/xbin/su",
    "/sbin/su",
    "/system/su",
    "/data/local/xbin/su",
    "/data/local/bin/su",
    "/data/local/su",
    "/system/sd/xbin/su",
    "/system/bin/failsafe/su",
    "/data/adb/magisk",
    "/sbin/.magisk",
    "/cache/.disable_magisk",
    "/dev/.magisk.unblock",
    "/data/data/com.topjohnwu.magisk",
    "/data/data/eu.chainfire.supersu",
    "/data/data/com.noshufou.android.su",
    "/data/data/com.koushikdutta.superuser",
];

/// Device nodes and binaries only present on emulators.
const EMULATOR_PATHS: &[&str] = &[
    "/dev/socket/qemud",
    "/dev/qemu_pipe",
    "/system/lib/libc_malloc_debug_qemu.so",
    "/sys/qemu_trace",
    "/system/bin/qemu-props",
];

/// `build.prop` keys and the values that mark an emulator.
const EMULATOR_PROPS: &[(&str, &[&str])] = &[
    ("ro.hardware", &["goldfish", "ranchu", "vbox86"]),
    (
        "ro.product.model",
        &["sdk", "google_sdk", "Emulator", "Android SDK"],
    ),
    ("ro.product.manufacturer", &["Genymotion"]),
    ("ro.product.device", &["generic", "generic_x86", "vbox86p"]),
];

/// `/proc/cpuinfo` fragments of emulated CPUs.
const EMULATOR_CPU: &[&str] = &["goldfish", "ranchu", "vbox86", "Android Virtual", "QEMU"];

/// First root indicator present under `root`.
pub(super) fn root_indicator(root: &Path) -> Option<String> {
    if let Some(path) = ROOT_PATHS
        .iter()
        .find(|path| under_root(root, path).exists())
    {
        return Some((*path).to_string());
    }

    let props = read_build_prop(root)?;
    prop_value(&props, "ro.build.tags")
        .filter(|tags| tags.contains("test-keys"))
        .map(|_| "ro.build.tags=test-keys".to_string())
}

/// First emulator indicator present under `root`.
pub(super) fn emulator_indicator(root: &Path) -> Option<String> {
    if let Some(path) = EMULATOR_PATHS
        .iter()
        .find(|path| under_root(root, path).exists())
    {
        return Some((*path).to_string());
    }

    if let Some(props) = read_build_prop(root) {
        for (key, markers) in EMULATOR_PROPS {
            if let Some(value) = prop_value(&props, key) {
                if markers.iter().any(|marker| value == *marker) {
                    return Some(format!("{key}={value}"));
                }
            }
        }
    }

    let cpuinfo = std::fs::read_to_string(under_root(root, "/proc/cpuinfo")).ok()?;
    EMULATOR_CPU
        .iter()
        .find(|marker| cpuinfo.contains(*marker))
        .map(|marker| format!("cpuinfo:{marker}"))
}

fn read_build_prop(root: &Path) -> Option<String> {
    std::fs::read_to_string(under_root(root, "/system/build.prop")).ok()
}

fn prop_value<'a>(props: &'a str, key: &str) -> Option<&'a str> {
    props.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}
