//! Processes that are never managed

use warden_host_api::ProcessInfo;

/// Program names essential to the OS or to warden itself
pub const BLOCKLIST: &[&str] = &[
    "init",
    "systemd",
    "kthreadd",
    "sshd",
    "login",
    "agetty",
    "dbus-daemon",
    "wardend",
];

/// Returns true if the process must not be managed
pub fn blocklisted(info: &ProcessInfo) -> bool {
    info.protected || BLOCKLIST.iter().any(|name| info.name == *name)
}
