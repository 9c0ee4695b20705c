//! Host platform and CAN interface discovery
//!
//! Callers use this to pick a channel and backend before building a link.
//! The factory itself never probes the host.

use std::fmt;
use std::path::Path;

use canary_core::BackendKind;
use serde::Serialize;
use tracing::{debug, warn};

/// ARPHRD_CAN, the link type the kernel reports for CAN netdevs
const ARPHRD_CAN: u32 = 280;

const SYS_CLASS_NET: &str = "/sys/class/net";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OsKind {
    Linux,
    RaspberryPi,
    Windows,
    MacOs,
    Unknown,
}

impl OsKind {
    fn detect() -> Self {
        match std::env::consts::OS {
            "linux" if is_raspberry_pi() => OsKind::RaspberryPi,
            "linux" => OsKind::Linux,
            "windows" => OsKind::Windows,
            "macos" => OsKind::MacOs,
            other => {
                warn!(os = other, "Unknown operating system");
                OsKind::Unknown
            }
        }
    }

    pub fn is_linux(&self) -> bool {
        matches!(self, OsKind::Linux | OsKind::RaspberryPi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Arm,
    Arm64,
    Unknown,
}

impl Arch {
    fn detect() -> Self {
        match std::env::consts::ARCH {
            "x86_64" => Arch::X86_64,
            "aarch64" => Arch::Arm64,
            "arm" => Arch::Arm,
            other => {
                warn!(arch = other, "Unknown hardware architecture");
                Arch::Unknown
            }
        }
    }
}

fn is_raspberry_pi() -> bool {
    let model = std::fs::read_to_string("/proc/device-tree/model").unwrap_or_default();
    if model.contains("Raspberry Pi") {
        return true;
    }
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    cpuinfo.contains("Raspberry Pi")
}

/// What the host offers for CAN
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub os: OsKind,
    pub arch: Arch,
    /// CAN network interfaces, sorted by name
    pub can_interfaces: Vec<String>,
}

impl PlatformInfo {
    pub fn detect() -> Self {
        let os = OsKind::detect();
        let can_interfaces = if os.is_linux() {
            scan_can_interfaces(Path::new(SYS_CLASS_NET))
        } else {
            Vec::new()
        };

        let info = Self {
            os,
            arch: Arch::detect(),
            can_interfaces,
        };
        debug!(?info, "Platform detected");
        info
    }

    /// SocketCAN may be usable even when no interface exists yet
    pub fn is_can_supported(&self) -> bool {
        !self.can_interfaces.is_empty() || self.os.is_linux()
    }

    /// First physical interface, else any interface, else `vcan0` on Linux
    pub fn recommended_interface(&self) -> Option<String> {
        self.can_interfaces
            .iter()
            .find(|name| !name.starts_with('v'))
            .or_else(|| self.can_interfaces.first())
            .cloned()
            .or_else(|| self.os.is_linux().then(|| "vcan0".to_string()))
    }

    pub fn suggested_backend_kind(&self) -> BackendKind {
        if self.can_interfaces.is_empty() {
            BackendKind::Virtual
        } else {
            BackendKind::Hardware
        }
    }
}

impl fmt::Display for PlatformInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "OS: {:?}", self.os)?;
        writeln!(f, "Hardware: {:?}", self.arch)?;
        write!(f, "CAN Supported: {}", self.is_can_supported())?;
        if !self.can_interfaces.is_empty() {
            write!(f, "\nCAN Interfaces: {}", self.can_interfaces.join(", "))?;
        }
        Ok(())
    }
}

/// Names of netdevs under `root` whose `type` is ARPHRD_CAN
pub fn scan_can_interfaces(root: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %root.display(), error = %e, "Cannot list network interfaces");
            return Vec::new();
        }
    };

    let mut found: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            std::fs::read_to_string(entry.path().join("type"))
                .ok()
                .and_then(|kind| kind.trim().parse::<u32>().ok())
                == Some(ARPHRD_CAN)
        })
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn netdev(root: &Path, name: &str, kind: u32) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("type"), format!("{}\n", kind)).unwrap();
    }

    fn info(os: OsKind, interfaces: &[&str]) -> PlatformInfo {
        PlatformInfo {
            os,
            arch: Arch::X86_64,
            can_interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_scan_finds_can_netdevs_only() {
        let root = tempfile::tempdir().unwrap();
        netdev(root.path(), "vcan0", ARPHRD_CAN);
        netdev(root.path(), "can1", ARPHRD_CAN);
        netdev(root.path(), "eth0", 1);
        netdev(root.path(), "lo", 772);

        assert_eq!(
            scan_can_interfaces(root.path()),
            vec!["can1".to_string(), "vcan0".to_string()]
        );
    }

    #[test]
    fn test_scan_missing_root() {
        assert!(scan_can_interfaces(Path::new("/nonexistent/net")).is_empty());
    }

    #[test]
    fn test_recommendation_prefers_physical() {
        let host = info(OsKind::Linux, &["vcan0", "can0"]);
        assert_eq!(host.recommended_interface().as_deref(), Some("can0"));
        assert_eq!(host.suggested_backend_kind(), BackendKind::Hardware);

        let host = info(OsKind::RaspberryPi, &["vcan3"]);
        assert_eq!(host.recommended_interface().as_deref(), Some("vcan3"));
    }

    #[test]
    fn test_recommendation_without_interfaces() {
        let linux = info(OsKind::Linux, &[]);
        assert_eq!(linux.recommended_interface().as_deref(), Some("vcan0"));
        assert_eq!(linux.suggested_backend_kind(), BackendKind::Virtual);
        assert!(linux.is_can_supported());

        let mac = info(OsKind::MacOs, &[]);
        assert_eq!(mac.recommended_interface(), None);
        assert!(!mac.is_can_supported());
    }

    #[test]
    fn test_summary() {
        let host = info(OsKind::Linux, &["can0", "vcan0"]);
        let summary = host.to_string();
        assert!(summary.contains("CAN Supported: true"));
        assert!(summary.ends_with("CAN Interfaces: can0, vcan0"));
    }
}
