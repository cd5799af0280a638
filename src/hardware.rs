//! Host environment probes
//!
//! All host paths the engine inspects are collected in `HostPaths` so a test
//! can point them at a scratch directory instead of the live system.

use std::path::{Path, PathBuf};

use crate::types::FirmwareMode;

/// Default release version when the host release metadata is unreadable
pub const DEFAULT_RELEASE_VERSION: &str = "41";

/// Locations on the host (live environment) the engine probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Present only when booted via UEFI
    pub firmware_efi: PathBuf,
    /// EFI variables filesystem mount point
    pub efivars: PathBuf,
    /// D-Bus system bus socket
    pub dbus_socket: PathBuf,
    /// Release metadata of the running (live) OS
    pub os_release: PathBuf,
    /// Root of the live environment, searched for shim/GRUB EFI binaries
    pub live_root: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            firmware_efi: PathBuf::from("/sys/firmware/efi"),
            efivars: PathBuf::from("/sys/firmware/efi/efivars"),
            dbus_socket: PathBuf::from("/run/dbus/system_bus_socket"),
            os_release: PathBuf::from("/etc/os-release"),
            live_root: PathBuf::from("/"),
        }
    }
}

impl HostPaths {
    /// Host layout rooted somewhere other than `/`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            firmware_efi: root.join("sys/firmware/efi"),
            efivars: root.join("sys/firmware/efi/efivars"),
            dbus_socket: root.join("run/dbus/system_bus_socket"),
            os_release: root.join("etc/os-release"),
            live_root: root.to_path_buf(),
        }
    }

    pub fn has_efivars(&self) -> bool {
        self.efivars.is_dir()
    }

    pub fn has_dbus_socket(&self) -> bool {
        self.dbus_socket.exists()
    }
}

/// Detect firmware mode by checking for the EFI sysfs directory.
///
/// The kernel exposes `/sys/firmware/efi` only when booted in UEFI mode.
pub fn detect_firmware_mode(host: &HostPaths) -> FirmwareMode {
    if host.firmware_efi.exists() {
        tracing::info!("UEFI firmware detected ({} exists)", host.firmware_efi.display());
        FirmwareMode::Uefi
    } else {
        tracing::info!("BIOS firmware detected ({} not found)", host.firmware_efi.display());
        FirmwareMode::Bios
    }
}

/// `VERSION_ID` from an os-release file, falling back to the default
pub fn release_version(host: &HostPaths) -> String {
    match std::fs::read_to_string(&host.os_release) {
        Ok(content) => parse_version_id(&content).unwrap_or_else(|| {
            tracing::warn!(
                "No VERSION_ID in {}, using {}",
                host.os_release.display(),
                DEFAULT_RELEASE_VERSION
            );
            DEFAULT_RELEASE_VERSION.to_string()
        }),
        Err(e) => {
            tracing::warn!(
                "Cannot read {} ({}), using release {}",
                host.os_release.display(),
                e,
                DEFAULT_RELEASE_VERSION
            );
            DEFAULT_RELEASE_VERSION.to_string()
        }
    }
}

fn parse_version_id(content: &str) -> Option<String> {
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("VERSION_ID="))
        .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
        .find(|v| !v.is_empty())
}
