//! Installation configuration produced by the wizard.
//!
//! The configuration is a set of per-domain blocks. It is loaded once,
//! validated, and never mutated while the pipeline runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::types::{Filesystem, PartitionMethod};

/// One partition of the target layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// Block device path, e.g. `/dev/sda2`
    pub device: String,
    /// Mount point inside the target root, e.g. `/` or `/boot/efi`
    pub mountpoint: String,
    pub fstype: Filesystem,
}

impl PartitionEntry {
    pub fn new(device: impl Into<String>, mountpoint: impl Into<String>, fstype: Filesystem) -> Self {
        Self {
            device: device.into(),
            mountpoint: mountpoint.into(),
            fstype,
        }
    }

    pub fn is_root(&self) -> bool {
        self.mountpoint == "/"
    }

    pub fn is_efi(&self) -> bool {
        self.mountpoint == "/boot/efi"
    }
}

/// Declarative disk plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskPlan {
    pub method: PartitionMethod,
    pub target_disks: Vec<String>,
    /// Ordered argv list; filled by the storage engine for AUTOMATIC mode
    pub commands: Vec<Vec<String>>,
    pub partitions: Vec<PartitionEntry>,
    /// Root filesystem for AUTOMATIC mode
    pub filesystem: Filesystem,
    pub dual_boot: bool,
    pub preserve_efi: bool,
    pub selected_efi_partition: Option<String>,
}

impl Default for DiskPlan {
    fn default() -> Self {
        Self {
            method: PartitionMethod::Automatic,
            target_disks: Vec::new(),
            commands: Vec::new(),
            partitions: Vec::new(),
            filesystem: Filesystem::Btrfs,
            dual_boot: false,
            preserve_efi: false,
            selected_efi_partition: None,
        }
    }
}

impl DiskPlan {
    /// First target disk, used for BIOS MBR installation and EFI registration
    pub fn primary_disk(&self) -> Option<&str> {
        self.target_disks.first().map(String::as_str)
    }

    pub fn root_partition(&self) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.is_root())
    }

    pub fn efi_partition(&self) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.is_efi())
    }
}

/// Custom repository descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Package payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub packages: Vec<String>,
    pub repositories: Vec<RepositoryConfig>,
    pub flatpak_enabled: bool,
    pub flatpak_packages: Vec<String>,
    pub minimal_install: bool,
    pub keep_cache: bool,
}

/// Initial user account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub username: String,
    pub password: Option<String>,
    pub full_name: Option<String>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub hostname: Option<String>,
    pub enable_network_manager: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeDateConfig {
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    pub keymap: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootloaderConfig {
    pub install_bootloader: bool,
    /// Explicit ESP device; auto-detected from the mounted `/boot/efi` otherwise
    pub efi_partition: Option<String>,
    /// Vendor directory under `EFI/`
    pub vendor_id: String,
    /// Firmware boot menu label
    pub entry_label: String,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            install_bootloader: true,
            efi_partition: None,
            vendor_id: "fedora".to_string(),
            entry_label: "Linux".to_string(),
        }
    }
}

/// Installation configuration, keyed by domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallationConfig {
    pub disk: DiskPlan,
    pub payload: PackageConfig,
    pub user: Option<UserConfig>,
    pub network: NetworkConfig,
    pub timedate: TimeDateConfig,
    pub language: LanguageConfig,
    pub keyboard: KeyboardConfig,
    pub bootloader: BootloaderConfig,
}

impl InstallationConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.disk.method {
            PartitionMethod::Automatic => {
                if self.disk.target_disks.is_empty() {
                    anyhow::bail!("Automatic partitioning requires a target disk");
                }
                if self.disk.target_disks.iter().any(|d| !d.starts_with("/dev/")) {
                    anyhow::bail!("Target disks must be device paths under /dev");
                }
            }
            PartitionMethod::Manual => {
                if self.disk.partitions.is_empty() && self.disk.target_disks.is_empty() {
                    anyhow::bail!("Manual partitioning requires partitions or a target disk");
                }
                if !self.disk.commands.is_empty() {
                    anyhow::bail!("Manual partitioning must not carry partition commands");
                }
            }
        }

        for part in &self.disk.partitions {
            if !part.mountpoint.starts_with('/') {
                anyhow::bail!("Mount point '{}' must be absolute", part.mountpoint);
            }
        }

        if let Some(hostname) = self.network.hostname.as_deref() {
            validate_hostname(hostname)?;
        }

        if let Some(user) = &self.user {
            validate_username(&user.username)?;
            if let Some(password) = &user.password {
                if password.contains(['\n', ':']) {
                    anyhow::bail!("User password cannot contain ':' or newlines");
                }
            }
        }

        for repo in &self.payload.repositories {
            if repo.id.trim().is_empty() || repo.id.contains('/') {
                anyhow::bail!("Repository id '{}' is invalid", repo.id);
            }
            if !repo.url.starts_with("http://")
                && !repo.url.starts_with("https://")
                && !repo.url.starts_with("file://")
            {
                anyhow::bail!("Repository URL '{}' must be http(s):// or file://", repo.url);
            }
        }

        if self.bootloader.vendor_id.trim().is_empty() || self.bootloader.vendor_id.contains('/') {
            anyhow::bail!("Bootloader vendor id is invalid");
        }

        Ok(())
    }
}

/// Hostname: 1-63 chars, alphanumeric and hyphen, no leading/trailing hyphen
fn validate_hostname(hostname: &str) -> Result<()> {
    let hostname = hostname.trim();
    if hostname.is_empty() || hostname.len() > 63 {
        anyhow::bail!("Hostname must be 1-63 characters long");
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        anyhow::bail!("Hostname cannot start or end with a hyphen");
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        anyhow::bail!("Hostname can only contain letters, numbers, and hyphens");
    }
    Ok(())
}

/// Username: starts with a lowercase letter or underscore, max 32 chars
fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > 32 {
        anyhow::bail!("Username must be 1-32 characters long");
    }
    if let Some(first) = username.chars().next() {
        if !(first.is_ascii_lowercase() || first == '_') {
            anyhow::bail!("Username must start with a lowercase letter or underscore");
        }
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        anyhow::bail!("Username can only contain lowercase letters, digits, '_' and '-'");
    }
    if username == "root" {
        anyhow::bail!("Username cannot be root");
    }
    Ok(())
}
