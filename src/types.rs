//! Type-safe configuration enums
//!
//! Stringly-typed values from the wizard are parsed into these enums at the
//! config boundary so the engine can match exhaustively.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// How the target disk layout is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionMethod {
    /// Wipe, label, partition and format the target disk
    #[default]
    Automatic,
    /// Use caller-supplied existing partitions, never format
    Manual,
}

/// Filesystem type for partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Filesystem {
    #[default]
    Btrfs,
    Ext4,
    Xfs,
    /// FAT32 filesystem for the EFI System Partition
    #[strum(to_string = "vfat", serialize = "fat32")]
    #[serde(alias = "fat32")]
    Vfat,
}

impl Filesystem {
    /// Name passed to `mount -t`
    pub fn mount_type(self) -> &'static str {
        match self {
            Self::Btrfs => "btrfs",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Vfat => "vfat",
        }
    }

    /// Full `mkfs` argv for formatting `device`
    pub fn mkfs_command(self, device: &str) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Btrfs => &["mkfs.btrfs", "-f"],
            Self::Ext4 => &["mkfs.ext4", "-F"],
            Self::Xfs => &["mkfs.xfs", "-f"],
            Self::Vfat => &["mkfs.vfat", "-F32"],
        };
        args.iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(device.to_string()))
            .collect()
    }

    /// Filesystem-appropriate mount options, if any
    pub fn mount_options(self) -> Option<&'static str> {
        match self {
            Self::Vfat => Some("umask=0077,uid=0,gid=0,shortname=winnt"),
            Self::Btrfs => Some("compress=zstd:1"),
            Self::Ext4 | Self::Xfs => None,
        }
    }

    /// True for the FAT family (EFI System Partition)
    pub fn is_fat(self) -> bool {
        matches!(self, Self::Vfat)
    }

    /// Classify a filesystem name as reported by `lsblk`/`blkid`/`findmnt`
    pub fn from_probe(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "btrfs" => Some(Self::Btrfs),
            "ext4" => Some(Self::Ext4),
            "xfs" => Some(Self::Xfs),
            "vfat" | "fat" | "fat32" | "fat16" | "msdos" => Some(Self::Vfat),
            _ => None,
        }
    }
}

/// Host firmware interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum FirmwareMode {
    /// UEFI firmware: EFI System Partition + boot entry registration
    #[strum(serialize = "UEFI")]
    Uefi,
    /// Legacy BIOS firmware: GRUB in the MBR
    #[strum(serialize = "BIOS")]
    Bios,
}

impl FirmwareMode {
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }

    pub fn is_bios(self) -> bool {
        matches!(self, Self::Bios)
    }
}
