//! Storage plan engine
//!
//! Translates a `DiskPlan` into the concrete, ordered partitioning command
//! list for automatic installs, and recognises an existing layout for
//! manual installs.
//!
//! # Automatic layout
//!
//! ```text
//! <disk>1 - EFI System Partition (512 MiB, FAT32)
//! <disk>2 - Root partition (remaining space, configured filesystem)
//! ```
//!
//! # Design
//!
//! - **Pure logic**: no I/O, only plan generation and parsing
//! - **Typed output**: each `StorageOp` renders to exactly one argv
//! - **Ordered**: wipe, label, partition, flag, format

use std::fmt;

use serde_json::Value;

use crate::config_file::{DiskPlan, PartitionEntry};
use crate::error::{InstallError, Result};
use crate::types::{Filesystem, PartitionMethod};

/// Where the EFI System Partition starts and ends
const ESP_START: &str = "1MiB";
const ESP_END: &str = "513MiB";

/// Size window for recognising an existing EFI System Partition
const ESP_MIN_BYTES: u64 = 100 * 1024 * 1024;
const ESP_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Mount point of the EFI System Partition inside the target
pub const EFI_MOUNTPOINT: &str = "/boot/efi";

// ============================================================================
// Storage Operation Types
// ============================================================================

/// A single destructive storage operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Remove every filesystem/partition-table signature
    WipeDisk { disk: String },
    /// Write a fresh GPT label
    CreateLabel { disk: String },
    /// Create a partition spanning `start..end`
    CreatePartition {
        disk: String,
        name: &'static str,
        fs_hint: &'static str,
        start: &'static str,
        end: &'static str,
    },
    /// Set a partition flag (`boot`, `esp`)
    SetFlag {
        disk: String,
        number: u32,
        flag: &'static str,
    },
    /// Create a filesystem on a partition
    FormatFs { device: String, filesystem: Filesystem },
}

impl StorageOp {
    /// The command line performing this operation
    pub fn argv(&self) -> Vec<String> {
        let words: Vec<String> = match self {
            Self::WipeDisk { disk } => vec!["wipefs".into(), "-a".into(), disk.clone()],
            Self::CreateLabel { disk } => vec![
                "parted".into(),
                "-s".into(),
                disk.clone(),
                "mklabel".into(),
                "gpt".into(),
            ],
            Self::CreatePartition { disk, name, fs_hint, start, end } => vec![
                "parted".into(),
                "-s".into(),
                disk.clone(),
                "mkpart".into(),
                name.to_string(),
                fs_hint.to_string(),
                start.to_string(),
                end.to_string(),
            ],
            Self::SetFlag { disk, number, flag } => vec![
                "parted".into(),
                "-s".into(),
                disk.clone(),
                "set".into(),
                number.to_string(),
                flag.to_string(),
                "on".into(),
            ],
            Self::FormatFs { device, filesystem } => filesystem.mkfs_command(device),
        };
        words
    }

    pub fn is_wipe(&self) -> bool {
        matches!(self, Self::WipeDisk { .. })
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WipeDisk { disk } => write!(f, "WipeDisk({})", disk),
            Self::CreateLabel { disk } => write!(f, "CreateLabel({}, gpt)", disk),
            Self::CreatePartition { disk, name, start, end, .. } => {
                write!(f, "CreatePartition({}, {}, {}..{})", disk, name, start, end)
            }
            Self::SetFlag { disk, number, flag } => write!(f, "SetFlag({}{}, {})", disk, number, flag),
            Self::FormatFs { device, filesystem } => write!(f, "FormatFs({}, fs={})", device, filesystem),
        }
    }
}

/// A complete automatic storage plan
#[derive(Debug, Clone)]
pub struct StoragePlan {
    pub disk: String,
    pub ops: Vec<StorageOp>,
    /// The partitions the plan leaves behind, for mounting
    pub partitions: Vec<PartitionEntry>,
}

impl StoragePlan {
    /// Command argv list, in execution order
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.ops.iter().map(StorageOp::argv).collect()
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Storage Plan for {}", self.disk),
            format!("  Operations ({}):", self.ops.len()),
        ];
        for (i, op) in self.ops.iter().enumerate() {
            lines.push(format!("    {}. {}", i + 1, op));
        }
        lines.join("\n")
    }
}

// ============================================================================
// Plan Calculation
// ============================================================================

/// Calculate the automatic partitioning plan for the primary target disk.
///
/// # Errors
///
/// - the plan is not AUTOMATIC
/// - no target disk, or a disk path outside `/dev`
/// - the configured root filesystem is FAT
pub fn calculate_storage_plan(plan: &DiskPlan) -> Result<StoragePlan> {
    if plan.method != PartitionMethod::Automatic {
        return Err(InstallError::config(
            "Manual partitioning does not generate partition commands",
        ));
    }
    let disk = plan
        .primary_disk()
        .ok_or_else(|| InstallError::config("No target disk specified, cannot generate storage plan"))?;
    if !disk.starts_with("/dev/") {
        return Err(InstallError::config(format!(
            "Invalid disk path '{}', must start with /dev/",
            disk
        )));
    }
    if plan.filesystem.is_fat() {
        return Err(InstallError::config("Root filesystem cannot be FAT"));
    }

    let esp = partition_path(disk, 1);
    let root = partition_path(disk, 2);
    let disk = disk.to_string();

    let ops = vec![
        StorageOp::WipeDisk { disk: disk.clone() },
        StorageOp::CreateLabel { disk: disk.clone() },
        StorageOp::CreatePartition {
            disk: disk.clone(),
            name: "ESP",
            fs_hint: "fat32",
            start: ESP_START,
            end: ESP_END,
        },
        StorageOp::SetFlag { disk: disk.clone(), number: 1, flag: "boot" },
        StorageOp::SetFlag { disk: disk.clone(), number: 1, flag: "esp" },
        StorageOp::CreatePartition {
            disk: disk.clone(),
            name: "root",
            fs_hint: parted_fs_hint(plan.filesystem),
            start: ESP_END,
            end: "100%",
        },
        StorageOp::FormatFs {
            device: esp.clone(),
            filesystem: Filesystem::Vfat,
        },
        StorageOp::FormatFs {
            device: root.clone(),
            filesystem: plan.filesystem,
        },
    ];

    Ok(StoragePlan {
        disk,
        ops,
        partitions: vec![
            PartitionEntry::new(esp, EFI_MOUNTPOINT, Filesystem::Vfat),
            PartitionEntry::new(root, "/", plan.filesystem),
        ],
    })
}

/// Filesystem type hint understood by `parted mkpart`
fn parted_fs_hint(fs: Filesystem) -> &'static str {
    match fs {
        Filesystem::Btrfs => "btrfs",
        Filesystem::Ext4 => "ext4",
        Filesystem::Xfs => "xfs",
        Filesystem::Vfat => "fat32",
    }
}

/// Partition device path from a disk path and partition number.
///
/// `/dev/sda` → `/dev/sda1`, `/dev/nvme0n1` → `/dev/nvme0n1p1`.
pub fn partition_path(disk: &str, partition_num: u32) -> String {
    // NVMe, MMC and loop devices end in a digit and use a 'p' separator
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, partition_num)
    } else {
        format!("{}{}", disk, partition_num)
    }
}

/// Disk path and partition number of a partition device, if it looks like one
pub fn split_partition_path(device: &str) -> Option<(String, u32)> {
    let digits_at = device.rfind(|c: char| !c.is_ascii_digit())? + 1;
    if digits_at >= device.len() {
        return None;
    }
    let number: u32 = device[digits_at..].parse().ok()?;
    let head = &device[..digits_at];
    let disk = match head.strip_suffix('p') {
        Some(stripped) if stripped.ends_with(|c: char| c.is_ascii_digit()) => stripped,
        _ => head,
    };
    Some((disk.to_string(), number))
}

// ============================================================================
// Manual Layout Detection
// ============================================================================

/// A partition as reported by `lsblk -J -b`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedPartition {
    pub path: String,
    pub size: u64,
    pub fstype: Option<String>,
}

/// Partitions of a disk from `lsblk -J -b -o PATH,SIZE,FSTYPE,TYPE` output
pub fn parse_lsblk_partitions(json: &str) -> Result<Vec<ProbedPartition>> {
    let root: Value = serde_json::from_str(json)?;
    let mut found = Vec::new();
    if let Some(devices) = root.get("blockdevices").and_then(Value::as_array) {
        for dev in devices {
            collect_partitions(dev, &mut found);
        }
    }
    Ok(found)
}

fn collect_partitions(node: &Value, out: &mut Vec<ProbedPartition>) {
    if node.get("type").and_then(Value::as_str) == Some("part") {
        if let Some(path) = node.get("path").and_then(Value::as_str) {
            out.push(ProbedPartition {
                path: path.to_string(),
                size: size_field(node.get("size")),
                fstype: node
                    .get("fstype")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }
    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            collect_partitions(child, out);
        }
    }
}

/// lsblk emits sizes as numbers or as strings depending on its version
fn size_field(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Pick root and EFI partitions from an existing layout.
///
/// Root is the largest partition carrying a mountable non-FAT filesystem.
/// EFI is `selected_efi` when given, else the first FAT partition between
/// 100 MiB and 2 GiB.
pub fn detect_manual_layout(
    probed: &[ProbedPartition],
    selected_efi: Option<&str>,
) -> Result<Vec<PartitionEntry>> {
    let root = probed
        .iter()
        .filter_map(|p| {
            let fs = p.fstype.as_deref().and_then(Filesystem::from_probe)?;
            (!fs.is_fat()).then_some((p, fs))
        })
        .max_by_key(|(p, _)| p.size)
        .ok_or(InstallError::NoRootPartition)?;

    let mut layout = vec![PartitionEntry::new(root.0.path.clone(), "/", root.1)];

    let efi = match selected_efi {
        Some(device) => Some(device.to_string()),
        None => probed
            .iter()
            .find(|p| {
                p.fstype
                    .as_deref()
                    .and_then(Filesystem::from_probe)
                    .is_some_and(Filesystem::is_fat)
                    && (ESP_MIN_BYTES..=ESP_MAX_BYTES).contains(&p.size)
            })
            .map(|p| p.path.clone()),
    };
    if let Some(efi) = efi {
        tracing::info!("Detected EFI System Partition {}", efi);
        layout.push(PartitionEntry::new(efi, EFI_MOUNTPOINT, Filesystem::Vfat));
    }

    tracing::info!("Detected root partition {} ({})", root.0.path, root.1);
    Ok(layout)
}

// ============================================================================
// Tests
// ============================================================================
