//! Storage preparation
//!
//! Drives the target disks from "whatever the live system left behind" to
//! "partitioned, formatted and mounted under the target root". The work is
//! an explicit state machine so the safety ordering cannot be rearranged by
//! accident:
//!
//! ```text
//! IdentifyPartitions
//!     ↓
//! StopInterferingServices      udisks2 stopped (restarted on every exit path)
//!     ↓
//! DeactivateLvm                volume groups on the target disks inactive
//!     ↓
//! CheckBusy                    no process holds any target device open
//!     ↓
//! UnmountExisting              no target device mounted or used as swap
//!     ↓
//! RemoveDmMappings             no stale device-mapper nodes
//!     ↓
//! RescanPartitionTable
//!     ↓
//! ExecutePartitionCommands     busy check + settle delay right before the wipe
//!     ↓
//! MountFilesystems             `/` first, rolled back on any failure
//!     ↓
//! Done
//! ```
//!
//! Manual installs never touch the partition table: they jump from
//! `IdentifyPartitions` straight to `MountFilesystems`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::command::{CommandRunner, CommandSpec};
use crate::config_file::{DiskPlan, PartitionEntry};
use crate::engine::storage::{self as plan_engine, EFI_MOUNTPOINT};
use crate::error::{InstallError, Outcome, Result};
use crate::mounts::{self, MountPlan};
use crate::progress::ProgressReporter;
use crate::types::{Filesystem, PartitionMethod};

/// Desktop disk manager that auto-mounts and holds devices open
pub const INTERFERING_SERVICE: &str = "udisks2.service";

/// Delay before wiping, so udev catches up with prior unmounts
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const FORMAT_TIMEOUT: Duration = Duration::from_secs(600);

/// Stages of storage preparation, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StorageState {
    IdentifyPartitions = 0,
    StopInterferingServices = 1,
    DeactivateLvm = 2,
    CheckBusy = 3,
    UnmountExisting = 4,
    RemoveDmMappings = 5,
    RescanPartitionTable = 6,
    ExecutePartitionCommands = 7,
    MountFilesystems = 8,
    Done = 9,
}

impl StorageState {
    /// The following state for the given partitioning method
    pub const fn next(self, method: PartitionMethod) -> Option<Self> {
        match (self, method) {
            (Self::IdentifyPartitions, PartitionMethod::Manual) => Some(Self::MountFilesystems),
            (Self::IdentifyPartitions, PartitionMethod::Automatic) => Some(Self::StopInterferingServices),
            (Self::StopInterferingServices, _) => Some(Self::DeactivateLvm),
            (Self::DeactivateLvm, _) => Some(Self::CheckBusy),
            (Self::CheckBusy, _) => Some(Self::UnmountExisting),
            (Self::UnmountExisting, _) => Some(Self::RemoveDmMappings),
            (Self::RemoveDmMappings, _) => Some(Self::RescanPartitionTable),
            (Self::RescanPartitionTable, _) => Some(Self::ExecutePartitionCommands),
            (Self::ExecutePartitionCommands, _) => Some(Self::MountFilesystems),
            (Self::MountFilesystems, _) => Some(Self::Done),
            (Self::Done, _) => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::IdentifyPartitions => "Identifying partitions",
            Self::StopInterferingServices => "Stopping disk management services",
            Self::DeactivateLvm => "Deactivating LVM volume groups",
            Self::CheckBusy => "Checking for busy devices",
            Self::UnmountExisting => "Unmounting existing filesystems",
            Self::RemoveDmMappings => "Removing device-mapper nodes",
            Self::RescanPartitionTable => "Rescanning partition tables",
            Self::ExecutePartitionCommands => "Partitioning and formatting",
            Self::MountFilesystems => "Mounting filesystems",
            Self::Done => "Storage ready",
        }
    }

    /// Approximate completion when this state starts
    const fn fraction(self) -> f64 {
        (self as u8) as f64 / (Self::Done as u8) as f64
    }
}

impl fmt::Display for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Result of a completed storage preparation
#[derive(Debug, Clone, Default)]
pub struct PreparedStorage {
    /// Partition layout that is now mounted under the target root
    pub partitions: Vec<PartitionEntry>,
    /// Mounted targets, in mount order
    pub mounted: Vec<PathBuf>,
    pub outcome: Outcome,
}

/// Restarts the interfering service when dropped
struct ServiceRestart<'a> {
    runner: &'a dyn CommandRunner,
}

impl Drop for ServiceRestart<'_> {
    fn drop(&mut self) {
        restart_interfering_service(self.runner);
    }
}

/// Start the disk-management daemon again. Best-effort.
pub fn restart_interfering_service(runner: &dyn CommandRunner) {
    let spec = CommandSpec::new(
        ["systemctl", "start", INTERFERING_SERVICE],
        format!("Restart {}", INTERFERING_SERVICE),
    )
    .timeout(PROBE_TIMEOUT);
    if let Err(e) = runner.run(&spec) {
        tracing::warn!("Could not restart {}: {}", INTERFERING_SERVICE, e);
    }
}

/// One storage preparation run
pub struct StoragePreparation<'a> {
    runner: &'a dyn CommandRunner,
    plan: &'a DiskPlan,
    target_root: PathBuf,
    settle_delay: Duration,
    state: StorageState,
    history: Vec<StorageState>,
    devices: Vec<String>,
    volume_groups: BTreeSet<String>,
    commands: Vec<Vec<String>>,
    partitions: Vec<PartitionEntry>,
    mounted: Vec<PathBuf>,
    outcome: Outcome,
    _restart: Option<ServiceRestart<'a>>,
}

impl<'a> StoragePreparation<'a> {
    pub fn new(runner: &'a dyn CommandRunner, plan: &'a DiskPlan, target_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            plan,
            target_root: target_root.into(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            state: StorageState::IdentifyPartitions,
            history: Vec::new(),
            devices: Vec::new(),
            volume_groups: BTreeSet::new(),
            commands: Vec::new(),
            partitions: Vec::new(),
            mounted: Vec::new(),
            outcome: Outcome::clean(),
            _restart: None,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn state(&self) -> StorageState {
        self.state
    }

    /// States already completed, in order
    pub fn history(&self) -> &[StorageState] {
        &self.history
    }

    /// Run every state to completion. The first failing state aborts the rest.
    pub fn run(mut self, progress: &ProgressReporter) -> Result<PreparedStorage> {
        while self.state != StorageState::Done {
            progress.report(self.state.description(), self.state.fraction());
            tracing::info!(state = ?self.state, "{}", self.state);
            self.execute_state()?;
            self.history.push(self.state);
            self.state = self.state.next(self.plan.method).unwrap_or(StorageState::Done);
        }
        progress.report(StorageState::Done.description(), 1.0);

        Ok(PreparedStorage {
            partitions: std::mem::take(&mut self.partitions),
            mounted: std::mem::take(&mut self.mounted),
            outcome: std::mem::take(&mut self.outcome),
        })
    }

    fn execute_state(&mut self) -> Result<()> {
        match self.state {
            StorageState::IdentifyPartitions => self.identify_partitions(),
            StorageState::StopInterferingServices => {
                self.stop_interfering_services();
                Ok(())
            }
            StorageState::DeactivateLvm => {
                self.deactivate_lvm();
                Ok(())
            }
            StorageState::CheckBusy => self.check_busy(),
            StorageState::UnmountExisting => {
                self.unmount_existing();
                Ok(())
            }
            StorageState::RemoveDmMappings => {
                self.remove_dm_mappings();
                Ok(())
            }
            StorageState::RescanPartitionTable => {
                self.rescan_partition_tables();
                Ok(())
            }
            StorageState::ExecutePartitionCommands => self.execute_partition_commands(),
            StorageState::MountFilesystems => self.mount_filesystems(),
            StorageState::Done => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // IdentifyPartitions
    // ------------------------------------------------------------------

    fn identify_partitions(&mut self) -> Result<()> {
        match self.plan.method {
            PartitionMethod::Automatic => {
                for disk in &self.plan.target_disks {
                    let devices = list_block_devices(self.runner, disk)?;
                    tracing::info!("{}: {} block device(s)", disk, devices.len());
                    for dev in devices {
                        if !self.devices.contains(&dev) {
                            self.devices.push(dev);
                        }
                    }
                }

                self.commands = self.plan.commands.clone();
                self.partitions = self.plan.partitions.clone();
                // A supplied command list and layout are used as given
                if self.commands.is_empty() || self.partitions.is_empty() {
                    let generated = plan_engine::calculate_storage_plan(self.plan)?;
                    tracing::debug!("{}", generated.summary());
                    if self.commands.is_empty() {
                        self.commands = generated.commands();
                    }
                    if self.partitions.is_empty() {
                        self.partitions = generated.partitions;
                    }
                }
                Ok(())
            }
            PartitionMethod::Manual => {
                self.partitions = self.resolve_manual_partitions()?;
                Ok(())
            }
        }
    }

    fn resolve_manual_partitions(&self) -> Result<Vec<PartitionEntry>> {
        let mut partitions = if self.plan.root_partition().is_some() {
            self.plan.partitions.clone()
        } else {
            let disk = self.plan.primary_disk().ok_or(InstallError::NoRootPartition)?;
            tracing::warn!("No root partition configured, probing {}", disk);
            let spec = CommandSpec::new(
                ["lsblk", "-J", "-b", "-o", "PATH,SIZE,FSTYPE,TYPE", disk],
                format!("Probe partitions on {}", disk),
            )
            .timeout(PROBE_TIMEOUT);
            let out = self.runner.run(&spec)?;
            let probed = plan_engine::parse_lsblk_partitions(&out.stdout)?;
            plan_engine::detect_manual_layout(&probed, self.plan.selected_efi_partition.as_deref())?
        };

        if let Some(selected) = &self.plan.selected_efi_partition {
            if !partitions.iter().any(PartitionEntry::is_efi) {
                partitions.push(PartitionEntry::new(selected.clone(), EFI_MOUNTPOINT, Filesystem::Vfat));
            }
        }
        if self.plan.dual_boot || self.plan.preserve_efi {
            tracing::info!("Existing EFI System Partition is preserved and will not be formatted");
        }
        Ok(partitions)
    }

    // ------------------------------------------------------------------
    // StopInterferingServices
    // ------------------------------------------------------------------

    fn stop_interfering_services(&mut self) {
        self._restart = Some(ServiceRestart { runner: self.runner });
        let spec = CommandSpec::new(
            ["systemctl", "stop", INTERFERING_SERVICE],
            format!("Stop {}", INTERFERING_SERVICE),
        )
        .timeout(PROBE_TIMEOUT);
        if let Err(e) = self.runner.run(&spec) {
            self.outcome.warn(format!("Could not stop {}: {}", INTERFERING_SERVICE, e));
        }
    }

    // ------------------------------------------------------------------
    // DeactivateLvm
    // ------------------------------------------------------------------

    fn deactivate_lvm(&mut self) {
        let spec = CommandSpec::new(
            ["pvs", "--noheadings", "-o", "pv_name,vg_name"],
            "List LVM physical volumes",
        )
        .timeout(PROBE_TIMEOUT);
        let listing = match self.runner.run(&spec) {
            Ok(out) => out.stdout,
            Err(e) => {
                tracing::warn!("LVM discovery failed, assuming no LVM: {}", e);
                return;
            }
        };

        self.volume_groups = volume_groups_on(&listing, &self.devices);
        for vg in self.volume_groups.clone() {
            let spec = CommandSpec::new(
                ["vgchange", "-an", vg.as_str()],
                format!("Deactivate volume group {}", vg),
            )
            .timeout(PROBE_TIMEOUT);
            if let Err(e) = self.runner.run(&spec) {
                self.outcome.warn(format!("Failed to deactivate volume group {}: {}", vg, e));
            }
        }
    }

    // ------------------------------------------------------------------
    // CheckBusy
    // ------------------------------------------------------------------

    fn check_busy(&self) -> Result<()> {
        for device in &self.devices {
            ensure_not_busy(self.runner, device)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // UnmountExisting
    // ------------------------------------------------------------------

    fn unmount_existing(&mut self) {
        let swaps = active_swaps(self.runner);
        // Partitions before their parent disk
        for device in self.devices.iter().rev() {
            if swaps.contains(device) {
                let spec = CommandSpec::new(["swapoff", device.as_str()], format!("Disable swap on {}", device))
                    .timeout(PROBE_TIMEOUT);
                if let Err(e) = self.runner.run(&spec) {
                    self.outcome.warn(format!("swapoff {} failed: {}", device, e));
                }
            }

            let spec = CommandSpec::new(
                ["findmnt", "-rn", "-o", "TARGET", "-S", device.as_str()],
                format!("Find mounts of {}", device),
            )
            .timeout(PROBE_TIMEOUT);
            let Ok(out) = self.runner.run(&spec) else {
                continue;
            };
            let mut targets: Vec<PathBuf> = out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect();
            targets.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
            for target in targets {
                tracing::info!("Unmounting {} from {}", device, target.display());
                if let Err(e) = mounts::unmount(self.runner, &target) {
                    self.outcome.warn(e.to_string());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // RemoveDmMappings
    // ------------------------------------------------------------------

    fn remove_dm_mappings(&mut self) {
        for vg in self.volume_groups.clone() {
            let spec = CommandSpec::new(
                ["lvs", "--noheadings", "-o", "lv_name", vg.as_str()],
                format!("List logical volumes in {}", vg),
            )
            .timeout(PROBE_TIMEOUT);
            let lvs = match self.runner.run(&spec) {
                Ok(out) => out.stdout,
                Err(e) => {
                    self.outcome.warn(format!("Failed to list logical volumes of {}: {}", vg, e));
                    continue;
                }
            };

            for lv in lvs.split_whitespace() {
                if let Err(e) = remove_dm_node(self.runner, &vg, lv) {
                    self.outcome.warn(format!("Failed to remove mapping {}/{}: {}", vg, lv, e));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // RescanPartitionTable
    // ------------------------------------------------------------------

    fn rescan_partition_tables(&mut self) {
        for disk in &self.plan.target_disks {
            let spec = CommandSpec::new(["partprobe", disk.as_str()], format!("Rescan partitions on {}", disk))
                .timeout(PROBE_TIMEOUT);
            if let Err(e) = self.runner.run(&spec) {
                self.outcome.warn(format!("partprobe {} failed: {}", disk, e));
            }
        }
        settle_udev(self.runner);
    }

    // ------------------------------------------------------------------
    // ExecutePartitionCommands
    // ------------------------------------------------------------------

    fn execute_partition_commands(&mut self) -> Result<()> {
        let total = self.commands.len();
        for (i, argv) in self.commands.iter().enumerate() {
            if argv.first().map(String::as_str) == Some("wipefs") {
                // Last chance before data is destroyed
                for device in &self.devices {
                    ensure_not_busy(self.runner, device)?;
                }
                if !self.settle_delay.is_zero() {
                    tracing::info!("Waiting {:?} for devices to settle", self.settle_delay);
                    thread::sleep(self.settle_delay);
                }
            }

            let description = format!("Storage command {}/{}: {}", i + 1, total, argv.join(" "));
            let spec = CommandSpec::new(argv.clone(), description).timeout(FORMAT_TIMEOUT);
            self.runner.run(&spec)?;
        }

        self.rescan_partition_tables();
        Ok(())
    }

    // ------------------------------------------------------------------
    // MountFilesystems
    // ------------------------------------------------------------------

    fn mount_filesystems(&mut self) -> Result<()> {
        if !self.partitions.iter().any(PartitionEntry::is_root) {
            return Err(InstallError::NoRootPartition);
        }
        self.mounted = MountPlan::new(&self.partitions).mount_all(self.runner, &self.target_root)?;
        Ok(())
    }
}

/// The disk plus every child device, from `lsblk`
fn list_block_devices(runner: &dyn CommandRunner, disk: &str) -> Result<Vec<String>> {
    let spec = CommandSpec::new(["lsblk", "-ln", "-o", "PATH", disk], format!("List devices on {}", disk))
        .timeout(PROBE_TIMEOUT);
    let out = runner.run(&spec)?;
    let mut devices: Vec<String> = Vec::new();
    for line in out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !devices.iter().any(|d| d == line) {
            devices.push(line.to_string());
        }
    }
    if !devices.iter().any(|d| d == disk) {
        devices.insert(0, disk.to_string());
    }
    Ok(devices)
}

/// Volume groups with a physical volume among `devices`
fn volume_groups_on(pvs_output: &str, devices: &[String]) -> BTreeSet<String> {
    pvs_output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let pv = cols.next()?;
            let vg = cols.next()?;
            devices.iter().any(|d| d == pv).then(|| vg.to_string())
        })
        .collect()
}

/// Fail with `BusyDevice` if any process holds `device` open
pub fn ensure_not_busy(runner: &dyn CommandRunner, device: &str) -> Result<()> {
    let spec = CommandSpec::new(["lsof", device], format!("Check open handles on {}", device))
        .timeout(PROBE_TIMEOUT);
    let stdout = match runner.run(&spec) {
        Ok(out) => out.stdout,
        // lsof exits 1 when nothing has the file open
        Err(e) if e.exit_code() == Some(1) => return Ok(()),
        Err(e) => return Err(e),
    };

    let holders = lsof_holders(&stdout);
    if holders.is_empty() {
        return Ok(());
    }
    tracing::error!("{} is held open by {}", device, holders.join(", "));
    Err(InstallError::BusyDevice {
        device: device.to_string(),
        holders: holders.join(", "),
    })
}

/// `command (pid)` for each process in `lsof` output
fn lsof_holders(output: &str) -> Vec<String> {
    let mut holders: Vec<String> = output
        .lines()
        .filter(|l| !l.starts_with("COMMAND"))
        .filter_map(|l| {
            let mut cols = l.split_whitespace();
            let command = cols.next()?;
            let pid = cols.next()?;
            Some(format!("{} ({})", command, pid))
        })
        .collect();
    holders.dedup();
    holders
}

/// Devices currently in use as swap
fn active_swaps(runner: &dyn CommandRunner) -> Vec<String> {
    let spec = CommandSpec::new(["swapon", "--show=NAME", "--noheadings"], "List active swap")
        .timeout(PROBE_TIMEOUT);
    runner
        .run(&spec)
        .map(|out| out.stdout.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
        .unwrap_or_default()
}

/// Remove the device-mapper node of `vg/lv`, by short name then full path
fn remove_dm_node(runner: &dyn CommandRunner, vg: &str, lv: &str) -> Result<()> {
    let short = format!("{}-{}", vg.replace('-', "--"), lv.replace('-', "--"));
    let full = format!("/dev/{}/{}", vg, lv);

    let mut last_err = None;
    for name in [short.as_str(), full.as_str()] {
        let spec = CommandSpec::new(["dmsetup", "remove", name], format!("Remove mapping {}", name))
            .timeout(PROBE_TIMEOUT);
        match runner.run(&spec) {
            Ok(_) => return Ok(()),
            Err(e) if is_already_gone(&e) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn is_already_gone(err: &InstallError) -> bool {
    err.stderr().is_some_and(|s| {
        s.contains("No such device") || s.contains("not found") || s.contains("does not exist")
    })
}

fn settle_udev(runner: &dyn CommandRunner) {
    let spec = CommandSpec::new(["udevadm", "settle"], "Wait for udev").timeout(PROBE_TIMEOUT);
    if let Err(e) = runner.run(&spec) {
        tracing::warn!("udevadm settle failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{RecordingRunner, Reply};
    use crate::progress::null_sink;
    use std::path::Path;

    fn automatic() -> DiskPlan {
        DiskPlan {
            method: PartitionMethod::Automatic,
            target_disks: vec!["/dev/sda".into()],
            filesystem: Filesystem::Btrfs,
            ..Default::default()
        }
    }

    fn sda_runner() -> RecordingRunner {
        RecordingRunner::new()
            .on_prefix(&["lsblk", "-ln"], Reply::stdout("/dev/sda\n/dev/sda1\n/dev/sda2\n"))
            .on_prefix(&["lsof"], Reply::fail(1, ""))
    }

    fn prepare(runner: &RecordingRunner, plan: &DiskPlan, root: &Path) -> Result<PreparedStorage> {
        StoragePreparation::new(runner, plan, root)
            .with_settle_delay(Duration::ZERO)
            .run(&ProgressReporter::new(null_sink()))
    }

    #[test]
    fn test_state_order_automatic() {
        let mut state = StorageState::IdentifyPartitions;
        let mut seen = vec![state];
        while let Some(next) = state.next(PartitionMethod::Automatic) {
            assert!(next as u8 > state as u8);
            seen.push(next);
            state = next;
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(
            StorageState::IdentifyPartitions.next(PartitionMethod::Manual),
            Some(StorageState::MountFilesystems)
        );
    }

    #[test]
    fn test_automatic_sequence_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sda_runner();
        let prepared = prepare(&runner, &automatic(), dir.path()).unwrap();

        let stop = runner.position("systemctl stop udisks2").unwrap();
        let pvs = runner.position("pvs --noheadings").unwrap();
        let busy = runner.position("lsof").unwrap();
        let wipe = runner.position("wipefs -a /dev/sda").unwrap();
        let label = runner.position("mklabel gpt").unwrap();
        let mkfs = runner.position("mkfs.btrfs -f /dev/sda2").unwrap();
        let mount = runner.position("mount -t btrfs").unwrap();
        let restart = runner.position("systemctl start udisks2").unwrap();
        assert!(stop < pvs && pvs < busy && busy < wipe);
        assert!(wipe < label && label < mkfs && mkfs < mount && mount < restart);

        assert_eq!(prepared.mounted.len(), 2);
        assert_eq!(prepared.partitions[1].device, "/dev/sda2");
    }

    #[test]
    fn test_busy_device_aborts_before_destruction() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new()
            .on_prefix(&["lsblk", "-ln"], Reply::stdout("/dev/sda\n/dev/sda1\n"))
            .on_prefix(&["lsof", "/dev/sda1"], Reply::stdout(
                "COMMAND  PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME\nbash    4242 live  cwd    DIR    8,1     4096    2 /run/media\n",
            ))
            .on_prefix(&["lsof"], Reply::fail(1, ""));

        let err = prepare(&runner, &automatic(), dir.path()).unwrap_err();
        match err {
            InstallError::BusyDevice { device, holders } => {
                assert_eq!(device, "/dev/sda1");
                assert_eq!(holders, "bash (4242)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        for destructive in ["wipefs", "parted", "mkfs"] {
            assert_eq!(runner.position(destructive), None, "{destructive} must not run");
        }
        // udisks2 comes back even on failure
        assert!(runner.position("systemctl start udisks2").is_some());
    }

    #[test]
    fn test_lvm_deactivated_and_mappings_removed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sda_runner()
            .on_prefix(&["pvs"], Reply::stdout("  /dev/sda2 fedora-vg\n  /dev/sdb1 other\n"))
            .on_prefix(&["lvs"], Reply::stdout("  root\n  swap\n"))
            .on_prefix(&["dmsetup", "remove", "fedora--vg-root"], Reply::fail(1, "Device fedora--vg-root not found"))
            .on_prefix(&["dmsetup", "remove", "fedora--vg-swap"], Reply::fail(1, "busy"));
        let prepared = prepare(&runner, &automatic(), dir.path()).unwrap();

        assert_eq!(runner.count("vgchange -an fedora-vg"), 1);
        assert_eq!(runner.count("vgchange -an other"), 0);
        // "not found" counts as removed, no full-path retry
        assert_eq!(runner.count("dmsetup remove /dev/fedora-vg/root"), 0);
        assert_eq!(runner.count("dmsetup remove /dev/fedora-vg/swap"), 1);
        assert!(prepared.outcome.is_clean());
    }

    #[test]
    fn test_lvm_failure_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sda_runner()
            .on_prefix(&["pvs"], Reply::stdout("/dev/sda2 vg0\n"))
            .on_prefix(&["vgchange"], Reply::fail(5, "Logical volume in use"));
        let prepared = prepare(&runner, &automatic(), dir.path()).unwrap();
        assert_eq!(prepared.outcome.warnings().len(), 1);
    }

    #[test]
    fn test_existing_mounts_and_swap_released() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sda_runner()
            .on_prefix(&["swapon"], Reply::stdout("/dev/sda2\n"))
            .on_prefix(&["findmnt", "-rn", "-o", "TARGET", "-S", "/dev/sda1"], Reply::stdout("/run/media/live/ESP\n"))
            .on_prefix(&["findmnt"], Reply::fail(1, ""));
        prepare(&runner, &automatic(), dir.path()).unwrap();
        let swapoff = runner.position("swapoff /dev/sda2").unwrap();
        let umount = runner.position("umount /run/media/live/ESP").unwrap();
        assert!(swapoff < runner.position("wipefs").unwrap());
        assert!(umount < runner.position("wipefs").unwrap());
        assert_eq!(runner.count("swapoff /dev/sda1"), 0);
    }

    #[test]
    fn test_supplied_commands_bypass_the_planner() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sda_runner();
        // FAT as the planner's root filesystem would be refused; the supplied layout is used instead
        let plan = DiskPlan {
            filesystem: Filesystem::Vfat,
            commands: vec![
                vec!["wipefs".into(), "-a".into(), "/dev/sda".into()],
                vec!["mkfs.xfs".into(), "-f".into(), "/dev/sda2".into()],
            ],
            partitions: vec![
                PartitionEntry::new("/dev/sda1", "/boot/efi", Filesystem::Vfat),
                PartitionEntry::new("/dev/sda2", "/", Filesystem::Xfs),
            ],
            ..automatic()
        };

        let prepared = prepare(&runner, &plan, dir.path()).unwrap();

        assert!(runner.position("mkfs.xfs -f /dev/sda2").is_some());
        assert_eq!(runner.position("parted"), None);
        assert_eq!(runner.count("mount -t xfs"), 1);
        assert_eq!(prepared.partitions[1].fstype, Filesystem::Xfs);
    }

    #[test]
    fn test_command_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sda_runner().on_prefix(&["mkfs.btrfs"], Reply::fail(1, "device too small"));
        let err = prepare(&runner, &automatic(), dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(runner.position("mount -t"), None);
    }

    #[test]
    fn test_manual_mode_never_formats() {
        let dir = tempfile::tempdir().unwrap();
        let plan = DiskPlan {
            method: PartitionMethod::Manual,
            partitions: vec![
                PartitionEntry::new("/dev/sdb1", "/boot/efi", Filesystem::Vfat),
                PartitionEntry::new("/dev/sdb3", "/", Filesystem::Ext4),
            ],
            dual_boot: true,
            ..Default::default()
        };
        let runner = RecordingRunner::new();
        let prepared = prepare(&runner, &plan, dir.path()).unwrap();
        for forbidden in ["wipefs", "parted", "mkfs", "systemctl stop"] {
            assert_eq!(runner.position(forbidden), None);
        }
        let lines = runner.command_lines();
        assert!(lines[0].starts_with("mount -t ext4 /dev/sdb3"));
        assert_eq!(prepared.mounted.len(), 2);
    }

    #[test]
    fn test_manual_mode_probes_layout() {
        let dir = tempfile::tempdir().unwrap();
        let plan = DiskPlan {
            method: PartitionMethod::Manual,
            target_disks: vec!["/dev/sdb".into()],
            ..Default::default()
        };
        let runner = RecordingRunner::new().on_prefix(
            &["lsblk", "-J"],
            Reply::stdout(
                r#"{"blockdevices":[{"path":"/dev/sdb","size":1000,"fstype":null,"type":"disk","children":[
                    {"path":"/dev/sdb1","size":536870912,"fstype":"vfat","type":"part"},
                    {"path":"/dev/sdb2","size":90000000000,"fstype":"xfs","type":"part"}]}]}"#,
            ),
        );
        let prepared = prepare(&runner, &plan, dir.path()).unwrap();
        assert_eq!(prepared.partitions[0].device, "/dev/sdb2");
        assert_eq!(prepared.partitions[1].device, "/dev/sdb1");
    }

    #[test]
    fn test_manual_mode_without_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let plan = DiskPlan {
            method: PartitionMethod::Manual,
            partitions: vec![PartitionEntry::new("/dev/sdb1", "/boot/efi", Filesystem::Vfat)],
            ..Default::default()
        };
        let runner = RecordingRunner::new();
        assert!(matches!(
            prepare(&runner, &plan, dir.path()),
            Err(InstallError::NoRootPartition)
        ));
        assert_eq!(runner.position("mount"), None);
    }

    #[test]
    fn test_volume_groups_on() {
        let devices = vec!["/dev/sda".to_string(), "/dev/sda2".to_string()];
        let vgs = volume_groups_on("  /dev/sda2 vg0\n  /dev/sdc1 vg1\n  /dev/sda3\n", &devices);
        assert_eq!(vgs.into_iter().collect::<Vec<_>>(), vec!["vg0"]);
    }
}
