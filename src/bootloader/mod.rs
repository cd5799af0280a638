//! Bootloader installation
//!
//! ```text
//! DetectFirmware
//!     ├── UEFI: PrepareEsp → LocateBinaries → CopyToEsp → RegisterBootEntry
//!     └── BIOS: InstallMbr
//!     ↓
//! GenerateConfig → RegenerateInitramfs → Verify → Done
//! ```
//!
//! Every fallback along the way degrades to a warning. The only failures are
//! an unusable ESP, no kernel at all, and no valid `grub.cfg` at the end.

pub mod bios;
pub mod efi;
pub mod grub;

use std::fmt;

use crate::chroot::ChrootManager;
use crate::config_file::InstallationConfig;
use crate::engine::storage::split_partition_path;
use crate::error::{InstallError, Outcome, Result};
use crate::hardware::{self, HostPaths};
use crate::progress::ProgressReporter;
use crate::types::FirmwareMode;

use self::efi::{EfiBinaries, Esp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BootStage {
    DetectFirmware = 0,
    PrepareEsp = 1,
    LocateBinaries = 2,
    CopyToEsp = 3,
    RegisterBootEntry = 4,
    InstallMbr = 5,
    GenerateConfig = 6,
    RegenerateInitramfs = 7,
    Verify = 8,
    Done = 9,
}

impl BootStage {
    pub const fn next(self, firmware: FirmwareMode) -> Option<Self> {
        match (self, firmware) {
            (Self::DetectFirmware, FirmwareMode::Uefi) => Some(Self::PrepareEsp),
            (Self::DetectFirmware, FirmwareMode::Bios) => Some(Self::InstallMbr),
            (Self::PrepareEsp, _) => Some(Self::LocateBinaries),
            (Self::LocateBinaries, _) => Some(Self::CopyToEsp),
            (Self::CopyToEsp, _) => Some(Self::RegisterBootEntry),
            (Self::RegisterBootEntry, _) | (Self::InstallMbr, _) => Some(Self::GenerateConfig),
            (Self::GenerateConfig, _) => Some(Self::RegenerateInitramfs),
            (Self::RegenerateInitramfs, _) => Some(Self::Verify),
            (Self::Verify, _) => Some(Self::Done),
            (Self::Done, _) => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::DetectFirmware => "Detecting firmware",
            Self::PrepareEsp => "Preparing EFI System Partition",
            Self::LocateBinaries => "Locating boot loader binaries",
            Self::CopyToEsp => "Installing EFI binaries",
            Self::RegisterBootEntry => "Registering boot entry",
            Self::InstallMbr => "Installing GRUB to MBR",
            Self::GenerateConfig => "Generating GRUB configuration",
            Self::RegenerateInitramfs => "Regenerating initramfs",
            Self::Verify => "Verifying boot loader",
            Self::Done => "Boot loader installed",
        }
    }

    const fn fraction(self) -> f64 {
        (self as u8) as f64 / (Self::Done as u8) as f64
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Drives the boot stages for one target
pub struct BootloaderInstallation<'c, 'a> {
    chroot: &'c ChrootManager<'a>,
    config: &'c InstallationConfig,
    host: &'c HostPaths,
    firmware: FirmwareMode,
    stage: BootStage,
    history: Vec<BootStage>,
    esp: Option<Esp>,
    binaries: EfiBinaries,
    outcome: Outcome,
}

impl<'c, 'a> BootloaderInstallation<'c, 'a> {
    pub fn new(chroot: &'c ChrootManager<'a>, config: &'c InstallationConfig, host: &'c HostPaths) -> Self {
        Self {
            chroot,
            config,
            host,
            firmware: FirmwareMode::Bios,
            stage: BootStage::DetectFirmware,
            history: Vec::new(),
            esp: None,
            binaries: EfiBinaries::default(),
            outcome: Outcome::clean(),
        }
    }

    pub fn history(&self) -> &[BootStage] {
        &self.history
    }

    pub fn run(mut self, progress: &ProgressReporter) -> Result<Outcome> {
        while self.stage != BootStage::Done {
            progress.report(self.stage.description(), self.stage.fraction());
            tracing::info!(stage = ?self.stage, "{}", self.stage);
            self.execute_stage()?;
            self.history.push(self.stage);
            self.stage = self.stage.next(self.firmware).unwrap_or(BootStage::Done);
        }
        progress.report(BootStage::Done.description(), 1.0);
        Ok(self.outcome)
    }

    fn vendor(&self) -> &'c str {
        &self.config.bootloader.vendor_id
    }

    /// Disk receiving the MBR: the plan's disk, or the one holding `/`
    fn boot_disk(&self) -> Option<String> {
        self.config.disk.primary_disk().map(str::to_string).or_else(|| {
            self.config
                .disk
                .root_partition()
                .and_then(|p| split_partition_path(&p.device))
                .map(|(disk, _)| disk)
        })
    }

    fn esp_device(&self) -> Option<&'c str> {
        self.config
            .bootloader
            .efi_partition
            .as_deref()
            .or_else(|| self.config.disk.efi_partition().map(|p| p.device.as_str()))
    }

    fn execute_stage(&mut self) -> Result<()> {
        match self.stage {
            BootStage::DetectFirmware => {
                self.firmware = hardware::detect_firmware_mode(self.host);
            }
            BootStage::PrepareEsp => {
                let esp = efi::prepare_esp(self.chroot, self.esp_device(), &mut self.outcome)?;
                self.esp = Some(esp);
            }
            BootStage::LocateBinaries => {
                self.binaries = efi::locate_or_build(self.chroot, self.vendor(), &self.host.live_root, &mut self.outcome);
            }
            BootStage::CopyToEsp => {
                if let Some(esp) = &self.esp {
                    efi::copy_to_esp(esp, self.vendor(), &self.binaries, &mut self.outcome);
                }
            }
            BootStage::RegisterBootEntry => {
                if let Some(esp) = &self.esp {
                    let label = &self.config.bootloader.entry_label;
                    efi::register_boot_entry(self.chroot, esp, self.vendor(), label, &self.binaries, &mut self.outcome);
                }
            }
            BootStage::InstallMbr => {
                let disk = self
                    .boot_disk()
                    .ok_or_else(|| InstallError::config("no disk to install the BIOS boot loader on"))?;
                bios::ensure_packages(self.chroot, &hardware::release_version(self.host), &mut self.outcome);
                bios::install_mbr(self.chroot, &disk, &mut self.outcome);
            }
            BootStage::GenerateConfig => {
                let generated = grub::generate_config(self.chroot, self.esp.as_ref(), self.vendor())?;
                self.outcome.merge(generated);
            }
            BootStage::RegenerateInitramfs => {
                self.outcome.merge(grub::regenerate_initramfs(self.chroot));
            }
            BootStage::Verify => self.verify()?,
            BootStage::Done => {}
        }
        Ok(())
    }

    fn verify(&mut self) -> Result<()> {
        match (&self.esp, self.firmware) {
            (Some(esp), FirmwareMode::Uefi) => efi::verify_files(esp, self.vendor(), &mut self.outcome),
            _ => {
                if let Some(disk) = self.boot_disk() {
                    bios::verify_mbr(&disk, &mut self.outcome);
                }
            }
        }
        let cfg = grub::verify_config(self.chroot.root(), self.esp.as_ref(), self.vendor())?;
        tracing::info!("Boot loader verified, configuration at {}", cfg.display());
        Ok(())
    }
}

/// Install and verify the boot loader for `config`.
///
/// Skipped entirely when the config disables boot loader installation.
pub fn install(
    chroot: &ChrootManager<'_>,
    config: &InstallationConfig,
    host: &HostPaths,
    progress: &ProgressReporter,
) -> Result<Outcome> {
    if !config.bootloader.install_bootloader {
        tracing::info!("Boot loader installation disabled, skipping");
        progress.report("Boot loader skipped", 1.0);
        return Ok(Outcome::clean());
    }
    BootloaderInstallation::new(chroot, config, host).run(progress)
}
