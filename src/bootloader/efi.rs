//! UEFI boot path: EFI System Partition, shim/GRUB binaries, boot entry

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::chroot::ChrootManager;
use crate::command::CommandSpec;
use crate::engine::storage::{split_partition_path, EFI_MOUNTPOINT};
use crate::error::{InstallError, Outcome, Result};
use crate::mounts;
use crate::types::Filesystem;

pub const SHIM_BINARY: &str = "shimx64.efi";
pub const GRUB_BINARY: &str = "grubx64.efi";
/// Platform default loader name, used by firmware without a boot entry
pub const FALLBACK_BINARY: &str = "BOOTX64.EFI";
pub const FALLBACK_DIR: &str = "EFI/BOOT";

const WRITE_PROBE: &str = ".rootstrap-write-probe";
const SEARCH_DEPTH: usize = 6;
const GRUB_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const EFIBOOTMGR_TIMEOUT: Duration = Duration::from_secs(60);

/// The mounted EFI System Partition of the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esp {
    pub device: String,
    /// Host path of the ESP mount (`<target>/boot/efi`)
    pub mountpoint: PathBuf,
}

impl Esp {
    pub fn vendor_dir(&self, vendor: &str) -> PathBuf {
        self.mountpoint.join("EFI").join(vendor)
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.mountpoint.join(FALLBACK_DIR)
    }
}

/// Resolve the ESP device, mount it if needed, and check it is usable.
///
/// `explicit` wins; otherwise whatever is mounted on the target's
/// `/boot/efi` is used.
pub fn prepare_esp(chroot: &ChrootManager<'_>, explicit: Option<&str>, outcome: &mut Outcome) -> Result<Esp> {
    let runner = chroot.runner();
    let mountpoint = mounts::under_root(chroot.root(), EFI_MOUNTPOINT);
    let mounted = mounts::is_mountpoint(runner, &mountpoint);

    let device = match explicit {
        Some(device) => device.to_string(),
        None if mounted => findmnt_field(chroot, &mountpoint, "SOURCE")
            .ok_or_else(|| InstallError::bootloader("cannot determine the EFI System Partition device"))?,
        None => return Err(InstallError::bootloader("no EFI System Partition configured or mounted")),
    };
    tracing::info!("EFI System Partition: {}", device);

    if !mounted {
        fs::create_dir_all(&mountpoint)?;
        let fat = Filesystem::Vfat;
        let mut args = vec!["-t", fat.mount_type()];
        if let Some(options) = fat.mount_options() {
            args.push("-o");
            args.push(options);
        }
        mounts::mount(runner, &args, &mountpoint, &device)?;
    }

    let probe = mountpoint.join(WRITE_PROBE);
    fs::write(&probe, b"probe")
        .and_then(|_| fs::remove_file(&probe))
        .map_err(|e| InstallError::bootloader(format!("EFI System Partition is not writable: {}", e)))?;

    match findmnt_field(chroot, &mountpoint, "FSTYPE") {
        Some(fstype) if Filesystem::from_probe(&fstype).is_some_and(Filesystem::is_fat) => {}
        Some(fstype) => outcome.warn(format!("EFI System Partition has filesystem '{}', expected FAT", fstype)),
        None => tracing::debug!("Could not read ESP filesystem type"),
    }

    Ok(Esp { device, mountpoint })
}

fn findmnt_field(chroot: &ChrootManager<'_>, path: &Path, field: &str) -> Option<String> {
    let spec = CommandSpec::new(
        [
            "findmnt".to_string(),
            "-n".to_string(),
            "-o".to_string(),
            field.to_string(),
            path.to_string_lossy().into_owned(),
        ],
        format!("Read {} of {}", field, path.display()),
    )
    .timeout(Duration::from_secs(10));
    chroot
        .runner()
        .run(&spec)
        .ok()
        .and_then(|o| o.stdout.lines().next().map(|l| l.trim().to_string()))
        .filter(|s| !s.is_empty())
}

/// Well-known locations of a binary, relative to a root, highest priority first
pub fn well_known_paths(binary: &str, vendor: &str) -> Vec<String> {
    match binary {
        SHIM_BINARY => vec![
            format!("boot/efi/EFI/{}/shimx64.efi", vendor),
            "usr/share/shim/x64/shimx64.efi".to_string(),
            "usr/share/shim/shimx64.efi".to_string(),
            "usr/lib/shim/shimx64.efi.signed".to_string(),
            "usr/lib/shim/shimx64.efi".to_string(),
        ],
        _ => vec![
            format!("boot/efi/EFI/{}/grubx64.efi", vendor),
            "usr/lib/grub/x86_64-efi-signed/grubx64.efi.signed".to_string(),
            "usr/lib/grub/x86_64-efi/grubx64.efi".to_string(),
        ],
    }
}

/// Installed-package library locations of a GRUB EFI image, last resort
const GRUB_LIBRARY_PATHS: &[&str] = &[
    "usr/lib/grub/x86_64-efi/monolithic/grubx64.efi",
    "usr/lib/grub2/x86_64-efi/grubx64.efi",
    "usr/share/grub2/x86_64-efi/grubx64.efi",
];

fn non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// First existing, non-empty candidate under any of `roots`
pub fn find_in(roots: &[&Path], candidates: &[String]) -> Option<PathBuf> {
    candidates
        .iter()
        .flat_map(|rel| roots.iter().map(move |root| root.join(rel)))
        .find(|p| non_empty(p))
}

/// Case-insensitive file search below `dir`
pub fn search_tree(dir: &Path, binary: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(SEARCH_DEPTH)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| entry.file_name().to_string_lossy().eq_ignore_ascii_case(binary) && entry.metadata().map(|m| m.len() > 0).unwrap_or(false))
        .map(|entry| entry.into_path())
}

/// Locate a binary in the target and the live environment
pub fn locate(binary: &str, vendor: &str, target_root: &Path, live_root: &Path) -> Option<PathBuf> {
    find_in(&[target_root, live_root], &well_known_paths(binary, vendor))
        .or_else(|| search_tree(&target_root.join("boot"), binary))
}

/// Resolved EFI binaries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EfiBinaries {
    pub shim: Option<PathBuf>,
    pub grub: Option<PathBuf>,
}

/// Find shim and GRUB; build GRUB in place if it is missing
pub fn locate_or_build(
    chroot: &ChrootManager<'_>,
    vendor: &str,
    live_root: &Path,
    outcome: &mut Outcome,
) -> EfiBinaries {
    let root = chroot.root();
    let shim = locate(SHIM_BINARY, vendor, root, live_root);
    match &shim {
        Some(p) => tracing::info!("Found shim at {}", p.display()),
        None => outcome.warn("No shim binary found, Secure Boot will not be available"),
    }

    let mut grub = locate(GRUB_BINARY, vendor, root, live_root);
    if grub.is_none() {
        tracing::warn!("No GRUB EFI binary found, generating one with grub2-install");
        grub = build_grub(chroot, vendor, live_root);
    }
    match &grub {
        Some(p) => tracing::info!("Using GRUB EFI binary {}", p.display()),
        None => outcome.warn("No GRUB EFI binary could be found or generated"),
    }

    EfiBinaries { shim, grub }
}

fn grub_install_efi(vendor: &str) -> Vec<String> {
    vec![
        "grub2-install".to_string(),
        "--target=x86_64-efi".to_string(),
        "--efi-directory=/boot/efi".to_string(),
        format!("--bootloader-id={}", vendor),
        "--no-nvram".to_string(),
    ]
}

fn build_grub(chroot: &ChrootManager<'_>, vendor: &str, live_root: &Path) -> Option<PathBuf> {
    let root = chroot.root();
    let generated = [format!("boot/efi/EFI/{}/grubx64.efi", vendor)];

    let primary = CommandSpec::new(grub_install_efi(vendor), "Generate GRUB EFI binary").timeout(GRUB_INSTALL_TIMEOUT);
    match chroot.run(primary) {
        Ok(_) => {
            if let Some(found) = find_in(&[root], &generated) {
                return Some(found);
            }
        }
        Err(e) => tracing::warn!("grub2-install failed: {}", e),
    }

    let mut argv = grub_install_efi(vendor);
    argv.push("--force".to_string());
    argv.push("--removable".to_string());
    let forced = CommandSpec::new(argv, "Generate GRUB EFI binary (forced)").timeout(GRUB_INSTALL_TIMEOUT);
    match chroot.run(forced) {
        Ok(_) => {
            let removable = [generated[0].clone(), format!("boot/efi/{}/{}", FALLBACK_DIR, FALLBACK_BINARY)];
            if let Some(found) = find_in(&[root], &removable) {
                return Some(found);
            }
        }
        Err(e) => tracing::warn!("Forced grub2-install failed: {}", e),
    }

    let library: Vec<String> = GRUB_LIBRARY_PATHS.iter().map(|s| s.to_string()).collect();
    find_in(&[root, live_root], &library)
}

/// Copy `src` to `dest` unless they are the same file; check the result
fn copy_checked(src: &Path, dest: &Path, outcome: &mut Outcome) {
    let same = match (fs::canonicalize(src), fs::canonicalize(dest)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same {
        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                outcome.warn(format!("Cannot create {}: {}", parent.display(), e));
                return;
            }
        }
        if let Err(e) = fs::copy(src, dest) {
            outcome.warn(format!("Copy {} -> {} failed: {}", src.display(), dest.display(), e));
            return;
        }
    }
    if non_empty(dest) {
        tracing::info!("Installed {}", dest.display());
    } else {
        outcome.warn(format!("{} is empty after copy", dest.display()));
    }
}

/// Populate the vendor directory and the generic fallback directory
pub fn copy_to_esp(esp: &Esp, vendor: &str, binaries: &EfiBinaries, outcome: &mut Outcome) {
    let vendor_dir = esp.vendor_dir(vendor);
    let fallback_dir = esp.fallback_dir();

    if let Some(shim) = &binaries.shim {
        copy_checked(shim, &vendor_dir.join(SHIM_BINARY), outcome);
        copy_checked(shim, &vendor_dir.join(FALLBACK_BINARY), outcome);
        copy_checked(shim, &fallback_dir.join(FALLBACK_BINARY), outcome);
    }
    if let Some(grub) = &binaries.grub {
        copy_checked(grub, &vendor_dir.join(GRUB_BINARY), outcome);
        copy_checked(grub, &fallback_dir.join(GRUB_BINARY), outcome);
        if binaries.shim.is_none() {
            copy_checked(grub, &fallback_dir.join(FALLBACK_BINARY), outcome);
        }
    }
}

/// Loader path as firmware expects it: `\EFI\<vendor>\<binary>`
pub fn loader_path(vendor: &str, binary: &str) -> String {
    format!("\\EFI\\{}\\{}", vendor, binary)
}

fn efibootmgr(disk: &str, partition: u32, label: &str, loader: &str) -> CommandSpec {
    CommandSpec::new(
        [
            "efibootmgr".to_string(),
            "-c".to_string(),
            "-d".to_string(),
            disk.to_string(),
            "-p".to_string(),
            partition.to_string(),
            "-L".to_string(),
            label.to_string(),
            "-l".to_string(),
            loader.to_string(),
        ],
        format!("Register boot entry {}", loader),
    )
    .timeout(EFIBOOTMGR_TIMEOUT)
}

/// Register a firmware boot entry, trying each strategy in turn.
///
/// Exhausting every strategy is a warning, never an error.
pub fn register_boot_entry(
    chroot: &ChrootManager<'_>,
    esp: &Esp,
    vendor: &str,
    label: &str,
    binaries: &EfiBinaries,
    outcome: &mut Outcome,
) {
    let runner = chroot.runner();
    let location = split_partition_path(&esp.device);
    let primary_loader = if binaries.shim.is_some() { SHIM_BINARY } else { GRUB_BINARY };

    if let Some((disk, part)) = &location {
        match runner.run(&efibootmgr(disk, *part, label, &loader_path(vendor, primary_loader))) {
            Ok(_) => return,
            Err(e) => tracing::warn!("Standard boot entry registration failed: {}", e),
        }
    }

    let mut removable = grub_install_efi(vendor);
    removable.retain(|a| a != "--no-nvram");
    removable.push("--removable".to_string());
    match chroot.run(CommandSpec::new(removable, "Register boot loader as removable media").timeout(GRUB_INSTALL_TIMEOUT)) {
        Ok(_) => {
            // --removable writes unsigned GRUB over the fallback loader; shim has to stay first
            if let Some(shim) = binaries.shim.as_deref().filter(|s| non_empty(s)) {
                copy_checked(shim, &esp.fallback_dir().join(FALLBACK_BINARY), outcome);
            }
            return;
        }
        Err(e) => tracing::warn!("Removable-media registration failed: {}", e),
    }

    if let Some((disk, part)) = &location {
        match runner.run(&efibootmgr(disk, *part, label, &loader_path(vendor, GRUB_BINARY))) {
            Ok(_) => return,
            Err(e) => tracing::warn!("Alternate loader registration failed: {}", e),
        }
    }

    if non_empty(&esp.fallback_dir().join(FALLBACK_BINARY)) {
        tracing::info!("Relying on {}/{} for booting", FALLBACK_DIR, FALLBACK_BINARY);
        return;
    }

    outcome.warn("No boot entry could be registered; the system may not boot without manual firmware setup");
}

/// Critical EFI files that must exist and be non-empty
pub fn verify_files(esp: &Esp, vendor: &str, outcome: &mut Outcome) {
    let mut critical = vec![esp.vendor_dir(vendor).join(GRUB_BINARY), esp.fallback_dir().join(FALLBACK_BINARY)];
    if esp.vendor_dir(vendor).join(SHIM_BINARY).exists() {
        critical.push(esp.vendor_dir(vendor).join(SHIM_BINARY));
    }
    for file in critical {
        if !non_empty(&file) {
            outcome.warn(format!("Missing or empty EFI file {}", file.display()));
        }
    }
}
