//! GRUB configuration and initramfs images

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chroot::ChrootManager;
use crate::error::{InstallError, Outcome, Result};
use crate::mounts;

use super::efi::Esp;

/// Primary GRUB configuration, as seen inside the target
pub const GRUB_CFG: &str = "/boot/grub2/grub.cfg";
/// Path some tools and older firmware setups still read
pub const LEGACY_GRUB_CFG: &str = "/boot/grub/grub.cfg";

/// Anything smaller than this is a truncated or placeholder config
pub const MIN_GRUB_CFG_SIZE: u64 = 100;
pub const MIN_INITRAMFS_SIZE: u64 = 1024 * 1024;

const MKCONFIG_TIMEOUT: Duration = Duration::from_secs(300);
const DRACUT_TIMEOUT: Duration = Duration::from_secs(900);

fn large_enough(path: &Path, min: u64) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() >= min).unwrap_or(false)
}

/// A config with boot entries, either inline or through BLS
pub fn has_boot_entries(content: &str) -> bool {
    content.contains("menuentry") || content.contains("blscfg")
}

/// Kernel versions with a `vmlinuz-<version>` image in `<root>/boot`.
///
/// Rescue images are skipped.
pub fn installed_kernels(target_root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(target_root.join("boot")) else {
        return Vec::new();
    };
    let mut versions: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter_map(|name| name.strip_prefix("vmlinuz-").map(str::to_string))
        .filter(|version| !version.contains("rescue"))
        .collect();
    versions.sort();
    versions
}

/// Generate `grub.cfg` inside the target and check what came out.
///
/// A config without entries is acceptable only when a kernel exists (BLS
/// entries are picked up at boot); with no kernel at all this fails.
pub fn generate_config(chroot: &ChrootManager<'_>, esp: Option<&Esp>, vendor: &str) -> Result<Outcome> {
    let mut outcome = Outcome::clean();
    let root = chroot.root();
    for dir in ["/boot/grub2", "/boot/grub"] {
        fs::create_dir_all(mounts::under_root(root, dir))?;
    }

    if let Err(e) = chroot.run_with_timeout(["grub2-mkconfig", "-o", GRUB_CFG], "Generate GRUB configuration", MKCONFIG_TIMEOUT) {
        outcome.warn(format!("grub2-mkconfig failed: {}", e));
    }

    let cfg = mounts::under_root(root, GRUB_CFG);
    let content = fs::read_to_string(&cfg).unwrap_or_default();
    if !has_boot_entries(&content) {
        let kernels = installed_kernels(root);
        if kernels.is_empty() {
            return Err(InstallError::bootloader("no kernel image found in /boot"));
        }
        outcome.warn(format!(
            "GRUB configuration has no menu entries; relying on boot loader entries for {}",
            kernels.join(", ")
        ));
    }

    if !large_enough(&cfg, MIN_GRUB_CFG_SIZE) {
        outcome.warn(format!("{} is missing or truncated", GRUB_CFG));
        return Ok(outcome);
    }

    if let Some(esp) = esp {
        let copies = [esp.vendor_dir(vendor).join("grub.cfg"), mounts::under_root(root, LEGACY_GRUB_CFG)];
        for dest in copies {
            let result = dest
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|_| fs::copy(&cfg, &dest));
            if let Err(e) = result {
                outcome.warn(format!("Cannot copy GRUB configuration to {}: {}", dest.display(), e));
            }
        }
    }

    Ok(outcome)
}

/// Rebuild the initramfs of every installed kernel. Failures are warnings.
pub fn regenerate_initramfs(chroot: &ChrootManager<'_>) -> Outcome {
    let mut outcome = Outcome::clean();
    let kernels = installed_kernels(chroot.root());
    if kernels.is_empty() {
        outcome.warn("No kernels found, initramfs not regenerated");
        return outcome;
    }

    for version in kernels {
        let image = format!("/boot/initramfs-{}.img", version);
        let dracut = chroot.run_with_timeout(
            ["dracut", "--force", image.as_str(), version.as_str()],
            &format!("Build initramfs for {}", version),
            DRACUT_TIMEOUT,
        );
        if let Err(e) = dracut {
            tracing::warn!("dracut failed for {} ({}), trying kernel-install", version, e);
            let kernel = format!("/lib/modules/{}/vmlinuz", version);
            if let Err(e) = chroot.run_with_timeout(
                ["kernel-install", "add", version.as_str(), kernel.as_str()],
                &format!("Install kernel {}", version),
                DRACUT_TIMEOUT,
            ) {
                outcome.warn(format!("Initramfs for {} could not be built: {}", version, e));
                continue;
            }
        }

        if !large_enough(&mounts::under_root(chroot.root(), &image), MIN_INITRAMFS_SIZE) {
            outcome.warn(format!("{} is missing or suspiciously small", image));
        }
    }
    outcome
}

/// Locations a usable GRUB configuration may live at
pub fn config_candidates(target_root: &Path, esp: Option<&Esp>, vendor: &str) -> Vec<PathBuf> {
    let mut candidates = vec![
        mounts::under_root(target_root, GRUB_CFG),
        mounts::under_root(target_root, LEGACY_GRUB_CFG),
    ];
    if let Some(esp) = esp {
        candidates.push(esp.vendor_dir(vendor).join("grub.cfg"));
    }
    candidates
}

/// Fails when no candidate holds a config of plausible size
pub fn verify_config(target_root: &Path, esp: Option<&Esp>, vendor: &str) -> Result<PathBuf> {
    config_candidates(target_root, esp, vendor)
        .into_iter()
        .find(|p| large_enough(p, MIN_GRUB_CFG_SIZE))
        .ok_or_else(|| InstallError::bootloader("no valid GRUB configuration was produced"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, RecordingRunner, Reply};
    use crate::hardware::HostPaths;

    const BLS_CONFIG: &str = "### BEGIN /etc/grub.d/10_linux ###\ninsmod blscfg\nblscfg\n### END /etc/grub.d/10_linux ###\n# padding padding padding padding padding padding\n";

    fn mkconfig_writes(cfg: PathBuf, content: &'static str) -> Reply {
        Reply::with(move |_| {
            fs::write(&cfg, content)?;
            Ok(CommandOutput::default())
        })
    }

    #[test]
    fn test_kernel_listing_skips_rescue() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        for name in ["vmlinuz-6.11.4-301.fc41.x86_64", "vmlinuz-0-rescue-abc", "initramfs-x.img", "vmlinuz-6.10.1-200.fc41.x86_64"] {
            fs::write(boot.join(name), "k").unwrap();
        }
        assert_eq!(
            installed_kernels(dir.path()),
            vec!["6.10.1-200.fc41.x86_64", "6.11.4-301.fc41.x86_64"]
        );
    }

    #[test]
    fn test_config_copied_to_esp_and_legacy_path() {
        let (target, host) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let cfg = target.path().join("boot/grub2/grub.cfg");
        let runner = RecordingRunner::new()
            .on_prefix(&["mountpoint"], Reply::fail(32, ""))
            .on_contains("grub2-mkconfig", mkconfig_writes(cfg, BLS_CONFIG));
        let chroot = ChrootManager::new(&runner, target.path(), HostPaths::rooted_at(host.path()));
        let esp = Esp {
            device: "/dev/sda1".into(),
            mountpoint: target.path().join("boot/efi"),
        };

        let outcome = generate_config(&chroot, Some(&esp), "fedora").unwrap();
        assert!(outcome.is_clean());
        assert_eq!(fs::read_to_string(target.path().join("boot/efi/EFI/fedora/grub.cfg")).unwrap(), BLS_CONFIG);
        assert_eq!(fs::read_to_string(target.path().join("boot/grub/grub.cfg")).unwrap(), BLS_CONFIG);
        assert!(verify_config(target.path(), Some(&esp), "fedora").is_ok());
    }

    #[test]
    fn test_no_entries_and_no_kernel_fails() {
        let (target, host) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let runner = RecordingRunner::new().on_prefix(&["mountpoint"], Reply::fail(32, ""));
        let chroot = ChrootManager::new(&runner, target.path(), HostPaths::rooted_at(host.path()));
        let err = generate_config(&chroot, None, "fedora").unwrap_err();
        assert!(matches!(err, InstallError::BootloaderFailure(_)));
    }

    #[test]
    fn test_no_entries_with_kernel_is_warning() {
        let (target, host) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        fs::create_dir_all(target.path().join("boot")).unwrap();
        fs::write(target.path().join("boot/vmlinuz-6.11.4"), "k").unwrap();
        let cfg = target.path().join("boot/grub2/grub.cfg");
        let runner = RecordingRunner::new()
            .on_prefix(&["mountpoint"], Reply::fail(32, ""))
            .on_contains("grub2-mkconfig", mkconfig_writes(cfg, "set timeout=5\n"));
        let chroot = ChrootManager::new(&runner, target.path(), HostPaths::rooted_at(host.path()));
        let outcome = generate_config(&chroot, None, "fedora").unwrap();
        // no entries, and too small to count as a config
        assert_eq!(outcome.warnings().len(), 2);
        assert!(verify_config(target.path(), None, "fedora").is_err());
    }

    #[test]
    fn test_initramfs_falls_back_to_kernel_install() {
        let (target, host) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        fs::create_dir_all(target.path().join("boot")).unwrap();
        fs::write(target.path().join("boot/vmlinuz-6.11.4"), "k").unwrap();
        let image = target.path().join("boot/initramfs-6.11.4.img");
        let runner = RecordingRunner::new()
            .on_prefix(&["mountpoint"], Reply::fail(32, ""))
            .on_contains("dracut", Reply::fail(1, "dracut: cannot find module"))
            .on_contains(
                "kernel-install add",
                Reply::with(move |_| {
                    fs::write(&image, vec![0u8; MIN_INITRAMFS_SIZE as usize])?;
                    Ok(CommandOutput::default())
                }),
            );
        let chroot = ChrootManager::new(&runner, target.path(), HostPaths::rooted_at(host.path()));
        let outcome = regenerate_initramfs(&chroot);
        assert!(outcome.is_clean());
        assert_eq!(runner.count("kernel-install add 6.11.4 /lib/modules/6.11.4/vmlinuz"), 1);
    }

    #[test]
    fn test_small_initramfs_is_warning() {
        let (target, host) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        fs::create_dir_all(target.path().join("boot")).unwrap();
        fs::write(target.path().join("boot/vmlinuz-6.11.4"), "k").unwrap();
        let runner = RecordingRunner::new().on_prefix(&["mountpoint"], Reply::fail(32, ""));
        let chroot = ChrootManager::new(&runner, target.path(), HostPaths::rooted_at(host.path()));
        let outcome = regenerate_initramfs(&chroot);
        assert_eq!(outcome.warnings().len(), 1);
        assert_eq!(runner.count("dracut --force /boot/initramfs-6.11.4.img 6.11.4"), 1);
    }
}
