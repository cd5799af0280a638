//! Legacy BIOS boot path: GRUB in the disk's MBR

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::chroot::ChrootManager;
use crate::command::CommandSpec;
use crate::error::Outcome;

pub const BIOS_PACKAGES: &[&str] = &["grub2-pc", "grub2-pc-modules"];

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const PACKAGE_TIMEOUT: Duration = Duration::from_secs(900);
const GRUB_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Make sure the BIOS GRUB packages are present in the target
pub fn ensure_packages(chroot: &ChrootManager<'_>, releasever: &str, outcome: &mut Outcome) {
    if chroot.run_argv(["rpm", "-q", "grub2-pc"], "Check for BIOS GRUB").is_ok() {
        return;
    }
    tracing::info!("grub2-pc missing in target, installing it");
    let mut argv = vec![
        "dnf".to_string(),
        "install".to_string(),
        "-y".to_string(),
        format!("--installroot={}", chroot.root().display()),
        format!("--releasever={}", releasever),
    ];
    argv.extend(BIOS_PACKAGES.iter().map(|p| p.to_string()));
    let spec = CommandSpec::new(argv, "Install BIOS GRUB packages").timeout(PACKAGE_TIMEOUT);
    if let Err(e) = chroot.runner().run(&spec) {
        outcome.warn(format!("BIOS GRUB packages could not be installed: {}", e));
    }
}

/// Install GRUB into the MBR of `disk`, retrying with the forced variant
pub fn install_mbr(chroot: &ChrootManager<'_>, disk: &str, outcome: &mut Outcome) {
    let standard = chroot.run_with_timeout(
        ["grub2-install", "--target=i386-pc", disk],
        &format!("Install GRUB to {}", disk),
        GRUB_INSTALL_TIMEOUT,
    );
    let Err(first) = standard else {
        return;
    };
    tracing::warn!("grub2-install failed ({}), retrying forced", first);

    let forced = chroot.run_with_timeout(
        ["grub2-install", "--target=i386-pc", "--force", "--skip-fs-probe", disk],
        &format!("Install GRUB to {} (forced)", disk),
        GRUB_INSTALL_TIMEOUT,
    );
    if let Err(e) = forced {
        outcome.warn(format!("GRUB could not be written to {}: {}", disk, e));
    }
}

/// True if the first sector of `disk` ends in the boot signature
pub fn has_boot_signature(disk: &Path) -> std::io::Result<bool> {
    let mut sector = [0u8; 512];
    File::open(disk)?.read_exact(&mut sector)?;
    Ok(sector[510..512] == MBR_SIGNATURE)
}

/// Check the MBR; problems are warnings
pub fn verify_mbr(disk: &str, outcome: &mut Outcome) {
    match has_boot_signature(Path::new(disk)) {
        Ok(true) => tracing::info!("Boot signature present on {}", disk),
        Ok(false) => outcome.warn(format!("No boot signature in the MBR of {}", disk)),
        Err(e) => outcome.warn(format!("Cannot read the MBR of {}: {}", disk, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{RecordingRunner, Reply};
    use crate::hardware::HostPaths;

    #[test]
    fn test_forced_retry_after_failure() {
        let (target, host) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let runner = RecordingRunner::new()
            .on_prefix(&["mountpoint"], Reply::fail(32, ""))
            .on(
                |spec| spec.argv.iter().any(|a| a == "grub2-install") && !spec.argv.iter().any(|a| a == "--force"),
                Reply::fail(1, "embedding is not possible"),
            );
        let chroot = ChrootManager::new(&runner, target.path(), HostPaths::rooted_at(host.path()));
        let mut outcome = Outcome::clean();
        install_mbr(&chroot, "/dev/sda", &mut outcome);
        assert!(outcome.is_clean());
        assert_eq!(runner.count("grub2-install --target=i386-pc --force --skip-fs-probe /dev/sda"), 1);
    }

    #[test]
    fn test_missing_package_installed_from_host() {
        let (target, host) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let runner = RecordingRunner::new()
            .on_prefix(&["mountpoint"], Reply::fail(32, ""))
            .on_contains("rpm -q grub2-pc", Reply::fail(1, "not installed"));
        let chroot = ChrootManager::new(&runner, target.path(), HostPaths::rooted_at(host.path()));
        let mut outcome = Outcome::clean();
        ensure_packages(&chroot, "41", &mut outcome);
        assert!(outcome.is_clean());
        assert_eq!(runner.count("dnf install -y --installroot="), 1);
        assert_eq!(runner.count("grub2-pc grub2-pc-modules"), 1);
    }

    #[test]
    fn test_boot_signature() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.img");
        let mut sector = vec![0u8; 1024];
        std::fs::write(&disk, &sector).unwrap();
        assert!(!has_boot_signature(&disk).unwrap());

        sector[510] = 0x55;
        sector[511] = 0xAA;
        std::fs::write(&disk, &sector).unwrap();
        assert!(has_boot_signature(&disk).unwrap());

        let mut outcome = Outcome::clean();
        verify_mbr(&dir.path().join("missing").to_string_lossy(), &mut outcome);
        assert_eq!(outcome.warnings().len(), 1);
    }
}
