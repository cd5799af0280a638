//! Mount and unmount primitives shared by the chroot, storage and
//! orchestration layers.
//!
//! Mounting is fatal on failure and rolls back what the same operation
//! mounted. Unmounting during cleanup never fails: a target that is already
//! gone counts as unmounted, a busy target is retried lazily, and anything
//! left over is logged.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{CommandRunner, CommandSpec};
use crate::config_file::PartitionEntry;
use crate::error::{InstallError, Outcome, Result};
use crate::types::Filesystem;

/// util-linux `mount`/`umount` exit code for "mount failure"
const EXIT_MOUNT_FAILURE: i32 = 32;

const MOUNT_TIMEOUT: Duration = Duration::from_secs(60);

/// True if `err` is `mount` reporting the target is already mounted
pub fn is_already_mounted(err: &InstallError) -> bool {
    err.exit_code() == Some(EXIT_MOUNT_FAILURE)
        && err.stderr().is_some_and(|s| s.contains("already mounted"))
}

/// True if `err` is `umount` reporting there is nothing to unmount
pub fn is_not_mounted(err: &InstallError) -> bool {
    err.exit_code() == Some(EXIT_MOUNT_FAILURE)
        && err.stderr().is_some_and(|s| {
            s.contains("not mounted") || s.contains("no mount point specified") || s.contains("No such file or directory")
        })
}

/// `path` joined under `root`, treating `path` as absolute inside the root
pub fn under_root(root: &Path, path: &str) -> PathBuf {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Whether `path` is a live mount point on the host (verified, not assumed)
pub fn is_mountpoint(runner: &dyn CommandRunner, path: &Path) -> bool {
    let spec = CommandSpec::new(
        ["mountpoint".to_string(), "-q".to_string(), path.to_string_lossy().into_owned()],
        format!("Check mount point {}", path.display()),
    )
    .timeout(Duration::from_secs(10));
    runner.run(&spec).is_ok()
}

/// Run `mount` with the given arguments, treating "already mounted" as success
pub fn mount(runner: &dyn CommandRunner, args: &[&str], target: &Path, source: &str) -> Result<()> {
    let mut argv = vec!["mount".to_string()];
    argv.extend(args.iter().map(|a| a.to_string()));
    argv.push(source.to_string());
    argv.push(target.to_string_lossy().into_owned());

    let spec = CommandSpec::new(argv, format!("Mount {} on {}", source, target.display()))
        .timeout(MOUNT_TIMEOUT);
    match runner.run(&spec) {
        Ok(_) => Ok(()),
        Err(e) if is_already_mounted(&e) => {
            tracing::debug!("{} already mounted", target.display());
            Ok(())
        }
        Err(e) => Err(InstallError::MountFailure {
            source_path: source.to_string(),
            target: target.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Unmount `target`, retrying with a lazy unmount on failure.
///
/// "Not mounted" is success, so calling this twice is harmless.
pub fn unmount(runner: &dyn CommandRunner, target: &Path) -> Result<()> {
    let path = target.to_string_lossy().into_owned();
    let spec = CommandSpec::new(["umount".to_string(), path.clone()], format!("Unmount {}", path))
        .timeout(MOUNT_TIMEOUT);
    let err = match runner.run(&spec) {
        Ok(_) => return Ok(()),
        Err(e) if is_not_mounted(&e) => return Ok(()),
        Err(e) => e,
    };

    tracing::warn!("Unmount of {} failed ({}), retrying lazily", path, err);
    let lazy = CommandSpec::new(
        ["umount".to_string(), "-l".to_string(), path.clone()],
        format!("Lazy unmount {}", path),
    )
    .timeout(MOUNT_TIMEOUT);
    match runner.run(&lazy) {
        Ok(_) => Ok(()),
        Err(e) if is_not_mounted(&e) => Ok(()),
        Err(e) => Err(InstallError::UnmountFailure {
            target: target.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Unmount each target in reverse order, logging failures
pub fn unmount_reverse(runner: &dyn CommandRunner, targets: &[PathBuf]) -> Outcome {
    let mut outcome = Outcome::clean();
    for target in targets.iter().rev() {
        if let Err(e) = unmount(runner, target) {
            outcome.warn(e.to_string());
        }
    }
    outcome
}

/// Partitions ordered so every mount point comes after its parents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    entries: Vec<PartitionEntry>,
}

impl MountPlan {
    pub fn new(partitions: &[PartitionEntry]) -> Self {
        let mut entries: Vec<PartitionEntry> = partitions
            .iter()
            .filter(|p| p.mountpoint.starts_with('/'))
            .cloned()
            .collect();
        // Stable sort keeps caller order between siblings
        entries.sort_by_key(|p| mount_depth(&p.mountpoint));
        Self { entries }
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// Mount every entry under `root`; on failure unmount what was mounted
    pub fn mount_all(&self, runner: &dyn CommandRunner, root: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(root)?;
        let mut mounted: Vec<PathBuf> = Vec::new();

        for entry in &self.entries {
            let target = under_root(root, &entry.mountpoint);
            let result = fs::create_dir_all(&target)
                .map_err(|e| InstallError::MountFailure {
                    source_path: entry.device.clone(),
                    target: target.clone(),
                    reason: format!("cannot create mount point: {}", e),
                })
                .and_then(|_| mount_partition(runner, entry, &target));

            if let Err(e) = result {
                tracing::error!("{}; rolling back {} mount(s)", e, mounted.len());
                unmount_reverse(runner, &mounted);
                return Err(e);
            }
            tracing::info!("Mounted {} on {}", entry.device, target.display());
            mounted.push(target);
        }

        Ok(mounted)
    }
}

fn mount_depth(mountpoint: &str) -> usize {
    mountpoint.split('/').filter(|c| !c.is_empty()).count()
}

fn mount_partition(runner: &dyn CommandRunner, entry: &PartitionEntry, target: &Path) -> Result<()> {
    let fstype = entry.fstype.mount_type();
    let mut args = vec!["-t", fstype];
    if let Some(options) = entry.fstype.mount_options() {
        args.push("-o");
        args.push(options);
    }
    mount(runner, &args, target, &entry.device)
}

/// Every mount point at or below `root`, as reported by `findmnt`
pub fn mounts_under(runner: &dyn CommandRunner, root: &Path) -> Vec<PathBuf> {
    let spec = CommandSpec::new(
        [
            "findmnt".to_string(),
            "-R".to_string(),
            "-n".to_string(),
            "-r".to_string(),
            "-o".to_string(),
            "TARGET".to_string(),
            root.to_string_lossy().into_owned(),
        ],
        format!("List mounts under {}", root.display()),
    )
    .timeout(Duration::from_secs(30));
    match runner.run(&spec) {
        Ok(out) => out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| PathBuf::from(unescape_findmnt(l)))
            .filter(|p| p.starts_with(root))
            .collect(),
        // findmnt exits 1 when nothing is mounted there
        Err(e) => {
            tracing::debug!("No mounts under {}: {}", root.display(), e);
            Vec::new()
        }
    }
}

/// Best-effort teardown of everything mounted at or below `root`, deepest first
pub fn unmount_tree(runner: &dyn CommandRunner, root: &Path) -> Outcome {
    let mut targets = mounts_under(runner, root);
    // Stacked mounts list the same target once per layer; each needs its own umount
    targets.sort_by_key(|p| p.components().count());
    tracing::info!("Unmounting {} mount(s) under {}", targets.len(), root.display());
    unmount_reverse(runner, &targets)
}

/// Decode `findmnt -r` hex escapes (`\x20` for space, `\xc3\xa9` for `é`)
fn unescape_findmnt(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            let decoded = bytes
                .get(i + 2..i + 4)
                .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Write `/etc/fstab` in the target for the mounted partition set
pub fn write_fstab(runner: &dyn CommandRunner, root: &Path, partitions: &[PartitionEntry]) -> Result<()> {
    let mut content = String::from(
        "# /etc/fstab: static file system information.\n#\n\
         # <file system> <mount point> <type> <options> <dump> <pass>\n",
    );

    for entry in MountPlan::new(partitions).entries() {
        let source = match device_uuid(runner, &entry.device) {
            Some(uuid) => format!("UUID={}", uuid),
            None => entry.device.clone(),
        };
        let options = match entry.fstype {
            Filesystem::Vfat => "umask=0077,shortname=winnt".to_string(),
            other => match other.mount_options() {
                Some(o) => format!("defaults,{}", o),
                None => "defaults".to_string(),
            },
        };
        let pass = if entry.is_root() { 1 } else { 2 };
        let _ = writeln!(
            content,
            "{} {} {} {} 0 {}",
            source,
            entry.mountpoint,
            entry.fstype.mount_type(),
            options,
            pass
        );
    }

    let etc = root.join("etc");
    fs::create_dir_all(&etc)?;
    fs::write(etc.join("fstab"), content)?;
    tracing::info!("Wrote {}", etc.join("fstab").display());
    Ok(())
}

fn device_uuid(runner: &dyn CommandRunner, device: &str) -> Option<String> {
    let spec = CommandSpec::new(
        ["blkid", "-s", "UUID", "-o", "value", device],
        format!("Read UUID of {}", device),
    )
    .timeout(Duration::from_secs(30));
    runner
        .run(&spec)
        .ok()
        .map(|o| o.stdout.trim().to_string())
        .filter(|u| !u.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{RecordingRunner, Reply};
    use proptest::prelude::*;

    fn parts() -> Vec<PartitionEntry> {
        vec![
            PartitionEntry::new("/dev/sda1", "/boot/efi", Filesystem::Vfat),
            PartitionEntry::new("/dev/sda3", "/home", Filesystem::Ext4),
            PartitionEntry::new("/dev/sda2", "/", Filesystem::Btrfs),
        ]
    }

    #[test]
    fn test_root_mounts_first() {
        let plan = MountPlan::new(&parts());
        let order: Vec<&str> = plan.entries().iter().map(|p| p.mountpoint.as_str()).collect();
        assert_eq!(order, vec!["/", "/home", "/boot/efi"]);
    }

    #[test]
    fn test_mount_all_uses_fat_options() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let mounted = MountPlan::new(&parts()).mount_all(&runner, dir.path()).unwrap();
        assert_eq!(mounted.len(), 3);
        assert!(dir.path().join("boot/efi").is_dir());
        let lines = runner.command_lines();
        assert!(lines[0].starts_with("mount -t btrfs"));
        assert!(lines[2].contains("-t vfat -o umask=0077"));
    }

    #[test]
    fn test_mount_failure_rolls_back_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new()
            .on_contains("/dev/sda1", Reply::fail(32, "wrong fs type"));
        let err = MountPlan::new(&parts()).mount_all(&runner, dir.path()).unwrap_err();
        assert!(matches!(err, InstallError::MountFailure { .. }));

        let lines = runner.command_lines();
        let umounts: Vec<&String> = lines.iter().filter(|l| l.starts_with("umount")).collect();
        assert_eq!(umounts.len(), 2);
        assert!(umounts[0].ends_with("/home"));
        assert!(umounts[1].ends_with(&dir.path().to_string_lossy().to_string()));
    }

    #[test]
    fn test_already_mounted_is_success() {
        let runner = RecordingRunner::new()
            .on_prefix(&["mount"], Reply::fail(32, "mount: /mnt/proc: proc already mounted on /mnt/proc."));
        assert!(mount(&runner, &["-t", "proc"], Path::new("/mnt/proc"), "proc").is_ok());
    }

    #[test]
    fn test_unmount_twice_is_idempotent() {
        let runner = RecordingRunner::new()
            .on_prefix(&["umount"], Reply::fail(32, "umount: /mnt/proc: not mounted."));
        assert!(unmount(&runner, Path::new("/mnt/proc")).is_ok());
        assert!(unmount(&runner, Path::new("/mnt/proc")).is_ok());
        assert_eq!(runner.count("umount -l"), 0);
    }

    #[test]
    fn test_busy_unmount_falls_back_to_lazy() {
        let runner = RecordingRunner::new()
            .on_prefix(&["umount", "/mnt/sys"], Reply::fail(32, "target is busy."));
        assert!(unmount(&runner, Path::new("/mnt/sys")).is_ok());
        assert_eq!(runner.command_lines(), vec!["umount /mnt/sys", "umount -l /mnt/sys"]);
    }

    #[test]
    fn test_unmount_tree_deepest_first() {
        let runner = RecordingRunner::new().on_prefix(
            &["findmnt"],
            Reply::stdout("/mnt/sysimage\n/mnt/sysimage/boot/efi\n/mnt/sysimage/boot\n"),
        );
        let outcome = unmount_tree(&runner, Path::new("/mnt/sysimage"));
        assert!(outcome.is_clean());
        let umounts: Vec<String> = runner
            .command_lines()
            .into_iter()
            .filter(|l| l.starts_with("umount"))
            .collect();
        assert_eq!(
            umounts,
            vec![
                "umount /mnt/sysimage/boot/efi",
                "umount /mnt/sysimage/boot",
                "umount /mnt/sysimage"
            ]
        );
    }

    #[test]
    fn test_unescape_findmnt() {
        assert_eq!(unescape_findmnt("/mnt/my\\x20disk"), "/mnt/my disk");
        assert_eq!(unescape_findmnt("/run/media/ren\\xc3\\xa9e/USB"), "/run/media/renée/USB");
        assert_eq!(unescape_findmnt("/mnt/odd\\xzz"), "/mnt/odd\\xzz");
    }

    #[test]
    fn test_unmount_tree_peels_stacked_mounts() {
        let runner = RecordingRunner::new().on_prefix(
            &["findmnt"],
            Reply::stdout("/mnt/sysimage\n/mnt/sysimage/boot\n/mnt/sysimage/boot\n"),
        );
        let outcome = unmount_tree(&runner, Path::new("/mnt/sysimage"));
        assert!(outcome.is_clean());
        assert_eq!(runner.count("umount /mnt/sysimage/boot"), 2);
        assert_eq!(runner.command_lines().last().map(String::as_str), Some("umount /mnt/sysimage"));
    }

    #[test]
    fn test_write_fstab_prefers_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new()
            .on_contains("blkid -s UUID -o value /dev/sda2", Reply::stdout("abcd-1234\n"));
        write_fstab(&runner, dir.path(), &parts()).unwrap();
        let fstab = std::fs::read_to_string(dir.path().join("etc/fstab")).unwrap();
        assert!(fstab.contains("UUID=abcd-1234 / btrfs defaults,compress=zstd:1 0 1"));
        assert!(fstab.contains("/dev/sda1 /boot/efi vfat umask=0077,shortname=winnt 0 2"));
    }

    proptest! {
        #[test]
        fn root_always_precedes_nested(extra in proptest::collection::vec("[a-z]{1,6}(/[a-z]{1,6}){0,2}", 0..6), root_pos in 0usize..6) {
            let mut partitions: Vec<PartitionEntry> = extra
                .iter()
                .enumerate()
                .map(|(i, p)| PartitionEntry::new(format!("/dev/vd{}", i), format!("/{}", p), Filesystem::Ext4))
                .collect();
            let pos = root_pos.min(partitions.len());
            partitions.insert(pos, PartitionEntry::new("/dev/vdz", "/", Filesystem::Btrfs));

            let plan = MountPlan::new(&partitions);
            prop_assert_eq!(plan.entries()[0].mountpoint.as_str(), "/");
            for (i, entry) in plan.entries().iter().enumerate() {
                for later in &plan.entries()[i + 1..] {
                    let nested_under_later = later.mountpoint != "/"
                        && entry.mountpoint.starts_with(&format!("{}/", later.mountpoint));
                    prop_assert!(!nested_under_later, "{} mounted before its parent {}", entry.mountpoint, later.mountpoint);
                }
            }
        }
    }
}
