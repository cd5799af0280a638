//! Chroot sessions over the target root
//!
//! Each chrooted command gets a fresh session: the kernel API filesystems
//! are mounted under the target, the command runs via `chroot`, and the
//! session guard unmounts everything in reverse order when it goes out of
//! scope, whether the command succeeded, failed or panicked.
//!
//! # Boot mounts
//!
//! `/boot` is bind-mounted onto itself so tools inside the chroot see it as
//! its own mount. That bind hides an EFI System Partition mounted below it,
//! so the ESP is mounted again on top, by device. Both are *kept*: the
//! bootloader phase needs the ESP across several chroot invocations, and
//! `ChrootManager::release_kept_mounts` removes them once it is finished.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{InstallError, Outcome, Result};
use crate::hardware::HostPaths;
use crate::mounts;

/// How a chroot mount is produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// `mount -t <fstype> [-o options] <source> <target>`
    Virtual {
        fstype: &'static str,
        source: &'static str,
        options: Option<&'static str>,
    },
    /// `mount --bind <source> <target>`
    Bind { source: PathBuf },
    /// `mount <device> <target>` of an already-mounted block device
    Device { device: String },
}

/// One planned mount under the target root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootMount {
    pub name: &'static str,
    pub target: PathBuf,
    pub kind: MountKind,
    /// Target is a file (socket bind), not a directory
    pub file_target: bool,
    /// Left mounted at session end; released explicitly
    pub keep: bool,
}

impl ChrootMount {
    fn virtual_fs(root: &Path, name: &'static str, rel: &str, fstype: &'static str, options: Option<&'static str>) -> Self {
        Self {
            name,
            target: root.join(rel),
            kind: MountKind::Virtual {
                fstype,
                source: fstype,
                options,
            },
            file_target: false,
            keep: false,
        }
    }

    fn mount(&self, runner: &dyn CommandRunner) -> Result<()> {
        match &self.kind {
            MountKind::Virtual { fstype, source, options } => {
                let mut args = vec!["-t", *fstype];
                if let Some(o) = options {
                    args.push("-o");
                    args.push(o);
                }
                mounts::mount(runner, &args, &self.target, source)
            }
            MountKind::Bind { source } => {
                mounts::mount(runner, &["--bind"], &self.target, &source.to_string_lossy())
            }
            MountKind::Device { device } => mounts::mount(runner, &[], &self.target, device),
        }
    }

    /// Create the mount target: a directory, or an empty placeholder file
    fn ensure_target(&self) -> Result<()> {
        let created = if self.file_target {
            if let Some(parent) = self.target.parent() {
                fs::create_dir_all(parent)?;
            }
            if self.target.exists() {
                Ok(())
            } else {
                fs::File::create(&self.target).map(|_| ())
            }
        } else {
            fs::create_dir_all(&self.target)
        };
        created.map_err(|e| InstallError::MountFailure {
            source_path: self.name.to_string(),
            target: self.target.clone(),
            reason: format!("cannot create mount target: {}", e),
        })
    }
}

/// Runs commands inside a target root
pub struct ChrootManager<'a> {
    runner: &'a dyn CommandRunner,
    root: PathBuf,
    host: HostPaths,
    kept: Mutex<Vec<PathBuf>>,
}

impl<'a> ChrootManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, root: impl Into<PathBuf>, host: HostPaths) -> Self {
        Self {
            runner,
            root: root.into(),
            host,
            kept: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    /// Mounts currently kept alive across sessions
    pub fn kept_mounts(&self) -> Vec<PathBuf> {
        match self.kept.lock() {
            Ok(k) => k.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn is_kept(&self, target: &Path) -> bool {
        self.kept_mounts().iter().any(|k| k == target)
    }

    /// Compute the mount set for a session
    pub fn plan_mounts(&self) -> Vec<ChrootMount> {
        let root = self.root.as_path();
        let mut plan = vec![
            ChrootMount::virtual_fs(root, "proc", "proc", "proc", None),
            ChrootMount::virtual_fs(root, "sysfs", "sys", "sysfs", None),
            ChrootMount::virtual_fs(root, "devtmpfs", "dev", "devtmpfs", None),
            ChrootMount::virtual_fs(root, "devpts", "dev/pts", "devpts", Some("gid=5,mode=620")),
        ];

        if self.host.has_efivars() {
            plan.push(ChrootMount::virtual_fs(
                root,
                "efivarfs",
                "sys/firmware/efi/efivars",
                "efivarfs",
                None,
            ));
        }

        if self.host.has_dbus_socket() {
            plan.push(ChrootMount {
                name: "dbus",
                target: root.join("run/dbus/system_bus_socket"),
                kind: MountKind::Bind {
                    source: self.host.dbus_socket.clone(),
                },
                file_target: true,
                keep: false,
            });
        }

        let boot = root.join("boot");
        let esp = root.join("boot/efi");
        // Must be probed before /boot is bound over it
        let esp_device = if self.is_kept(&esp) {
            None
        } else if mounts::is_mountpoint(self.runner, &esp) {
            mount_source(self.runner, &esp)
        } else {
            None
        };

        if boot.is_dir() && !self.is_kept(&boot) {
            plan.push(ChrootMount {
                name: "boot",
                target: boot.clone(),
                kind: MountKind::Bind { source: boot.clone() },
                file_target: false,
                keep: esp_device.is_some(),
            });
        }

        if let Some(device) = esp_device {
            plan.push(ChrootMount {
                name: "efi",
                target: esp,
                kind: MountKind::Device { device },
                file_target: false,
                keep: true,
            });
        }

        plan
    }

    /// Run a command inside the target root
    pub fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let mut session = ChrootSession::new(self);
        for planned in self.plan_mounts() {
            planned.ensure_target()?;
            planned.mount(self.runner)?;
            tracing::debug!("chroot mount {} on {}", planned.name, planned.target.display());
            session.mounted.push(planned);
        }

        let chrooted = spec.in_chroot(&self.root);
        tracing::info!(mode = "chroot", "{}", chrooted.description);
        self.runner.run(&chrooted)
    }

    /// Run `argv` inside the target root with the default timeout
    pub fn run_argv<I, S>(&self, argv: I, description: &str) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run(CommandSpec::new(argv, description))
    }

    /// Run with an explicit timeout
    pub fn run_with_timeout<I, S>(&self, argv: I, description: &str, timeout: Duration) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run(CommandSpec::new(argv, description).timeout(timeout))
    }

    /// Unmount the kept boot mounts (ESP first). Safe to call repeatedly.
    pub fn release_kept_mounts(&self) -> Outcome {
        let kept = match self.kept.lock() {
            Ok(mut k) => std::mem::take(&mut *k),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if !kept.is_empty() {
            tracing::info!("Releasing {} kept boot mount(s)", kept.len());
        }
        mounts::unmount_reverse(self.runner, &kept)
    }
}

/// Device mounted at `path`, via `findmnt`
fn mount_source(runner: &dyn CommandRunner, path: &Path) -> Option<String> {
    let spec = CommandSpec::new(
        [
            "findmnt".to_string(),
            "-n".to_string(),
            "-o".to_string(),
            "SOURCE".to_string(),
            path.to_string_lossy().into_owned(),
        ],
        format!("Find device mounted on {}", path.display()),
    )
    .timeout(Duration::from_secs(10));
    runner
        .run(&spec)
        .ok()
        .and_then(|o| o.stdout.lines().next().map(|l| l.trim().to_string()))
        .filter(|s| !s.is_empty())
}

/// Active mounts of one chroot invocation; unmounted on drop
struct ChrootSession<'m, 'a> {
    manager: &'m ChrootManager<'a>,
    mounted: Vec<ChrootMount>,
}

impl<'m, 'a> ChrootSession<'m, 'a> {
    fn new(manager: &'m ChrootManager<'a>) -> Self {
        Self {
            manager,
            mounted: Vec::new(),
        }
    }

    /// Unmount everything not kept, in reverse mount order
    fn cleanup(&mut self) {
        let mounted = std::mem::take(&mut self.mounted);
        if let Ok(mut kept) = self.manager.kept.lock() {
            for m in mounted.iter().filter(|m| m.keep) {
                if !kept.contains(&m.target) {
                    kept.push(m.target.clone());
                }
            }
        }
        for m in mounted.iter().rev().filter(|m| !m.keep) {
            if let Err(e) = mounts::unmount(self.manager.runner, &m.target) {
                tracing::warn!("chroot cleanup: {}", e);
            }
        }
    }
}

impl Drop for ChrootSession<'_, '_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
