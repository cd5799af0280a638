//! Shared fixtures for the pipeline tests
//!
//! `FakeHost` stands in for the live system: it records every command, keeps
//! a mount table that `mount`/`umount`/`findmnt`/`mountpoint` agree on, and
//! produces the files the real tools would leave in the target (kernel,
//! grub.cfg, initramfs).

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rootstrap::command::{CommandOutput, CommandRunner, CommandSpec};
use rootstrap::config_file::{InstallationConfig, PartitionEntry};
use rootstrap::error::{InstallError, Result};
use rootstrap::installer::InstallationContext;
use rootstrap::progress::{CancellationToken, ProgressSink};
use rootstrap::types::{Filesystem, PartitionMethod};
use rootstrap::HostPaths;

pub const KERNEL: &str = "6.11.4-301.fc41.x86_64";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

#[derive(Default)]
pub struct FakeHost {
    mounts: Mutex<Vec<MountRecord>>,
    calls: Mutex<Vec<CommandSpec>>,
    /// `lsblk -ln -o PATH` output
    devices: String,
    /// Device reported as held open by `lsof`
    busy: Option<String>,
    /// Program whose invocation fails with exit code 1
    failing: Option<String>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            devices: "/dev/sda\n/dev/sda1\n/dev/sda2\n".to_string(),
            ..Default::default()
        }
    }

    pub fn with_busy(mut self, device: &str) -> Self {
        self.busy = Some(device.to_string());
        self
    }

    pub fn with_failing(mut self, program: &str) -> Self {
        self.failing = Some(program.to_string());
        self
    }

    pub fn mounts(&self) -> Vec<MountRecord> {
        self.mounts.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.to_string()).collect()
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.command_lines().iter().position(|l| l.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.command_lines().iter().filter(|l| l.contains(needle)).count()
    }

    /// Invocations of `program`, on the host or inside a chroot
    pub fn runs_of(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| effective_program(c) == Some(program))
            .collect()
    }

    pub fn count_program(&self, program: &str) -> usize {
        self.runs_of(program).len()
    }

    fn fail(spec: &CommandSpec, code: i32, stderr: &str) -> Result<CommandOutput> {
        Err(InstallError::CommandFailed {
            description: spec.description.clone(),
            code,
            stderr: stderr.to_string(),
        })
    }

    fn handle(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        // Chrooted commands act on files below the chroot directory
        let (root, argv): (Option<PathBuf>, Vec<&str>) = if spec.program() == "chroot" {
            (
                spec.argv.get(1).map(PathBuf::from),
                spec.argv.iter().skip(2).map(String::as_str).collect(),
            )
        } else {
            (None, spec.argv.iter().map(String::as_str).collect())
        };
        let Some(&program) = argv.first() else {
            return Ok(CommandOutput::default());
        };

        if self.failing.as_deref() == Some(program) {
            return Self::fail(spec, 1, &format!("{}: simulated failure", program));
        }

        match program {
            "mount" => {
                let n = argv.len();
                let source = argv[n - 2].to_string();
                let mut mounts = self.mounts.lock().unwrap();
                // Without -t the type is probed, which here means "as last mounted"
                let fstype = match argv.iter().position(|a| *a == "-t").and_then(|i| argv.get(i + 1)) {
                    Some(t) => t.to_string(),
                    None if argv.contains(&"--bind") => "bind".to_string(),
                    None => mounts
                        .iter()
                        .find(|m| m.source == source)
                        .map(|m| m.fstype.clone())
                        .unwrap_or_else(|| "auto".to_string()),
                };
                mounts.push(MountRecord {
                    source,
                    target: PathBuf::from(argv[n - 1]),
                    fstype,
                });
                Ok(CommandOutput::default())
            }
            "umount" => {
                let target = PathBuf::from(argv[argv.len() - 1]);
                let mut mounts = self.mounts.lock().unwrap();
                match mounts.iter().rposition(|m| m.target == target) {
                    Some(i) => {
                        mounts.remove(i);
                        Ok(CommandOutput::default())
                    }
                    None => Self::fail(spec, 32, &format!("umount: {}: not mounted.", target.display())),
                }
            }
            "mountpoint" => {
                let target = PathBuf::from(argv[argv.len() - 1]);
                if self.mounts.lock().unwrap().iter().any(|m| m.target == target) {
                    Ok(CommandOutput::default())
                } else {
                    Self::fail(spec, 32, "")
                }
            }
            "findmnt" => self.findmnt(spec, &argv),
            "lsblk" if argv.get(1) == Some(&"-ln") => Ok(CommandOutput::stdout(self.devices.clone())),
            "lsof" => match &self.busy {
                Some(device) if argv.get(1) == Some(&device.as_str()) => Ok(CommandOutput::stdout(
                    "COMMAND  PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME\n\
                     nautilus 2718 live  cwd    DIR    8,1     4096    2 /run/media/live\n",
                )),
                _ => Self::fail(spec, 1, ""),
            },
            "dnf" if argv.get(1) == Some(&"install") => {
                if let Some(target) = argv.iter().find_map(|a| a.strip_prefix("--installroot=")) {
                    write_file(&Path::new(target).join(format!("boot/vmlinuz-{}", KERNEL)), b"kernel image");
                }
                Ok(CommandOutput::stdout("Running transaction\nComplete!\n"))
            }
            "grub2-mkconfig" => {
                if let (Some(root), Some(out)) = (&root, argv.last()) {
                    let content = format!("set timeout=5\ninsmod blscfg\nblscfg\n{}\n", "#".repeat(128));
                    write_file(&root.join(out.trim_start_matches('/')), content.as_bytes());
                }
                Ok(CommandOutput::default())
            }
            "grub2-install" if argv.contains(&"--target=x86_64-efi") => {
                let vendor = argv.iter().find_map(|a| a.strip_prefix("--bootloader-id="));
                if let (Some(root), Some(vendor)) = (&root, vendor) {
                    write_file(&root.join(format!("boot/efi/EFI/{}/grubx64.efi", vendor)), b"generated grub");
                }
                Ok(CommandOutput::default())
            }
            "dracut" => {
                if let (Some(root), Some(image)) = (&root, argv.get(2)) {
                    write_file(&root.join(image.trim_start_matches('/')), &vec![0u8; 2 * 1024 * 1024]);
                }
                Ok(CommandOutput::default())
            }
            _ => Ok(CommandOutput::default()),
        }
    }

    fn findmnt(&self, spec: &CommandSpec, argv: &[&str]) -> Result<CommandOutput> {
        let mounts = self.mounts.lock().unwrap();
        let last = argv[argv.len() - 1];
        let lines: Vec<String> = if argv.contains(&"-R") {
            let root = Path::new(last);
            mounts
                .iter()
                .filter(|m| m.target.starts_with(root))
                .map(|m| m.target.to_string_lossy().into_owned())
                .collect()
        } else if argv.contains(&"-S") {
            mounts
                .iter()
                .filter(|m| m.source == last)
                .map(|m| m.target.to_string_lossy().into_owned())
                .collect()
        } else {
            let field = argv.iter().position(|a| *a == "-o").and_then(|i| argv.get(i + 1));
            let target = Path::new(last);
            mounts
                .iter()
                .rev()
                .find(|m| m.target == target)
                .and_then(|m| match field {
                    Some(&"SOURCE") => Some(m.source.clone()),
                    Some(&"FSTYPE") => Some(m.fstype.clone()),
                    _ => None,
                })
                .into_iter()
                .collect()
        };

        if lines.is_empty() {
            // findmnt exits 1 when nothing matches
            return Self::fail(spec, 1, "");
        }
        let mut stdout = lines.join("\n");
        stdout.push('\n');
        Ok(CommandOutput::stdout(stdout))
    }
}

/// The program a spec runs, looking through `chroot <root>`
fn effective_program(spec: &CommandSpec) -> Option<&str> {
    match spec.program() {
        "chroot" => spec.argv.get(2).map(String::as_str),
        program => Some(program),
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        self.handle(spec)
    }

    fn is_privileged(&self) -> bool {
        true
    }
}

pub fn write_file(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Scratch host and target directories for one installation
pub struct Sandbox {
    pub host: tempfile::TempDir,
    pub target: tempfile::TempDir,
}

impl Sandbox {
    /// BIOS host with nothing in its live root
    pub fn bios() -> Self {
        Self {
            host: tempfile::tempdir().unwrap(),
            target: tempfile::tempdir().unwrap(),
        }
    }

    /// UEFI host shipping shim and GRUB EFI images in its live root
    pub fn uefi() -> Self {
        let sandbox = Self::bios();
        fs::create_dir_all(sandbox.host.path().join("sys/firmware/efi")).unwrap();
        write_file(&sandbox.host.path().join("usr/share/shim/x64/shimx64.efi"), b"shim image");
        write_file(&sandbox.host.path().join("usr/lib/grub/x86_64-efi/grubx64.efi"), b"grub image");
        sandbox
    }

    pub fn host_paths(&self) -> HostPaths {
        HostPaths::rooted_at(self.host.path())
    }

    pub fn context(&self, cancel: CancellationToken, sink: ProgressSink) -> InstallationContext {
        InstallationContext::default()
            .with_target_root(self.target.path())
            .with_host(self.host_paths())
            .with_cancellation(cancel)
            .with_sink(sink)
            .with_settle_delay(std::time::Duration::ZERO)
    }
}

/// Whole-disk automatic install on /dev/sda
pub fn automatic_config() -> InstallationConfig {
    let mut config = InstallationConfig::default();
    config.disk.method = PartitionMethod::Automatic;
    config.disk.target_disks = vec!["/dev/sda".to_string()];
    config.disk.filesystem = Filesystem::Btrfs;
    config.network.hostname = Some("workstation".to_string());
    config
}

/// Manual layout reusing an ext4 root on `disk`
pub fn manual_config(disk: &Path) -> InstallationConfig {
    let mut config = InstallationConfig::default();
    config.disk.method = PartitionMethod::Manual;
    config.disk.target_disks = vec![disk.to_string_lossy().into_owned()];
    config.disk.partitions = vec![PartitionEntry::new("/dev/vda2", "/", Filesystem::Ext4)];
    config
}

/// Progress sink that records every update
pub fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<(String, Option<f64>)>>>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&updates);
    let sink: ProgressSink = Arc::new(move |message: &str, fraction: Option<f64>| {
        captured.lock().unwrap().push((message.to_string(), fraction));
    });
    (sink, updates)
}
