//! Package installation into the target root
//!
//! One `dnf --installroot` transaction installs the whole package set,
//! with its stdout streamed through the `progress` parser. Custom
//! repositories are applied first and Flatpak applications last; both of
//! those degrade to warnings.

pub mod flatpak;
pub mod progress;
pub mod repos;

use std::time::Duration;

use crate::chroot::ChrootManager;
use crate::command::CommandSpec;
use crate::config_file::PackageConfig;
use crate::error::{InstallError, Outcome, Result};
use crate::hardware::{self, HostPaths};
use crate::progress::ProgressReporter;

use self::progress::TransactionProgress;

/// Vendor branding packages that conflict with the installed release
pub const CONFLICTING_PREFIXES: &[&str] = &["fedora-release-", "generic-release", "generic-logos"];

/// Package set used for minimal installs
pub const MINIMAL_PACKAGES: &[&str] = &[
    "@core",
    "kernel",
    "kernel-modules",
    "dracut",
    "grub2-tools",
    "grub2-pc",
    "grub2-efi-x64",
    "shim-x64",
    "efibootmgr",
    "NetworkManager",
    "sudo",
    "passwd",
    "glibc-langpack-en",
];

/// Heavyweight optional applications kept out of every install
pub const EXCLUDED_PACKAGES: &[&str] = &[
    "libreoffice*",
    "gnome-boxes",
    "rhythmbox",
    "thunderbird",
    "totem",
];

const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// True if `name` starts with a known conflicting vendor prefix
pub fn is_conflicting(name: &str) -> bool {
    CONFLICTING_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// The package list that will actually be requested
pub fn resolve_packages(config: &PackageConfig) -> Vec<String> {
    let requested: Vec<String> = if config.minimal_install {
        MINIMAL_PACKAGES.iter().map(|p| p.to_string()).collect()
    } else if config.packages.is_empty() {
        tracing::info!("No packages requested, using the minimal set");
        MINIMAL_PACKAGES.iter().map(|p| p.to_string()).collect()
    } else {
        config.packages.clone()
    };

    let mut resolved: Vec<String> = Vec::with_capacity(requested.len());
    for name in requested {
        let name = name.trim().to_string();
        if name.is_empty() || resolved.contains(&name) {
            continue;
        }
        if is_conflicting(&name) {
            tracing::info!("Skipping conflicting package {}", name);
            continue;
        }
        resolved.push(name);
    }
    resolved
}

/// Full `dnf` argv for the base transaction
pub fn build_install_command(
    target_root: &std::path::Path,
    releasever: &str,
    config: &PackageConfig,
    packages: &[String],
) -> Vec<String> {
    let mut argv = vec![
        "dnf".to_string(),
        "install".to_string(),
        "-y".to_string(),
        format!("--installroot={}", target_root.display()),
        format!("--releasever={}", releasever),
        "--setopt=install_weak_deps=False".to_string(),
    ];
    if config.keep_cache {
        argv.push("--setopt=keepcache=True".to_string());
    }
    if !config.repositories.is_empty() {
        argv.push(format!(
            "--setopt=reposdir={},/etc/yum.repos.d",
            repos::repos_dir(target_root).display()
        ));
    }
    argv.extend(EXCLUDED_PACKAGES.iter().map(|p| format!("--exclude={}", p)));
    argv.extend(packages.iter().cloned());
    argv
}

/// Install the configured package set into the chroot's target root.
///
/// Requires full privileges. Returns the warnings of the non-fatal phases.
pub fn install(
    chroot: &ChrootManager<'_>,
    config: &PackageConfig,
    host: &HostPaths,
    progress: &ProgressReporter,
) -> Result<Outcome> {
    let runner = chroot.runner();
    if !runner.is_privileged() {
        return Err(InstallError::NotPrivileged("Package installation".to_string()));
    }

    let mut outcome = Outcome::clean();
    let releasever = hardware::release_version(host);
    tracing::info!("Installing packages for release {}", releasever);

    if !config.repositories.is_empty() {
        progress.message("Configuring repositories");
        outcome.merge(repos::setup_repositories(
            runner,
            chroot.root(),
            &releasever,
            &config.repositories,
        ));
    }

    let packages = resolve_packages(config);
    tracing::info!("Installing {} package(s)", packages.len());
    let argv = build_install_command(chroot.root(), &releasever, config, &packages);
    let spec = CommandSpec::new(argv, "Install packages").timeout(TRANSACTION_TIMEOUT);

    let transaction = if config.flatpak_enabled { progress.sub_range(0.0, 0.9) } else { progress.clone() };
    let mut parser = TransactionProgress::new();
    let result = runner.run_streaming(&spec, &mut |line| {
        if let Some(update) = parser.feed(line) {
            let message = match update.counter {
                Some((done, total)) => format!("{} ({}/{})", update.phase, done, total),
                None => update.phase.to_string(),
            };
            transaction.report(&message, update.fraction);
        }
    });

    match result {
        Ok(_) => transaction.report("Packages installed", 1.0),
        Err(InstallError::CommandFailed { code, stderr, .. }) => {
            return Err(InstallError::PackageManagerFailure {
                code,
                stderr: stderr.trim().to_string(),
            });
        }
        Err(e) => return Err(e),
    }

    if config.flatpak_enabled {
        outcome.merge(flatpak::install_flatpaks(
            chroot,
            &releasever,
            &config.flatpak_packages,
            &progress.sub_range(0.9, 1.0),
        ));
    }

    Ok(outcome)
}
