//! System configuration and user provisioning
//!
//! Locale, keymap, timezone and hostname are written straight into the
//! target's `/etc`; the target is not running, so `localectl` and friends
//! have nothing to talk to. User accounts are created through the chroot.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

use crate::chroot::ChrootManager;
use crate::command::CommandSpec;
use crate::config_file::{InstallationConfig, UserConfig};
use crate::error::{InstallError, Outcome, Result};

/// Group granting administrative (sudo) rights
pub const ADMIN_GROUP: &str = "wheel";
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Write timezone, locale, keymap and hostname files.
///
/// Each artifact is optional and independent; every failure is collected
/// and reported together in one `ConfigWriteFailure`.
pub fn write_system_config(target_root: &Path, config: &InstallationConfig) -> Result<Outcome> {
    let mut outcome = Outcome::clean();
    let mut failures: Vec<String> = Vec::new();
    let etc = target_root.join("etc");
    if let Err(e) = fs::create_dir_all(&etc) {
        return Err(InstallError::ConfigWriteFailure(vec![format!(
            "{}: {}",
            etc.display(),
            e
        )]));
    }

    if let Some(tz) = config.timedate.timezone.as_deref() {
        match write_timezone(target_root, tz) {
            Ok(true) => {}
            Ok(false) => outcome.warn(format!(
                "Zoneinfo for '{}' not found in target, /etc/localtime not linked",
                tz
            )),
            Err(e) => failures.push(format!("timezone: {}", e)),
        }
    }

    if let Some(locale) = config.language.locale.as_deref() {
        if let Err(e) = fs::write(etc.join("locale.conf"), format!("LANG={}\n", locale)) {
            failures.push(format!("locale: {}", e));
        }
    }

    if let Some(keymap) = config.keyboard.keymap.as_deref() {
        if let Err(e) = fs::write(etc.join("vconsole.conf"), format!("KEYMAP={}\n", keymap)) {
            failures.push(format!("keymap: {}", e));
        }
    }

    if let Some(hostname) = config.network.hostname.as_deref() {
        if let Err(e) = fs::write(etc.join("hostname"), format!("{}\n", hostname.trim())) {
            failures.push(format!("hostname: {}", e));
        }
    }

    if failures.is_empty() {
        Ok(outcome)
    } else {
        Err(InstallError::ConfigWriteFailure(failures))
    }
}

/// Write `/etc/timezone` and link `/etc/localtime`.
///
/// Returns `Ok(false)` when the zoneinfo file is missing in the target.
fn write_timezone(target_root: &Path, tz: &str) -> io::Result<bool> {
    let etc = target_root.join("etc");
    fs::write(etc.join("timezone"), format!("{}\n", tz))?;

    let zoneinfo = format!("/usr/share/zoneinfo/{}", tz);
    if !target_root.join(zoneinfo.trim_start_matches('/')).exists() {
        return Ok(false);
    }
    let localtime = etc.join("localtime");
    if localtime.symlink_metadata().is_ok() {
        fs::remove_file(&localtime)?;
    }
    symlink(&zoneinfo, &localtime)?;
    Ok(true)
}

/// Create the initial user account inside the target.
///
/// The password is set only when one was supplied; a failure to set it is a
/// warning and the account stays.
pub fn create_user(chroot: &ChrootManager<'_>, user: &UserConfig) -> Result<Outcome> {
    let mut outcome = Outcome::clean();

    let mut argv: Vec<String> = vec![
        "useradd".into(),
        "-m".into(),
        "-s".into(),
        DEFAULT_SHELL.into(),
        "-U".into(),
    ];
    if user.is_admin {
        argv.push("-G".into());
        argv.push(ADMIN_GROUP.into());
    }
    if let Some(name) = user.full_name.as_deref().filter(|n| !n.trim().is_empty()) {
        argv.push("-c".into());
        argv.push(name.to_string());
    }
    argv.push(user.username.clone());

    chroot.run(CommandSpec::new(argv, format!("Create user {}", user.username)))?;
    tracing::info!("Created user {}", user.username);

    match user.password.as_deref() {
        Some(password) => {
            let spec = CommandSpec::new(["chpasswd"], format!("Set password for {}", user.username))
                .stdin(format!("{}:{}", user.username, password));
            if let Err(e) = chroot.run(spec) {
                outcome.warn(format!("Password for {} could not be set: {}", user.username, e));
            }
        }
        None => outcome.warn(format!(
            "No password given for {}, account has no password",
            user.username
        )),
    }

    Ok(outcome)
}

/// Enable NetworkManager in the target. Failure is a warning.
pub fn enable_network_manager(chroot: &ChrootManager<'_>) -> Outcome {
    let mut outcome = Outcome::clean();
    if let Err(e) = chroot.run_argv(
        ["systemctl", "enable", "NetworkManager.service"],
        "Enable NetworkManager",
    ) {
        outcome.warn(format!("NetworkManager could not be enabled: {}", e));
    }
    outcome
}
