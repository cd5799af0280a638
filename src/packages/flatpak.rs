//! Flatpak applications
//!
//! Runs after the base system is in place. Nothing here is fatal: a missing
//! runtime, an unreachable remote or a failed app install only adds warnings.

use std::time::Duration;

use crate::chroot::ChrootManager;
use crate::command::CommandSpec;
use crate::error::Outcome;
use crate::progress::ProgressReporter;

pub const FLATHUB_REMOTE: &str = "flathub";
pub const FLATHUB_URL: &str = "https://dl.flathub.org/repo/flathub.flatpakrepo";

const RUNTIME_TIMEOUT: Duration = Duration::from_secs(900);
const APP_TIMEOUT: Duration = Duration::from_secs(1800);

/// Install the flatpak runtime if needed, add Flathub, install each app
pub fn install_flatpaks(
    chroot: &ChrootManager<'_>,
    releasever: &str,
    apps: &[String],
    progress: &ProgressReporter,
) -> Outcome {
    let mut outcome = Outcome::clean();
    if apps.is_empty() {
        return outcome;
    }

    progress.report("Preparing Flatpak", 0.0);
    if chroot.run_argv(["rpm", "-q", "flatpak"], "Check for flatpak").is_err() {
        tracing::info!("flatpak missing in target, installing it");
        let spec = CommandSpec::new(
            [
                "dnf".to_string(),
                "install".to_string(),
                "-y".to_string(),
                format!("--installroot={}", chroot.root().display()),
                format!("--releasever={}", releasever),
                "flatpak".to_string(),
            ],
            "Install flatpak runtime",
        )
        .timeout(RUNTIME_TIMEOUT);
        if let Err(e) = chroot.runner().run(&spec) {
            outcome.warn(format!("Flatpak runtime could not be installed, skipping apps: {}", e));
            return outcome;
        }
    }

    if let Err(e) = chroot.run_argv(
        ["flatpak", "remote-add", "--if-not-exists", FLATHUB_REMOTE, FLATHUB_URL],
        "Add Flathub remote",
    ) {
        outcome.warn(format!("Flathub remote could not be added, skipping apps: {}", e));
        return outcome;
    }

    for (i, app) in apps.iter().enumerate() {
        progress.report(&format!("Installing Flatpak {}", app), i as f64 / apps.len() as f64);
        let result = chroot.run_with_timeout(
            ["flatpak", "install", "-y", "--noninteractive", FLATHUB_REMOTE, app.as_str()],
            &format!("Install Flatpak {}", app),
            APP_TIMEOUT,
        );
        if let Err(e) = result {
            outcome.warn(format!("Flatpak {} failed: {}", app, e));
        }
    }
    progress.report("Flatpak applications done", 1.0);
    outcome
}
