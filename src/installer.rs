//! Installation orchestrator
//!
//! Runs the pipeline stages in order on one worker, maps each stage onto its
//! slice of the progress bar, checks the stop flag between stages, and tears
//! down everything under the target root on every exit path.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bootloader;
use crate::chroot::ChrootManager;
use crate::command::{tail_lines, CommandRunner, CommandSpec};
use crate::config_file::{InstallationConfig, PartitionEntry};
use crate::error::{InstallError, Outcome, Result};
use crate::hardware::HostPaths;
use crate::install_state::{InstallStage, StageTracker};
use crate::mounts;
use crate::packages;
use crate::progress::{null_sink, CancellationToken, ProgressReporter, ProgressSink};
use crate::storage::{self, StoragePreparation, DEFAULT_SETTLE_DELAY};
use crate::sysconfig;

/// Fixed mount point of the target system
pub const DEFAULT_TARGET_ROOT: &str = "/mnt/sysimage";

const DIAGNOSTIC_LINES: usize = 50;

/// Runtime knobs shared by every step of one installation
#[derive(Clone)]
pub struct InstallationContext {
    pub target_root: PathBuf,
    pub host: HostPaths,
    pub cancel: CancellationToken,
    pub sink: ProgressSink,
    /// Pause before the disk wipe so udev catches up
    pub settle_delay: Duration,
}

impl Default for InstallationContext {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from(DEFAULT_TARGET_ROOT),
            host: HostPaths::default(),
            cancel: CancellationToken::new(),
            sink: null_sink(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl InstallationContext {
    pub fn with_target_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.target_root = root.into();
        self
    }

    pub fn with_host(mut self, host: HostPaths) -> Self {
        self.host = host;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_sink(mut self, sink: ProgressSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

/// How an installation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Success,
    Failed(String),
    StoppedByUser,
}

/// Terminal state of one installation
#[derive(Debug, Clone)]
pub struct InstallationResult {
    pub outcome: InstallOutcome,
    /// Non-fatal problems from every step, in order
    pub warnings: Vec<String>,
    /// Error text, stderr tail and kernel log tail on failure
    pub diagnostics: Vec<String>,
    /// Overall progress at the time the pipeline ended
    pub fraction: f64,
    /// Stage that was running when the pipeline failed or stopped
    pub interrupted_at: Option<InstallStage>,
}

impl InstallationResult {
    pub fn is_success(&self) -> bool {
        self.outcome == InstallOutcome::Success
    }
}

enum Flow {
    Finished,
    Stopped,
}

/// One installation attempt
pub struct Installer {
    config: InstallationConfig,
    context: InstallationContext,
    runner: Arc<dyn CommandRunner>,
}

impl Installer {
    pub fn new(config: InstallationConfig, context: InstallationContext, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, context, runner }
    }

    /// Run the installation on a dedicated worker thread
    pub fn spawn(self) -> std::io::Result<JoinHandle<InstallationResult>> {
        thread::Builder::new()
            .name("rootstrap-install".to_string())
            .spawn(move || self.run())
    }

    /// Run the whole pipeline on the calling thread
    pub fn run(&self) -> InstallationResult {
        let progress = ProgressReporter::new(Arc::clone(&self.context.sink));

        if let Err(e) = self.config.validate() {
            let message = format!("Invalid configuration: {:#}", e);
            tracing::error!("{}", message);
            progress.message(&message);
            return InstallationResult {
                outcome: InstallOutcome::Failed(message.clone()),
                warnings: Vec::new(),
                diagnostics: vec![message],
                fraction: 0.0,
                interrupted_at: None,
            };
        }

        let runner: &dyn CommandRunner = self.runner.as_ref();
        let root = &self.context.target_root;
        let chroot = ChrootManager::new(runner, root.clone(), self.context.host.clone());
        let mut tracker = StageTracker::new();
        let mut outcome = Outcome::clean();

        tracing::info!(target_root = %root.display(), "Starting installation");
        let flow = self.execute(&chroot, &mut tracker, &progress, &mut outcome);

        let result = match flow {
            Ok(Flow::Finished) => {
                let finalize = tracker.transition_to(InstallStage::Finalizing).map_err(InstallError::from);
                let step = self.step_progress(&progress, InstallStage::Finalizing);
                outcome.merge(finalize_host(&chroot));
                step.report("Installation complete", 1.0);
                match finalize.and_then(|_| tracker.advance().map_err(InstallError::from)) {
                    Ok(_) => InstallOutcome::Success,
                    Err(e) => InstallOutcome::Failed(e.to_string()),
                }
            }
            Ok(Flow::Stopped) => {
                let _ = tracker.stop();
                tracing::warn!("Installation stopped by user");
                progress.message("Installation stopped, cleaning up");
                outcome.merge(finalize_host(&chroot));
                InstallOutcome::StoppedByUser
            }
            Err(e) => {
                let _ = tracker.fail();
                tracing::error!("Installation failed: {}", e);
                progress.message(&format!("Installation failed: {}", e));
                outcome.merge(finalize_host(&chroot));
                log_stage_durations(&tracker);
                let diagnostics = collect_diagnostics(runner, &e);
                return InstallationResult {
                    outcome: InstallOutcome::Failed(e.to_string()),
                    warnings: outcome.into_warnings(),
                    diagnostics,
                    fraction: progress.fraction(),
                    interrupted_at: tracker.interrupted_at(),
                };
            }
        };

        log_stage_durations(&tracker);
        InstallationResult {
            outcome: result,
            warnings: outcome.into_warnings(),
            diagnostics: Vec::new(),
            fraction: progress.fraction(),
            interrupted_at: tracker.interrupted_at(),
        }
    }

    fn step_progress(&self, progress: &ProgressReporter, stage: InstallStage) -> ProgressReporter {
        let (start, end) = stage.progress_range();
        let step = progress.sub_range(start, end);
        step.report(stage.description(), 0.0);
        step
    }

    /// Every stage up to, not including, finalization
    fn execute(
        &self,
        chroot: &ChrootManager<'_>,
        tracker: &mut StageTracker,
        progress: &ProgressReporter,
        outcome: &mut Outcome,
    ) -> Result<Flow> {
        let runner = chroot.runner();
        let root = chroot.root();
        let mut partitions: Vec<PartitionEntry> = Vec::new();

        while let Some(stage) = tracker.current_stage().next() {
            if stage == InstallStage::Finalizing {
                break;
            }
            if self.context.cancel.is_cancelled() {
                return Ok(Flow::Stopped);
            }
            tracker.transition_to(stage)?;
            tracing::info!(stage = ?stage, "{}", stage);
            let step = self.step_progress(progress, stage);

            match stage {
                InstallStage::PreparingStorage => {
                    let prepared = StoragePreparation::new(runner, &self.config.disk, root)
                        .with_settle_delay(self.context.settle_delay)
                        .run(&step)?;
                    outcome.merge(prepared.outcome);
                    partitions = prepared.partitions;
                }
                InstallStage::InstallingPackages => {
                    outcome.merge(packages::install(chroot, &self.config.payload, &self.context.host, &step)?);
                }
                InstallStage::GeneratingFstab => mounts::write_fstab(runner, root, &partitions)?,
                InstallStage::ConfiguringSystem => {
                    outcome.merge(sysconfig::write_system_config(root, &self.config)?);
                }
                InstallStage::CreatingUser => {
                    if let Some(user) = &self.config.user {
                        outcome.merge(sysconfig::create_user(chroot, user)?);
                    }
                    if self.config.network.enable_network_manager {
                        outcome.merge(sysconfig::enable_network_manager(chroot));
                    }
                }
                InstallStage::InstallingBootloader => {
                    let installed = bootloader::install(chroot, &self.config, &self.context.host, &step);
                    outcome.merge(chroot.release_kept_mounts());
                    outcome.merge(installed?);
                }
                _ => {}
            }
            step.report(stage.description(), 1.0);
        }
        Ok(Flow::Finished)
    }
}

fn log_stage_durations(tracker: &StageTracker) {
    for (stage, elapsed) in tracker.stage_durations() {
        tracing::info!(stage = ?stage, elapsed_ms = elapsed.as_millis() as u64, "{} took {:.1?}", stage, elapsed);
    }
}

/// Leave the host as it was: no mounts under the target, udisks2 running.
///
/// Runs on success, failure and stop alike. Never fails.
fn finalize_host(chroot: &ChrootManager<'_>) -> Outcome {
    let mut outcome = chroot.release_kept_mounts();
    outcome.merge(mounts::unmount_tree(chroot.runner(), chroot.root()));
    storage::restart_interfering_service(chroot.runner());
    outcome
}

/// Error text, the failed command's stderr tail and the kernel log tail
fn collect_diagnostics(runner: &dyn CommandRunner, err: &InstallError) -> Vec<String> {
    let mut diagnostics = vec![err.to_string()];
    if let Some(stderr) = err.stderr() {
        let tail = tail_lines(stderr, DIAGNOSTIC_LINES);
        if !tail.trim().is_empty() {
            diagnostics.push(format!("stderr:\n{}", tail));
        }
    }
    let dmesg = CommandSpec::new(["dmesg"], "Capture kernel log").timeout(Duration::from_secs(10));
    match runner.run(&dmesg) {
        Ok(out) if !out.stdout.trim().is_empty() => {
            diagnostics.push(format!("kernel log:\n{}", tail_lines(&out.stdout, DIAGNOSTIC_LINES)));
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("Kernel log unavailable: {}", e),
    }
    diagnostics
}
