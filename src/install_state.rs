//! Install State Machine
//!
//! Authoritative record of where the installation pipeline is. Transitions
//! are validated: stages cannot be skipped, revisited or left once terminal.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! PreparingStorage        destructive
//!     ↓
//! InstallingPackages
//!     ↓
//! GeneratingFstab
//!     ↓
//! ConfiguringSystem
//!     ↓
//! CreatingUser
//!     ↓
//! InstallingBootloader
//!     ↓
//! Finalizing
//!     ↓
//! Completed
//!
//! (Any non-terminal stage can transition to Failed or Stopped)
//! ```

use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Pipeline stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstallStage {
    /// Installation has not started yet
    NotStarted = 0,

    /// Storage preparation: partition, format and mount under the target root
    PreparingStorage = 1,

    /// Base package transaction, repositories, Flatpak
    InstallingPackages = 2,

    /// Writing the target's /etc/fstab
    GeneratingFstab = 3,

    /// Timezone, locale, keymap, hostname
    ConfiguringSystem = 4,

    /// Initial user account and network service
    CreatingUser = 5,

    /// Boot loader, GRUB configuration, initramfs
    InstallingBootloader = 6,

    /// Releasing mounts and host services
    Finalizing = 7,

    /// Installation completed successfully (terminal state)
    Completed = 8,

    /// Stop was requested between stages (terminal state)
    Stopped = 254,

    /// Installation failed (terminal state)
    Failed = 255,
}

impl InstallStage {
    /// Returns the numeric order of this stage
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true if this is a terminal state
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// Returns the next stage in the sequence, or None if at a terminal state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::PreparingStorage),
            Self::PreparingStorage => Some(Self::InstallingPackages),
            Self::InstallingPackages => Some(Self::GeneratingFstab),
            Self::GeneratingFstab => Some(Self::ConfiguringSystem),
            Self::ConfiguringSystem => Some(Self::CreatingUser),
            Self::CreatingUser => Some(Self::InstallingBootloader),
            Self::InstallingBootloader => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Completed),
            Self::Completed | Self::Stopped | Self::Failed => None,
        }
    }

    /// Returns a human-readable description of this stage
    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::PreparingStorage => "Preparing storage",
            Self::InstallingPackages => "Installing packages",
            Self::GeneratingFstab => "Generating fstab",
            Self::ConfiguringSystem => "Configuring system",
            Self::CreatingUser => "Creating user",
            Self::InstallingBootloader => "Installing boot loader",
            Self::Finalizing => "Finalizing installation",
            Self::Completed => "Installation complete",
            Self::Stopped => "Installation stopped",
            Self::Failed => "Installation failed",
        }
    }

    /// Share of the overall progress bar this stage covers
    pub const fn progress_range(self) -> (f64, f64) {
        match self {
            Self::NotStarted => (0.0, 0.0),
            Self::PreparingStorage => (0.0, 0.20),
            Self::InstallingPackages => (0.20, 0.68),
            Self::GeneratingFstab => (0.68, 0.70),
            Self::ConfiguringSystem => (0.70, 0.75),
            Self::CreatingUser => (0.75, 0.80),
            Self::InstallingBootloader => (0.80, 0.97),
            Self::Finalizing => (0.97, 1.0),
            Self::Completed => (1.0, 1.0),
            // Progress is meaningless for aborted states
            Self::Stopped | Self::Failed => (0.0, 0.0),
        }
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallTransitionError {
    /// Attempted to skip one or more stages
    #[error("Cannot skip from {from} to {to} (must transition through intermediate stages)")]
    SkippedStage {
        from: InstallStage,
        to: InstallStage,
    },

    /// Attempted to go backwards
    #[error("Cannot go backwards from {from} to {to} (installation is forward-only)")]
    BackwardTransition {
        from: InstallStage,
        to: InstallStage,
    },

    /// Attempted to transition from a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: InstallStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: InstallStage },
}

impl From<InstallTransitionError> for crate::error::InstallError {
    fn from(err: InstallTransitionError) -> Self {
        crate::error::InstallError::InvalidTransition(err.to_string())
    }
}

/// Tracks the current stage of one installation.
///
/// # Example
///
/// ```
/// use rootstrap::install_state::{InstallStage, StageTracker};
///
/// let mut tracker = StageTracker::new();
/// tracker.advance().unwrap();
/// assert_eq!(tracker.current_stage(), InstallStage::PreparingStorage);
///
/// // Cannot skip stages
/// assert!(tracker.transition_to(InstallStage::CreatingUser).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: InstallStage,

    /// Stage that was running when the pipeline failed or was stopped
    interrupted_at: Option<InstallStage>,

    /// Entered stages with the instant they were entered
    stage_history: Vec<(InstallStage, Instant)>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: InstallStage::NotStarted,
            interrupted_at: None,
            stage_history: Vec::new(),
        }
    }

    #[inline]
    pub fn current_stage(&self) -> InstallStage {
        self.current
    }

    /// Stage at which the pipeline failed or stopped, if it did
    #[inline]
    pub fn interrupted_at(&self) -> Option<InstallStage> {
        self.interrupted_at
    }

    /// Time spent in each entered stage; the current one runs until now
    pub fn stage_durations(&self) -> Vec<(InstallStage, Duration)> {
        let now = Instant::now();
        self.stage_history
            .iter()
            .enumerate()
            .filter(|(_, (stage, _))| !stage.is_terminal())
            .map(|(i, (stage, entered))| {
                let left = self.stage_history.get(i + 1).map_or(now, |(_, t)| *t);
                (*stage, left.saturating_duration_since(*entered))
            })
            .collect()
    }

    /// Advance to the next stage in sequence.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already terminal
    pub fn advance(&mut self) -> Result<InstallStage, InstallTransitionError> {
        let Some(next_stage) = self.current.next() else {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        };
        self.transition_to(next_stage)
    }

    /// Transition to `target`, which must be the immediate next stage.
    ///
    /// # Errors
    ///
    /// - `AlreadyAtStage` if target is the current stage
    /// - `BackwardTransition` if target is before current
    /// - `SkippedStage` if target is not the immediate next stage
    /// - `FromTerminalState` if current is a terminal state
    pub fn transition_to(&mut self, target: InstallStage) -> Result<InstallStage, InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }

        if target == self.current {
            return Err(InstallTransitionError::AlreadyAtStage { stage: target });
        }

        // Failed/Stopped only via fail()/stop()
        if matches!(target, InstallStage::Failed | InstallStage::Stopped) {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        if target.order() < self.current.order() {
            return Err(InstallTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        if self.current.next() != Some(target) {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        self.record_stage_transition(target);
        self.current = target;
        Ok(target)
    }

    /// Mark the installation as failed at the current stage.
    pub fn fail(&mut self) -> Result<(), InstallTransitionError> {
        self.interrupt(InstallStage::Failed)
    }

    /// Mark the installation as stopped by the user at the current stage.
    pub fn stop(&mut self) -> Result<(), InstallTransitionError> {
        self.interrupt(InstallStage::Stopped)
    }

    fn interrupt(&mut self, terminal: InstallStage) -> Result<(), InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        self.interrupted_at = Some(self.current);
        self.record_stage_transition(terminal);
        self.current = terminal;
        Ok(())
    }

    fn record_stage_transition(&mut self, stage: InstallStage) {
        tracing::debug!(stage = ?stage, "Stage transition");
        self.stage_history.push((stage, Instant::now()));
    }
}
