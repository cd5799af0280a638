//! Error handling for the installation engine
//!
//! Every component returns `Result<T, InstallError>`. A step that can degrade
//! instead of failing returns `Ok(Outcome)` carrying its warnings, so the
//! orchestrator decides mechanically whether to abort: `Err` is fatal,
//! warnings are not.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the installation engine
#[derive(Error, Debug)]
pub enum InstallError {
    /// A required external tool (or the elevation helper) is not on PATH
    #[error("Required command not found: {program}")]
    CommandNotFound { program: String },

    /// Privilege escalation was dismissed or authentication failed
    #[error("Authorization failed for '{description}': authentication was dismissed or failed")]
    AuthorizationFailed { description: String },

    /// The escalation helper refused to run the command
    #[error("Not permitted to run '{description}' with elevated privileges")]
    NotPermitted { description: String },

    /// External process exceeded its time budget and was killed
    #[error("'{description}' timed out after {}s", .timeout.as_secs())]
    Timeout {
        description: String,
        timeout: Duration,
    },

    /// External process exited non-zero
    #[error("{description} failed (exit code {code}): {stderr}")]
    CommandFailed {
        description: String,
        code: i32,
        stderr: String,
    },

    /// Destructive operation would target a device with open handles
    #[error("Device {device} is busy (held open by: {holders})")]
    BusyDevice { device: String, holders: String },

    /// Mount operation failed (prior mounts of the same operation were rolled back)
    #[error("Failed to mount {source_path} on {target}: {reason}")]
    MountFailure {
        source_path: String,
        target: PathBuf,
        reason: String,
    },

    /// Unmount failed; logged during cleanup, never escalated from cleanup paths
    #[error("Failed to unmount {target}: {reason}")]
    UnmountFailure { target: PathBuf, reason: String },

    /// Manual partitioning was requested but no usable root partition exists
    #[error("No root partition detected")]
    NoRootPartition,

    /// Package manager exited non-zero
    #[error("Package installation failed (exit code {code}): {stderr}")]
    PackageManagerFailure { code: i32, stderr: String },

    /// Terminal bootloader verification failed
    #[error("Bootloader installation failed: {0}")]
    BootloaderFailure(String),

    /// One or more configuration files could not be written
    #[error("Failed to write system configuration: {}", .0.join("; "))]
    ConfigWriteFailure(Vec<String>),

    /// Operation requires full privileges and the process does not have them
    #[error("{0} requires root privileges")]
    NotPrivileged(String),

    /// Invalid installation configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pipeline stage transition rejected
    #[error("Install transition error: {0}")]
    InvalidTransition(String),

    /// IO errors (target root files, probes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for installation operations
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a bootloader error
    pub fn bootloader(msg: impl Into<String>) -> Self {
        Self::BootloaderFailure(msg.into())
    }

    /// Exit code of a failed external command, if this error carries one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { code, .. } | Self::PackageManagerFailure { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    /// Captured stderr of a failed external command, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stderr, .. } | Self::PackageManagerFailure { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }
}

/// Non-fatal result of a step: warnings accumulated along the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    warnings: Vec<String>,
}

impl Outcome {
    /// An outcome with no warnings
    pub fn clean() -> Self {
        Self::default()
    }

    /// Record a warning and log it
    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!("{}", msg);
        self.warnings.push(msg);
    }

    /// Absorb the warnings of another outcome
    pub fn merge(&mut self, other: Outcome) {
        self.warnings.extend(other.warnings);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }

    /// True when nothing degraded
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.warnings.is_empty() {
            write!(f, "completed without warnings")
        } else {
            write!(f, "completed with {} warning(s)", self.warnings.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InstallError::config("no target disk");
        assert_eq!(err.to_string(), "Configuration error: no target disk");

        let err = InstallError::CommandFailed {
            description: "Create GPT label".into(),
            code: 1,
            stderr: "device busy".into(),
        };
        assert_eq!(
            err.to_string(),
            "Create GPT label failed (exit code 1): device busy"
        );
    }

    #[test]
    fn test_config_write_failure_joins_fields() {
        let err = InstallError::ConfigWriteFailure(vec!["locale: denied".into(), "hostname: denied".into()]);
        assert_eq!(
            err.to_string(),
            "Failed to write system configuration: locale: denied; hostname: denied"
        );
    }

    #[test]
    fn test_timeout_display_uses_seconds() {
        let err = InstallError::Timeout {
            description: "dnf".into(),
            timeout: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "'dnf' timed out after 90s");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: InstallError = io_err.into();
        assert!(matches!(err, InstallError::Io(_)));
    }

    #[test]
    fn test_exit_code_accessor() {
        let err = InstallError::PackageManagerFailure { code: 3, stderr: "x".into() };
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(InstallError::NoRootPartition.exit_code(), None);
    }

    #[test]
    fn test_outcome_merge() {
        let mut a = Outcome::clean();
        assert!(a.is_clean());
        let mut b = Outcome::clean();
        b.warn("flatpak app failed");
        a.warn("repo failed");
        a.merge(b);
        assert_eq!(a.warnings().len(), 2);
        assert_eq!(a.to_string(), "completed with 2 warning(s)");
    }
}
