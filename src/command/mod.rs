//! Privileged command execution
//!
//! Every external tool the engine drives goes through a `CommandRunner`.
//! `SystemRunner` executes for real (elevating when needed, enforcing
//! timeouts, capturing kernel log tails on failure); `RecordingRunner`
//! records and answers from rules, for dry runs and tests.

mod recorder;
mod system;

pub use recorder::{RecordingRunner, Reply};
pub use system::SystemRunner;
pub(crate) use system::tail_lines;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Default budget for short administrative commands
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// One external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    /// Human-readable description used in logs and error messages
    pub description: String,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I, description: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            description: description.into(),
            timeout: Some(DEFAULT_TIMEOUT),
            stdin: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// True if the argv starts with the given words
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        self.argv.len() >= prefix.len() && self.argv.iter().zip(prefix).all(|(a, b)| a == b)
    }

    /// Wrap this command to run inside `root` via `chroot`
    pub fn in_chroot(mut self, root: &Path) -> Self {
        let mut argv = vec!["chroot".to_string(), root.to_string_lossy().into_owned()];
        argv.append(&mut self.argv);
        self.argv = argv;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Executes external commands.
///
/// Non-zero exit is an error (`InstallError::CommandFailed` or a more
/// specific variant); callers that treat particular exit codes as success
/// match on the error.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run and feed each stdout line to `on_line` as it is produced
    fn run_streaming(
        &self,
        spec: &CommandSpec,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        let output = self.run(spec)?;
        for line in output.stdout.lines() {
            on_line(line);
        }
        Ok(output)
    }

    /// Whether this process already has full privileges
    fn is_privileged(&self) -> bool;
}

/// Drop noise from stderr: empty lines and LVM descriptor-leak chatter
pub fn filter_stderr(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !(line.starts_with("File descriptor") && line.contains("leaked on")))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_chroot_prefixes_argv() {
        let spec = CommandSpec::new(["useradd", "alice"], "Create user").in_chroot(Path::new("/mnt/sysimage"));
        assert_eq!(spec.argv, vec!["chroot", "/mnt/sysimage", "useradd", "alice"]);
        assert!(spec.starts_with(&["chroot", "/mnt/sysimage"]));
    }

    #[test]
    fn test_filter_stderr() {
        let raw = "File descriptor 7 (/dev/null) leaked on vgchange invocation.\n\n  real error\n";
        assert_eq!(filter_stderr(raw), "  real error");
    }
}
