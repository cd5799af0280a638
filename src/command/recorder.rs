//! Recording runner for dry runs and tests
//!
//! Nothing is executed. Every command is recorded in order and answered from
//! the first matching rule; unmatched commands succeed with empty output.

use std::sync::Mutex;

use super::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{InstallError, Result};

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

/// Scripted answer to a matched command
pub enum Reply {
    /// Succeed with this stdout
    Stdout(String),
    /// Exit non-zero with this stderr
    Fail { code: i32, stderr: String },
    /// The program is missing from PATH
    NotFound,
    /// Computed answer
    With(Responder),
}

impl Reply {
    pub fn stdout(s: impl Into<String>) -> Self {
        Self::Stdout(s.into())
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self::Fail {
            code,
            stderr: stderr.into(),
        }
    }

    pub fn with<F>(f: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self::With(Box::new(f))
    }

    fn answer(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        match self {
            Self::Stdout(s) => Ok(CommandOutput::stdout(s.clone())),
            Self::Fail { code, stderr } => Err(InstallError::CommandFailed {
                description: spec.description.clone(),
                code: *code,
                stderr: stderr.clone(),
            }),
            Self::NotFound => Err(InstallError::CommandNotFound {
                program: spec.program().to_string(),
            }),
            Self::With(f) => f(spec),
        }
    }
}

/// Records commands instead of running them
pub struct RecordingRunner {
    privileged: bool,
    rules: Vec<(Matcher, Reply)>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            privileged: true,
            rules: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    /// Answer commands satisfying `matcher` with `reply`
    pub fn on<F>(mut self, matcher: F, reply: Reply) -> Self
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.rules.push((Box::new(matcher), reply));
        self
    }

    /// Answer commands whose argv starts with `prefix`
    pub fn on_prefix(self, prefix: &[&str], reply: Reply) -> Self {
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        self.on(
            move |spec| {
                let p: Vec<&str> = prefix.iter().map(String::as_str).collect();
                spec.starts_with(&p)
            },
            reply,
        )
    }

    /// Answer commands whose joined command line contains `needle`
    pub fn on_contains(self, needle: &str, reply: Reply) -> Self {
        let needle = needle.to_string();
        self.on(move |spec| spec.to_string().contains(&needle), reply)
    }

    /// Every command recorded so far, in order
    pub fn calls(&self) -> Vec<CommandSpec> {
        match self.calls.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Recorded command lines
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    /// Index of the first recorded command whose line contains `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.command_lines().iter().position(|c| c.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.command_lines().iter().filter(|c| c.contains(needle)).count()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::info!(command = %spec, mode = "recorded", "{}", spec.description);
        match self.calls.lock() {
            Ok(mut c) => c.push(spec.clone()),
            Err(poisoned) => poisoned.into_inner().push(spec.clone()),
        }
        self.rules
            .iter()
            .find(|(matcher, _)| matcher(spec))
            .map(|(_, reply)| reply.answer(spec))
            .unwrap_or_else(|| Ok(CommandOutput::default()))
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }
}
