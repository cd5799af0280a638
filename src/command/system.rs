//! Real command execution with privilege elevation and timeouts

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use super::{filter_stderr, CommandOutput, CommandRunner, CommandSpec};
use crate::error::{InstallError, Result};
use crate::process_guard::{kill_tree, CommandProcessGroup, RegisteredChild};

/// Elevation helper used when the installer is not running as root
pub const ESCALATION_HELPER: &str = "pkexec";

/// pkexec: authorization dialog dismissed or authentication failed
const EXIT_AUTH_FAILED: i32 = 126;
/// pkexec: caller not authorized to run the command
const EXIT_NOT_PERMITTED: i32 = 127;

/// Lines of kernel log captured after a failed command
const DMESG_TAIL_LINES: usize = 50;

/// Executes commands on the host.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    privileged: bool,
    escalation_helper: String,
    capture_kernel_log: bool,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemRunner {
    /// Detect privileges from the effective UID
    pub fn new() -> Self {
        Self {
            privileged: nix::unistd::geteuid().is_root(),
            escalation_helper: ESCALATION_HELPER.to_string(),
            capture_kernel_log: true,
        }
    }

    pub fn with_escalation_helper(mut self, helper: impl Into<String>) -> Self {
        self.escalation_helper = helper.into();
        self
    }

    pub fn without_kernel_log(mut self) -> Self {
        self.capture_kernel_log = false;
        self
    }

    /// Resolve the final argv, prepending the elevation helper if needed
    fn build_argv(&self, spec: &CommandSpec) -> Result<(Vec<String>, bool)> {
        let program = spec.program();
        if program.is_empty() {
            return Err(InstallError::config(format!(
                "empty command line for '{}'",
                spec.description
            )));
        }
        which::which(program).map_err(|_| InstallError::CommandNotFound {
            program: program.to_string(),
        })?;

        if self.privileged {
            return Ok((spec.argv.clone(), false));
        }

        which::which(&self.escalation_helper).map_err(|_| InstallError::CommandNotFound {
            program: self.escalation_helper.clone(),
        })?;
        let mut argv = Vec::with_capacity(spec.argv.len() + 1);
        argv.push(self.escalation_helper.clone());
        argv.extend(spec.argv.iter().cloned());
        Ok((argv, true))
    }

    fn execute(&self, spec: &CommandSpec, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput> {
        let (argv, elevated) = self.build_argv(spec)?;
        let mode = if elevated { "elevated" } else { "direct" };
        tracing::info!(command = %argv.join(" "), mode, "{}", spec.description);

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("LC_ALL", "C")
            .in_new_process_group()
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => InstallError::CommandNotFound {
                    program: argv[0].clone(),
                },
                _ => InstallError::Io(e),
            })?;
        let _registration = RegisteredChild::new(child.id());

        if let (Some(payload), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(payload.as_bytes()) {
                    tracing::debug!("Failed to write command stdin: {}", e);
                }
            });
        }

        let stderr_handle = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                // Invalid UTF-8 is replaced, never a reason to stop draining the pipe
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        let deadline = spec.timeout.map(|t| Instant::now() + t);
        let mut stdout = String::new();
        loop {
            let wait = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(3600),
            };
            match rx.recv_timeout(wait) {
                Ok(line) => {
                    on_line(&line);
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(self.timed_out(spec, &mut child));
                    }
                }
            }
        }

        let status = wait_with_deadline(&mut child, deadline)?;
        let Some(status) = status else {
            return Err(self.timed_out(spec, &mut child));
        };

        let stderr = stderr_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let filtered = filter_stderr(&stderr);

        tracing::debug!(stdout = %stdout.trim_end(), "{} stdout", spec.description);
        if !filtered.is_empty() {
            tracing::debug!(stderr = %filtered, "{} stderr", spec.description);
        }

        if status.success() {
            return Ok(CommandOutput { stdout, stderr });
        }

        let code = status.code().unwrap_or(-1);
        tracing::warn!(code, stderr = %filtered, "{} failed", spec.description);
        if self.capture_kernel_log {
            log_kernel_tail();
        }

        Err(match (elevated, code) {
            (true, EXIT_AUTH_FAILED) => InstallError::AuthorizationFailed {
                description: spec.description.clone(),
            },
            (true, EXIT_NOT_PERMITTED) => InstallError::NotPermitted {
                description: spec.description.clone(),
            },
            _ => InstallError::CommandFailed {
                description: spec.description.clone(),
                code,
                stderr: filtered,
            },
        })
    }

    fn timed_out(&self, spec: &CommandSpec, child: &mut Child) -> InstallError {
        let timeout = spec.timeout.unwrap_or_default();
        tracing::error!("{} timed out after {:?}, killing", spec.description, timeout);
        kill_tree(child.id());
        let _ = child.wait();
        if self.capture_kernel_log {
            log_kernel_tail();
        }
        InstallError::Timeout {
            description: spec.description.clone(),
            timeout,
        }
    }
}

/// Poll for exit until the deadline; `None` means the deadline passed
fn wait_with_deadline(child: &mut Child, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Log the tail of the kernel ring buffer. Best-effort: never fails.
fn log_kernel_tail() {
    let output = match Command::new("dmesg").stdin(Stdio::null()).output() {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            tracing::debug!("dmesg exited with {:?}", output.status.code());
            return;
        }
        Err(e) => {
            tracing::debug!("dmesg unavailable: {}", e);
            return;
        }
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let tail = tail_lines(&text, DMESG_TAIL_LINES);
    if !tail.is_empty() {
        tracing::warn!("Kernel log tail:\n{}", tail);
    }
}

/// Last `n` lines of `text`
pub(crate) fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.execute(spec, &mut |_| {})
    }

    fn run_streaming(
        &self,
        spec: &CommandSpec,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        self.execute(spec, on_line)
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }
}
