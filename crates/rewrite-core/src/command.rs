//! The external process boundary.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PipelineError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fully resolved external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    /// Build from a configured command prefix such as `["node", "chrome.js"]`.
    /// Callers validate that prefixes are non-empty when loading config.
    pub fn from_parts(parts: &[String]) -> Self {
        let (program, args) = match parts.split_first() {
            Some((program, rest)) => (program.clone(), rest.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Self {
            program,
            args,
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().to_string())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: Option<&Path>) -> Self {
        self.cwd = dir.map(Path::to_path_buf);
        self
    }

    /// Shell-quoted rendering used in logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Runs external tools. Retry policy belongs to callers.
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion and return its trimmed standard output.
    fn run(&self, command: &ToolCommand) -> Result<String, PipelineError>;
}

/// Runs tools as child processes, optionally killing them after a deadline.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, command: &ToolCommand) -> Result<String, PipelineError> {
        let rendered = command.display();
        tracing::debug!(command = %rendered, "running external tool");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own group, so a deadline can take down everything the tool forked.
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| PipelineError::ExternalToolFailure {
                command: rendered.clone(),
                stderr: format!("failed to spawn: {}", e),
            })?;
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = match wait_with_deadline(&mut child, self.timeout)? {
            Some(status) => {
                // Stragglers left in the group would keep writing into the
                // job's working directory and hold our pipes open.
                kill_process_group(&mut child);
                status
            }
            None => {
                kill_process_group(&mut child);
                let _ = child.wait();
                return Err(PipelineError::ToolTimeout {
                    command: rendered,
                    timeout_secs: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                });
            }
        };
        let stdout = join_reader(stdout);
        let stderr = join_reader(stderr);

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(PipelineError::ExternalToolFailure {
                command: rendered,
                stderr: format!("exit {}: {}", code, stderr.trim()),
            });
        }
        Ok(stdout.trim_end().to_string())
    }
}

/// `Ok(None)` means the deadline passed before the child exited.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<Option<std::process::ExitStatus>, PipelineError> {
    let Some(timeout) = timeout else {
        return Ok(Some(child.wait()?));
    };
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// SIGKILL the child's process group. The group id is the child's pid and
/// stays reserved while any member is alive, even after the child is reaped.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            // ESRCH: the group is already empty.
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid = child.id(), error = %err, "failed to kill process group");
                let _ = child.kill();
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: Option<R>,
) -> Option<thread::JoinHandle<String>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
