//! External command execution with captured output.
//!
//! [`run`] spawns a process, feeds it optional input, captures stdout and
//! stderr in memory and turns every failure mode into a formatted
//! [`WorkError`]. Output is read while the child runs, so whatever it
//! printed before a timeout still ends up in the error message.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::WorkError;

/// Default per-command timeout: 30 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 30);

/// How long to keep collecting output after a timed-out child was killed.
/// Grandchildren may hold the pipes open well past that.
const KILL_GRACE: Duration = Duration::from_millis(250);

/// Options for a single invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub input: Option<Vec<u8>>,
    /// Falls back to [`DEFAULT_TIMEOUT`] when unset.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    pub fn input(mut self, input: Vec<u8>) -> Self {
        self.input = Some(input);
        self
    }
}

/// Captured result of a successful command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Which streams a log entry should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStreams {
    pub stdout: bool,
    pub stderr: bool,
}

impl LogStreams {
    pub const BOTH: LogStreams = LogStreams {
        stdout: true,
        stderr: true,
    };

    /// For commands whose stdout is the artifact itself.
    pub const STDERR_ONLY: LogStreams = LogStreams {
        stdout: false,
        stderr: true,
    };
}

/// Runs `cmd` (program followed by its arguments) to completion.
pub async fn run(cmd: &[String], opts: &RunOptions) -> Result<CommandOutput, WorkError> {
    let Some((program, args)) = cmd.split_first() else {
        return Err(WorkError::msg("empty command line"));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if opts.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }

    tracing::debug!(command = %quote_command(cmd), "spawning");
    let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);
    let mut child = command
        .spawn()
        .map_err(|err| spawn_error(cmd, program, err))?;

    if let (Some(input), Some(mut stdin)) = (opts.input.clone(), child.stdin.take()) {
        // A child that exits without draining stdin is not our failure; its
        // exit status tells the story.
        tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
        });
    }

    let mut stdout = Capture::start(child.stdout.take());
    let mut stderr = Capture::start(child.stderr.take());

    // One deadline covers the exit and the pipes closing: a background
    // grandchild can keep stdout open long after the child is gone.
    let finished = tokio::time::timeout(timeout, async {
        let status = child.wait().await;
        stdout.eof().await;
        stderr.eof().await;
        status
    })
    .await;

    match finished {
        Ok(Ok(status)) => {
            let stdout = stdout.take();
            let stderr = stderr.take();
            tracing::debug!(command = %quote_command(cmd), %status, "finished");
            if status.success() {
                Ok(CommandOutput {
                    status,
                    stdout,
                    stderr,
                })
            } else {
                Err(WorkError::CommandFailed {
                    command: quote_command(cmd),
                    code: exit_code(status),
                    output: stream_text(&[stdout.as_slice(), stderr.as_slice()]),
                })
            }
        }
        Ok(Err(err)) => Err(WorkError::Spawn {
            command: quote_command(cmd),
            program: program.clone(),
            reason: format!("failed to wait: {err}"),
        }),
        Err(_) => {
            tracing::warn!(command = %quote_command(cmd), ?timeout, "timed out, killing");
            let _ = child.kill().await;
            let _ = tokio::time::timeout(KILL_GRACE, async {
                stdout.eof().await;
                stderr.eof().await;
            })
            .await;
            let stdout = stdout.take();
            let stderr = stderr.take();
            Err(WorkError::Timeout {
                command: quote_command(cmd),
                timeout,
                output: stream_text(&[stdout.as_slice(), stderr.as_slice()]),
            })
        }
    }
}

fn spawn_error(cmd: &[String], program: &str, err: io::Error) -> WorkError {
    if err.kind() == io::ErrorKind::NotFound {
        WorkError::NotFound {
            command: quote_command(cmd),
            program: program.to_string(),
        }
    } else {
        WorkError::Spawn {
            command: quote_command(cmd),
            program: program.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Background reader that accumulates a pipe into a shared buffer.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut pipe| {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut buf) = buf.lock() {
                                buf.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Waits for the reader to hit EOF.
    async fn eof(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }

    /// Stops reading and returns everything read so far.
    fn take(mut self) -> Vec<u8> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        match self.buf.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Renders an argument vector as a shell-quoted command line.
pub fn quote_command(cmd: &[String]) -> String {
    cmd.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// POSIX shell quoting: bare when safe, single quotes otherwise.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

/// Joins the non-empty streams with a `---` separator, prefixed by a newline.
/// Empty when every stream is empty.
pub fn stream_text(streams: &[&[u8]]) -> String {
    let parts: Vec<_> = streams
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s))
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!("\n{}", parts.join("\n---\n"))
    }
}

/// Formats the log entry for one executed command.
pub fn command_log_entry(cmd: &[String], output: &CommandOutput, streams: LogStreams) -> String {
    let mut selected: Vec<&[u8]> = Vec::with_capacity(2);
    if streams.stdout {
        selected.push(&output.stdout);
    }
    if streams.stderr {
        selected.push(&output.stderr);
    }
    format!("$ {}{}", quote_command(cmd), stream_text(&selected))
}
