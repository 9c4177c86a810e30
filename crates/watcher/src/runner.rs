use std::collections::VecDeque;
use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use crate::error::RunError;

/// How many trailing stderr lines are kept for error reports
const STDERR_TAIL_LINES: usize = 200;

/// A fully described external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Forward stderr lines to the line callback as well as capturing them
    pub merge_stderr: bool,
    pub timeout: Option<Duration>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            merge_stderr: false,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn merge_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Short program name used in log lines and errors
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Value following `flag`, e.g. the path after `-o`
    pub fn arg_after(&self, flag: &str) -> Option<&OsString> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().to_string()));
        parts.join(" ")
    }
}

/// Result of a tool that exited successfully
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stderr: Vec<String>,
}

/// Runs external tools, handing each output line to a callback as it arrives
pub trait ToolRunner: Send + Sync + 'static {
    /// Run `command` to completion. Non-zero exit is reported as `RunError::Failed`
    /// carrying the captured stderr.
    fn run_streaming(
        &self,
        command: &ToolCommand,
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> impl Future<Output = Result<ToolOutput, RunError>> + Send;
}

/// `ToolRunner` backed by real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl ToolRunner for ProcessRunner {
    async fn run_streaming(
        &self,
        command: &ToolCommand,
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ToolOutput, RunError> {
        let program = command.program_name();
        debug!("Executing: {}", command.display());

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(&program, "stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe(&program, "stderr"))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
        let stderr_task = tokio::spawn(forward_lines(stderr, Stream::Stderr, tx));

        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let drive = async {
            // Drain both pipes to EOF before reaping the child
            while let Some((stream, line)) = rx.recv().await {
                match stream {
                    Stream::Stdout => on_line(&line),
                    Stream::Stderr => {
                        if command.merge_stderr {
                            on_line(&line);
                        }
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line);
                    }
                }
            }
            child.wait().await
        };

        let waited = match command.timeout {
            Some(limit) => tokio::time::timeout(limit, drive).await.map_err(|_| limit),
            None => Ok(drive.await),
        };

        let status = match waited {
            Ok(status) => status.map_err(|source| RunError::Io {
                program: program.clone(),
                source,
            })?,
            Err(limit) => {
                stdout_task.abort();
                stderr_task.abort();
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out {}: {}", program, e);
                }
                return Err(RunError::TimedOut {
                    program,
                    secs: limit.as_secs(),
                });
            }
        };

        let stderr: Vec<String> = stderr_tail.into_iter().collect();
        if !status.success() {
            return Err(RunError::Failed {
                program,
                code: status.code(),
                stderr,
            });
        }

        debug!("{} completed successfully", program);
        Ok(ToolOutput {
            code: status.code(),
            stderr,
        })
    }
}

fn missing_pipe(program: &str, which: &str) -> RunError {
    RunError::Io {
        program: program.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("{} was not captured", which)),
    }
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut pending = Vec::new();

    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }

        let lines = split_lines(&mut pending, chunk);
        let consumed = chunk.len();
        reader.consume(consumed);

        for line in lines {
            if tx.send((stream, line)).is_err() {
                return;
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send((stream, String::from_utf8_lossy(&pending).to_string()));
    }
}

/// Split `chunk` on `\n` and `\r` (progress bars redraw with bare carriage returns),
/// carrying an unterminated tail over in `pending`. Empty lines are dropped.
fn split_lines(pending: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    for &byte in chunk {
        if byte == b'\n' || byte == b'\r' {
            if !pending.is_empty() {
                lines.push(String::from_utf8_lossy(pending).to_string());
                pending.clear();
            }
        } else {
            pending.push(byte);
        }
    }
    lines
}
