//! External process invocation with a bounded wait.

use crate::core::error::{ChunkError, ChunkResult, ConstructionError, ConstructionResult};
use crossbeam::channel::{self, RecvTimeoutError};
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default limit on the run time of one process invocation.
pub const DEFAULT_STREAM_TIMEOUT_SECS: f64 = 60.0;

/// Longest stderr excerpt kept in error messages.
const STDERR_EXCERPT: usize = 2048;

/// An external command run once per chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    /// Per-invocation limit in seconds; `None` uses the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl StreamCommand {
    /// Command running `program` without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: IndexMap::new(),
            timeout_secs: None,
        }
    }

    /// Split a command line on whitespace. Quoting is not interpreted.
    pub fn parse(command_line: &str) -> ConstructionResult<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| ConstructionError::InvalidCommand {
            reason: "empty command line".to_string(),
        })?;
        Ok(Self::new(program).with_args(parts))
    }

    /// Append one argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// Effective timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.unwrap_or(DEFAULT_STREAM_TIMEOUT_SECS))
    }

    /// Printable command line.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reject commands that can never run.
    pub fn validate(&self) -> ConstructionResult<()> {
        if self.program.trim().is_empty() {
            return Err(ConstructionError::InvalidCommand {
                reason: "program is empty".to_string(),
            });
        }
        if let Some(t) = self.timeout_secs {
            if !t.is_finite() || t <= 0.0 {
                return Err(ConstructionError::InvalidCommand {
                    reason: format!("timeout must be positive, got {}", t),
                });
            }
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(ConstructionError::InvalidCommand {
                reason: format!("invalid environment variable name '{}'", key),
            });
        }
        Ok(())
    }

    /// Run the command once, feeding `input` on stdin and returning stdout.
    ///
    /// `extra_env` is added on top of the command's own environment. The
    /// process is killed when it exceeds the timeout.
    pub fn run(&self, input: Vec<u8>, extra_env: &[(&str, String)]) -> ChunkResult<Vec<u8>> {
        let command = self.display();
        let timeout = self.timeout();
        let deadline = Instant::now() + timeout;
        let timed_out = ChunkError::StreamTimeout {
            command: command.clone(),
            timeout_secs: timeout.as_secs_f64(),
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ChunkError::StreamSpawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;
        debug!("Started stream process '{}' (pid {})", command, child.id());

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ChunkError::StreamSpawn {
                    command,
                    reason: "process pipes unavailable".to_string(),
                });
            }
        };

        // A process that never reads stdin must not block the worker.
        thread::spawn(move || {
            let mut stdin = stdin;
            let _ = stdin.write_all(&input);
        });

        let (out_tx, out_rx) = channel::bounded(1);
        thread::spawn(move || {
            let mut stdout = stdout;
            let mut buffer = Vec::new();
            let result = stdout.read_to_end(&mut buffer).map(|_| buffer);
            let _ = out_tx.send(result);
        });

        let (err_tx, err_rx) = channel::bounded(1);
        thread::spawn(move || {
            let mut stderr = stderr;
            let mut buffer = Vec::new();
            let _ = stderr.read_to_end(&mut buffer);
            let _ = err_tx.send(String::from_utf8_lossy(&buffer).into_owned());
        });

        let remaining = deadline.saturating_duration_since(Instant::now());
        let output = match out_rx.recv_timeout(remaining) {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ChunkError::StreamMalformed {
                    reason: format!("reading output of '{}' failed: {}", command, e),
                });
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(timed_out);
            }
        };

        let status = match wait_until(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(timed_out);
            }
            Err(e) => {
                return Err(ChunkError::StreamExit {
                    command,
                    status: "unknown".to_string(),
                    stderr: e.to_string(),
                })
            }
        };

        if !status.success() {
            let stderr = err_rx
                .recv_timeout(Duration::from_millis(250))
                .unwrap_or_default();
            return Err(ChunkError::StreamExit {
                command,
                status: status.to_string(),
                stderr: excerpt(&stderr),
            });
        }
        Ok(output)
    }
}

/// Poll for process exit until `deadline`.
fn wait_until(
    child: &mut std::process::Child,
    deadline: Instant,
) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT {
        return trimmed.to_string();
    }
    let mut end = STDERR_EXCERPT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
