use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ProcessError;

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl ProcessCommand {
    /// Render the command line for error messages and logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    /// stderr when present, stdout otherwise. git writes diagnostics to
    /// either stream depending on the subcommand.
    pub fn combined_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Signal(_) => None,
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;
}

/// Production runner backed by `tokio::process::Command`.
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let start = std::time::Instant::now();

        tracing::debug!("executing subprocess: {}", command.display());
        if let Some(ref dir) = command.working_dir {
            tracing::trace!("working directory: {:?}", dir);
        }

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        if command.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        }
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(command.program.clone())
            } else {
                ProcessError::Io {
                    command: command.display(),
                    source: e,
                }
            }
        })?;

        if let Some(stdin_data) = &command.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                stdin
                    .write_all(stdin_data.as_bytes())
                    .await
                    .map_err(|e| ProcessError::Io {
                        command: command.display(),
                        source: e,
                    })?;
                stdin.shutdown().await.map_err(|e| ProcessError::Io {
                    command: command.display(),
                    source: e,
                })?;
            }
        }

        let output = if let Some(deadline) = command.timeout {
            match tokio::time::timeout(deadline, child.wait_with_output()).await {
                Ok(result) => result.map_err(|e| ProcessError::Io {
                    command: command.display(),
                    source: e,
                })?,
                Err(_) => {
                    return Err(ProcessError::Timeout {
                        command: command.display(),
                        timeout: deadline,
                    });
                }
            }
        } else {
            child
                .wait_with_output()
                .await
                .map_err(|e| ProcessError::Io {
                    command: command.display(),
                    source: e,
                })?
        };

        let duration = start.elapsed();
        let status = if output.status.success() {
            ExitStatus::Success
        } else if let Some(code) = output.status.code() {
            ExitStatus::Error(code)
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                match output.status.signal() {
                    Some(signal) => ExitStatus::Signal(signal),
                    None => ExitStatus::Error(1),
                }
            }
            #[cfg(not(unix))]
            {
                ExitStatus::Error(1)
            }
        };

        match &status {
            ExitStatus::Success => {
                tracing::debug!("subprocess completed in {:?}: {}", duration, command.display());
            }
            ExitStatus::Error(code) => {
                tracing::warn!(
                    "subprocess failed with exit code {} in {:?}: {}",
                    code,
                    duration,
                    command.display()
                );
            }
            ExitStatus::Signal(signal) => {
                tracing::warn!(
                    "subprocess terminated by signal {}: {}",
                    signal,
                    command.display()
                );
            }
        }

        Ok(ProcessOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration,
        })
    }
}
