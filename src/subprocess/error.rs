use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' failed{}: {message}", code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    CommandFailed {
        command: String,
        code: Option<i32>,
        message: String,
    },

    #[error("io error running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mock expectation not met: {0}")]
    MockExpectationNotMet(String),
}

impl ProcessError {
    /// Wrap a non-zero exit as a failure carrying the command line and
    /// the combined diagnostic output.
    pub fn failed(command: String, code: Option<i32>, message: String) -> Self {
        Self::CommandFailed {
            command,
            code,
            message,
        }
    }
}
