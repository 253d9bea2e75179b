//! Subprocess abstraction for external tool integration.
//!
//! All git, tmux, docker and provider-CLI invocations go through the
//! [`ProcessRunner`] trait so production code and tests share one
//! execution path. Tests configure a [`MockProcessRunner`] with expected
//! calls; production uses the Tokio-backed runner.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;

pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use mock::MockProcessRunner;
pub use runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, TokioProcessRunner};

use std::sync::Arc;

/// Facade handing out the shared process runner.
///
/// Cloning is cheap; every service in the orchestrator holds one and
/// builds commands with [`ProcessCommandBuilder`].
#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Production manager backed by `tokio::process`.
    pub fn production() -> Self {
        Self::new(Arc::new(TokioProcessRunner))
    }

    /// Mock manager for tests; returns the mock handle for configuring
    /// expectations and inspecting the call history.
    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }
}
