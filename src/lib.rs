//! devchain: a local-first orchestrator for AI coding agents.
//!
//! Users attach projects (git repositories) and define agent profiles
//! and providers (Claude, Codex, Gemini CLIs). The orchestrator
//! launches each agent inside a tmux session bound to a git worktree,
//! mediates access to shared infrastructure (the MCP endpoint, the
//! preflight environment), and re-integrates the work each agent
//! produced back into the main repository and task database.
//!
//! The crate is organized around the hard core of that system:
//!
//! - [`git`]: every git command serialized through one FIFO queue
//! - [`worktree`]: the worktree state machine, runtime management and
//!   the lazy overview cache
//! - [`taskmerge`]: two-level idempotent epic/agent import from a
//!   worktree's in-container database
//! - [`session`]: the per-agent tmux session launcher
//! - [`mcp`]: provider MCP registration kept in sync with this
//!   orchestrator's endpoint
//! - [`preflight`]: cached environment readiness checks
//! - [`events`] + [`realtime`]: durable event log with handler
//!   records and a live broadcast stream
//! - [`proxy`]: the `/wt/{name}` reverse proxy with availability
//!   gating

pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod git;
pub mod mcp;
pub mod preflight;
pub mod proxy;
pub mod realtime;
pub mod session;
pub mod store;
pub mod subprocess;
pub mod sync;
pub mod taskmerge;
pub mod worktree;

pub use config::{OrchestratorConfig, OrchestratorMode};
pub use error::{OrchestratorError, Result};
