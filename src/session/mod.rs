//! Agent sessions: one terminal-multiplexer session wrapping one
//! provider process per agent.
//!
//! The launcher owns its session row after insertion; only the same
//! agent's session may write to the multiplexer, and everything that
//! mutates a session runs under that agent's lock.

pub mod launcher;
pub mod options;
pub mod prompt;
pub mod tmux;

pub use launcher::{LaunchOptions, LaunchRequest, LaunchedSession, SessionLauncher};
pub use tmux::TmuxDriver;
