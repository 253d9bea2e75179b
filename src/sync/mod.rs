//! Concurrency primitives shared across the orchestrator.
//!
//! - [`KeyedLocks`]: refcounted per-key mutexes (the agent lock).
//! - [`SingleFlight`]: keyed in-flight coalescing (MCP-ensure, docker
//!   availability probes).

pub mod keyed_lock;
pub mod single_flight;

pub use keyed_lock::KeyedLocks;
pub use single_flight::SingleFlight;
