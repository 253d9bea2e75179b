//! Worktree domain model and services.
//!
//! A worktree is a git worktree (independent checkout sharing the
//! repository's object database) plus its attached runtime, a container
//! or a host process, and durable metadata. The lifecycle service owns
//! all status transitions; the overview cache composes read-only
//! snapshots.

pub mod lifecycle;
pub mod overview;
pub mod runtime;

pub use lifecycle::WorktreeLifecycle;
pub use overview::{OverviewCache, WorktreeSnapshot};
pub use runtime::{DockerAvailability, RuntimeManager};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Durable status of a worktree.
///
/// ```text
///             create
///   (none) ───────────► creating
///                        │ ok                fail
///                        ▼                    │
///                      running ── stop ──► stopped ── start ──► running
///                        │ merge                                  ▲
///                        ▼                                        │
///                      merging ── ok ──► merged        error ── start/retry
///                        │ fail                            ▲
///                        └────────────────────────────────┘
///             delete (any non-merging state) ► removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Running,
    Stopped,
    Merging,
    Merged,
    Completed,
    Error,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Whether the worktree's HTTP surface may be proxied to.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Running | Self::Completed)
    }
}

impl fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorktreeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "merging" => Ok(Self::Merging),
            "merged" => Ok(Self::Merged),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown worktree status '{other}'")),
        }
    }
}

/// How the worktree's runtime is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    Container,
    Process,
}

impl RuntimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Process => "process",
        }
    }
}

impl FromStr for RuntimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown runtime type '{other}'")),
        }
    }
}

/// Durable representation of one branch + checkout + runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub id: String,
    pub name: String,
    pub branch_name: String,
    pub base_branch: String,
    pub repo_path: String,
    pub worktree_path: String,
    pub container_id: Option<String>,
    pub container_port: Option<u16>,
    pub runtime_type: RuntimeType,
    pub template_slug: Option<String>,
    pub owner_project_id: String,
    pub status: WorktreeStatus,
    pub devchain_project_id: Option<String>,
    pub merge_commit: Option<String>,
    pub merge_conflicts: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorktreeRecord {
    /// Signature over the fields the overview cache keys its snapshots
    /// on; any durable change to these invalidates cached entries even
    /// inside their TTL window.
    pub fn cache_signature(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.updated_at.timestamp_micros(),
            self.status,
            self.container_port.map(|p| p.to_string()).unwrap_or_default(),
            self.devchain_project_id.clone().unwrap_or_default(),
            self.branch_name,
            self.base_branch,
        )
    }
}

/// Parameters for creating a new worktree.
#[derive(Debug, Clone)]
pub struct NewWorktree {
    pub name: String,
    pub branch_name: String,
    pub base_branch: String,
    pub owner_project_id: String,
    pub runtime_type: RuntimeType,
    pub template_slug: Option<String>,
    pub devchain_project_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            WorktreeStatus::Creating,
            WorktreeStatus::Running,
            WorktreeStatus::Stopped,
            WorktreeStatus::Merging,
            WorktreeStatus::Merged,
            WorktreeStatus::Completed,
            WorktreeStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<WorktreeStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<WorktreeStatus>().is_err());
    }

    #[test]
    fn availability_tracks_status() {
        assert!(WorktreeStatus::Running.is_available());
        assert!(WorktreeStatus::Completed.is_available());
        assert!(!WorktreeStatus::Stopped.is_available());
        assert!(!WorktreeStatus::Merging.is_available());
    }
}
