//! Environment-driven orchestrator configuration.
//!
//! The core recognizes a small set of environment variables; everything
//! else is derived. Validation failures here are reported before any
//! service starts and map to exit code 2 in `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator operating mode. `Main` enables main-project import and
/// `REPO_ROOT` resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestratorMode {
    #[default]
    Normal,
    Main,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("DEVCHAIN_MODE must be 'normal' or 'main', got '{0}'")]
    InvalidMode(String),

    #[error("REPO_ROOT is required when DEVCHAIN_MODE=main")]
    MissingRepoRoot,

    #[error("REPO_ROOT does not exist: {0}")]
    RepoRootMissing(PathBuf),

    #[error("PORT is not a valid port number: {0}")]
    InvalidPort(String),

    #[error("{name} is not a valid integer: {value}")]
    InvalidInteger { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mode: OrchestratorMode,
    pub repo_root: Option<PathBuf>,
    pub port: u16,
    pub database_url: String,
    pub templates_dir: Option<PathBuf>,
    pub enabled_providers: Option<Vec<String>>,
    pub skip_preflight: bool,
    pub docker_availability_ttl: Duration,
    pub worktrees_root_override: Option<PathBuf>,
    pub worktrees_data_root_override: Option<PathBuf>,
}

impl OrchestratorConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match std::env::var("DEVCHAIN_MODE").ok().as_deref() {
            None | Some("") | Some("normal") => OrchestratorMode::Normal,
            Some("main") => OrchestratorMode::Main,
            Some(other) => return Err(ConfigError::InvalidMode(other.to_string())),
        };

        let repo_root = std::env::var("REPO_ROOT").ok().map(PathBuf::from);
        if mode == OrchestratorMode::Main {
            let root = repo_root.as_ref().ok_or(ConfigError::MissingRepoRoot)?;
            if !root.exists() {
                return Err(ConfigError::RepoRootMissing(root.clone()));
            }
        }

        let port = match std::env::var("PORT").ok() {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw))?,
            None => 3000,
        };

        let docker_availability_ttl = match std::env::var("WORKTREES_DOCKER_AVAILABILITY_TTL_MS")
            .ok()
        {
            Some(raw) => Duration::from_millis(raw.parse::<u64>().map_err(|_| {
                ConfigError::InvalidInteger {
                    name: "WORKTREES_DOCKER_AVAILABILITY_TTL_MS",
                    value: raw,
                }
            })?),
            None => Duration::from_secs(60),
        };

        let enabled_providers = std::env::var("ENABLED_PROVIDERS").ok().map(|raw| {
            raw.split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        });

        let database_url = std::env::var("DEVCHAIN_DATABASE_URL").unwrap_or_else(|_| {
            let base = repo_root.clone().unwrap_or_else(|| PathBuf::from("."));
            format!(
                "sqlite://{}?mode=rwc",
                base.join(".devchain").join("devchain.db").display()
            )
        });

        Ok(Self {
            mode,
            repo_root,
            port,
            database_url,
            templates_dir: std::env::var("TEMPLATES_DIR").ok().map(PathBuf::from),
            enabled_providers,
            skip_preflight: std::env::var("SKIP_PREFLIGHT").ok().as_deref() == Some("1"),
            docker_availability_ttl,
            worktrees_root_override: std::env::var("WORKTREES_ROOT").ok().map(PathBuf::from),
            worktrees_data_root_override: std::env::var("WORKTREES_DATA_ROOT").ok().map(PathBuf::from),
        })
    }

    /// Repository path to operate on when the caller did not pass one.
    /// `REPO_ROOT` in main mode, current working directory otherwise.
    pub fn resolve_repo_path(&self) -> PathBuf {
        match (self.mode, &self.repo_root) {
            (OrchestratorMode::Main, Some(root)) => root.clone(),
            _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Root directory for worktree checkouts.
    pub fn worktrees_root(&self, repo_root: &Path) -> PathBuf {
        self.worktrees_root_override
            .clone()
            .unwrap_or_else(|| repo_root.join(".devchain").join("worktrees"))
    }

    /// Root directory for per-worktree writable data volumes.
    pub fn worktrees_data_root(&self, repo_root: &Path) -> PathBuf {
        self.worktrees_data_root_override
            .clone()
            .unwrap_or_else(|| repo_root.join(".devchain").join("worktrees-data"))
    }

    /// The MCP endpoint providers must be registered against.
    pub fn mcp_endpoint(&self) -> String {
        format!("http://127.0.0.1:{}/mcp", self.port)
    }

    pub fn is_main_mode(&self) -> bool {
        self.mode == OrchestratorMode::Main
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: OrchestratorMode::Normal,
            repo_root: None,
            port: 3000,
            database_url: "sqlite::memory:".to_string(),
            templates_dir: None,
            enabled_providers: None,
            skip_preflight: false,
            docker_availability_ttl: Duration::from_secs(60),
            worktrees_root_override: None,
            worktrees_data_root_override: None,
        }
    }
}
