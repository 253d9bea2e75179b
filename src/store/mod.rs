//! SQLite persistence for orchestrator state.
//!
//! One pool, schema bootstrapped with `CREATE TABLE IF NOT EXISTS` at
//! connect time. Each area of the schema has a thin store type handing
//! out typed rows; none of them lock, since ordering is owned by the services
//! above (the lifecycle service for worktrees, the task-merge engine for
//! merged rows, the session launcher for sessions).

pub mod events;
pub mod merged;
pub mod projects;
pub mod providers;
pub mod sessions;
pub mod worktrees;

pub use events::EventStore;
pub use merged::{MergedAgentRow, MergedEpicRow, MergedStore, MergedSummary};
pub use projects::{AgentProfileRow, AgentRow, EpicRow, ProjectStore, StatusRow};
pub use providers::{ProviderRow, ProviderStore};
pub use sessions::{SessionRow, SessionStore};
pub use worktrees::WorktreeStore;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and bootstrap the schema. A single connection keeps
    /// SQLite's writer model honest and makes `sqlite::memory:` behave
    /// in tests.
    pub async fn connect(database_url: &str) -> Result<Self> {
        if let Some(path) = database_url
            .strip_prefix("sqlite://")
            .map(|rest| rest.split('?').next().unwrap_or(rest))
        {
            if path != ":memory:" {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating database directory {parent:?}"))?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to database at {database_url}"))?;

        let db = Self { pool };
        db.initialize_schema()
            .await
            .context("initializing database schema")?;
        info!("database ready at {database_url}");
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn worktrees(&self) -> WorktreeStore {
        WorktreeStore::new(self.pool.clone())
    }

    pub fn merged(&self) -> MergedStore {
        MergedStore::new(self.pool.clone())
    }

    pub fn projects(&self) -> ProjectStore {
        ProjectStore::new(self.pool.clone())
    }

    pub fn sessions(&self) -> SessionStore {
        SessionStore::new(self.pool.clone())
    }

    pub fn providers(&self) -> ProviderStore {
        ProviderStore::new(self.pool.clone())
    }

    pub fn events(&self) -> EventStore {
        EventStore::new(self.pool.clone())
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worktrees (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                base_branch TEXT NOT NULL,
                repo_path TEXT NOT NULL,
                worktree_path TEXT NOT NULL,
                container_id TEXT,
                container_port INTEGER,
                runtime_type TEXT NOT NULL,
                template_slug TEXT,
                owner_project_id TEXT NOT NULL,
                status TEXT NOT NULL,
                devchain_project_id TEXT,
                merge_commit TEXT,
                merge_conflicts TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (owner_project_id, name)
            );

            CREATE TABLE IF NOT EXISTS merged_epics (
                id TEXT PRIMARY KEY,
                worktree_id TEXT NOT NULL,
                source_epic_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status_name TEXT NOT NULL,
                status_color TEXT NOT NULL,
                agent_name TEXT,
                parent_epic_id TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                merged_at TEXT NOT NULL,
                UNIQUE (worktree_id, source_epic_id)
            );

            CREATE TABLE IF NOT EXISTS merged_agents (
                id TEXT PRIMARY KEY,
                worktree_id TEXT NOT NULL,
                source_agent_id TEXT NOT NULL,
                name TEXT NOT NULL,
                profile_name TEXT,
                epics_completed INTEGER NOT NULL DEFAULT 0,
                merged_at TEXT NOT NULL,
                UNIQUE (worktree_id, source_agent_id)
            );

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                root_path TEXT NOT NULL UNIQUE,
                initial_session_prompt TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS epics (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status_id TEXT,
                agent_id TEXT,
                parent_id TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS statuses (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                label TEXT NOT NULL,
                color TEXT NOT NULL,
                UNIQUE (project_id, label)
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                profile_id TEXT,
                UNIQUE (project_id, name)
            );

            CREATE TABLE IF NOT EXISTS agent_profiles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                options TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                tmux_session_id TEXT NOT NULL,
                epic_id TEXT,
                status TEXT NOT NULL,
                activity_state TEXT NOT NULL DEFAULT 'idle',
                started_at TEXT NOT NULL,
                ended_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
                ON sessions (agent_id) WHERE status = 'running';

            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL COLLATE NOCASE UNIQUE,
                bin_path TEXT,
                mcp_configured INTEGER NOT NULL DEFAULT 0,
                mcp_endpoint TEXT,
                mcp_registered_at TEXT,
                auto_compact_threshold INTEGER
            );

            CREATE TABLE IF NOT EXISTS event_log (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                payload TEXT NOT NULL,
                request_id TEXT,
                published_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_event_log_name_time
                ON event_log (name, published_at);

            CREATE TABLE IF NOT EXISTS event_handlers (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                handler TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_event_handlers_event
                ON event_handlers (event_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
