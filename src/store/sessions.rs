//! Session rows. A partial unique index enforces the invariant of at
//! most one non-terminal session per agent; the launcher turns the
//! resulting unique violation into its crash-recovery path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: String,
    pub agent_id: String,
    pub tmux_session_id: String,
    pub epic_id: Option<String>,
    pub status: String,
    pub activity_state: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn running(agent_id: &str, tmux_session_id: &str, epic_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            tmux_session_id: tmux_session_id.to_string(),
            epic_id: epic_id.map(str::to_string),
            status: "running".to_string(),
            activity_state: "idle".to_string(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed" | "stopped")
    }
}

fn row_to_session(row: &SqliteRow) -> Result<SessionRow> {
    Ok(SessionRow {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        tmux_session_id: row.try_get("tmux_session_id")?,
        epic_id: row.try_get("epic_id")?,
        status: row.try_get("status")?,
        activity_state: row.try_get("activity_state")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a session row. A second active session for the same agent
    /// violates the partial unique index and surfaces as a conflict.
    pub async fn insert(&self, session: &SessionRow) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions
                (id, agent_id, tmux_session_id, epic_id, status,
                 activity_state, started_at, ended_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.agent_id)
        .bind(&session.tmux_session_id)
        .bind(&session.epic_id)
        .bind(&session.status)
        .bind(&session.activity_state)
        .bind(session.started_at)
        .bind(session.ended_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(OrchestratorError::conflict(format!(
                    "agent {} already has an active session",
                    session.agent_id
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<SessionRow> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("session", id))?;
        row_to_session(&row)
    }

    pub async fn get_active_for_agent(&self, agent_id: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE agent_id = ? AND status = 'running'")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    pub async fn mark_ended(&self, id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, ended_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_activity_state(&self, id: &str, activity_state: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET activity_state = ? WHERE id = ?")
            .bind(activity_state)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
