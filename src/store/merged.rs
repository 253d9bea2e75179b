//! Content-addressed dedup rows for epics and agents imported from a
//! worktree's in-container database. Keyed by `(worktree_id,
//! source_epic_id)` / `(worktree_id, source_agent_id)`; inserts carry
//! do-nothing-on-conflict semantics so repeated merges are idempotent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct MergedEpicRow {
    pub id: String,
    pub worktree_id: String,
    pub source_epic_id: String,
    pub title: String,
    pub status_name: String,
    pub status_color: String,
    pub agent_name: Option<String>,
    pub parent_epic_id: Option<String>,
    pub tags: Vec<String>,
    pub merged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedAgentRow {
    pub id: String,
    pub worktree_id: String,
    pub source_agent_id: String,
    pub name: String,
    pub profile_name: Option<String>,
    pub epics_completed: u32,
    pub merged_at: DateTime<Utc>,
}

/// Per-worktree aggregate the overview cache surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedSummary {
    pub epic_count: u32,
    pub agent_count: u32,
    pub latest_merged_at: Option<DateTime<Utc>>,
}

fn row_to_epic(row: &SqliteRow) -> Result<MergedEpicRow> {
    let tags_json: String = row.try_get("tags")?;
    Ok(MergedEpicRow {
        id: row.try_get("id")?,
        worktree_id: row.try_get("worktree_id")?,
        source_epic_id: row.try_get("source_epic_id")?,
        title: row.try_get("title")?,
        status_name: row.try_get("status_name")?,
        status_color: row.try_get("status_color")?,
        agent_name: row.try_get("agent_name")?,
        parent_epic_id: row.try_get("parent_epic_id")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        merged_at: row.try_get("merged_at")?,
    })
}

fn row_to_agent(row: &SqliteRow) -> Result<MergedAgentRow> {
    let epics_completed: i64 = row.try_get("epics_completed")?;
    Ok(MergedAgentRow {
        id: row.try_get("id")?,
        worktree_id: row.try_get("worktree_id")?,
        source_agent_id: row.try_get("source_agent_id")?,
        name: row.try_get("name")?,
        profile_name: row.try_get("profile_name")?,
        epics_completed: epics_completed as u32,
        merged_at: row.try_get("merged_at")?,
    })
}

#[derive(Clone)]
pub struct MergedStore {
    pool: SqlitePool,
}

impl MergedStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert both row sets inside one immediate transaction. Rows whose
    /// dedup key already exists are skipped silently.
    pub async fn insert_batch(
        &self,
        epics: &[MergedEpicRow],
        agents: &[MergedAgentRow],
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE TRANSACTION")
            .execute(&mut *conn)
            .await?;

        let result: Result<()> = async {
            for epic in epics {
                sqlx::query(
                    r#"
                    INSERT INTO merged_epics
                        (id, worktree_id, source_epic_id, title, status_name,
                         status_color, agent_name, parent_epic_id, tags, merged_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (worktree_id, source_epic_id) DO NOTHING
                    "#,
                )
                .bind(&epic.id)
                .bind(&epic.worktree_id)
                .bind(&epic.source_epic_id)
                .bind(&epic.title)
                .bind(&epic.status_name)
                .bind(&epic.status_color)
                .bind(&epic.agent_name)
                .bind(&epic.parent_epic_id)
                .bind(serde_json::to_string(&epic.tags).unwrap_or_else(|_| "[]".into()))
                .bind(epic.merged_at)
                .execute(&mut *conn)
                .await?;
            }
            for agent in agents {
                sqlx::query(
                    r#"
                    INSERT INTO merged_agents
                        (id, worktree_id, source_agent_id, name, profile_name,
                         epics_completed, merged_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (worktree_id, source_agent_id) DO NOTHING
                    "#,
                )
                .bind(&agent.id)
                .bind(&agent.worktree_id)
                .bind(&agent.source_agent_id)
                .bind(&agent.name)
                .bind(&agent.profile_name)
                .bind(i64::from(agent.epics_completed))
                .bind(agent.merged_at)
                .execute(&mut *conn)
                .await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    pub async fn list_epics(&self, worktree_id: &str) -> Result<Vec<MergedEpicRow>> {
        let rows = sqlx::query(
            "SELECT * FROM merged_epics WHERE worktree_id = ? ORDER BY merged_at, source_epic_id",
        )
        .bind(worktree_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_epic).collect()
    }

    pub async fn list_agents(&self, worktree_id: &str) -> Result<Vec<MergedAgentRow>> {
        let rows = sqlx::query(
            "SELECT * FROM merged_agents WHERE worktree_id = ? ORDER BY merged_at, source_agent_id",
        )
        .bind(worktree_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_agent).collect()
    }

    pub async fn summary(&self, worktree_id: &str) -> Result<MergedSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM merged_epics WHERE worktree_id = ?1) AS epic_count,
                (SELECT COUNT(*) FROM merged_agents WHERE worktree_id = ?1) AS agent_count,
                (SELECT MAX(merged_at) FROM merged_epics WHERE worktree_id = ?1) AS latest
            "#,
        )
        .bind(worktree_id)
        .fetch_one(&self.pool)
        .await?;
        let epic_count: i64 = row.try_get("epic_count")?;
        let agent_count: i64 = row.try_get("agent_count")?;
        Ok(MergedSummary {
            epic_count: epic_count as u32,
            agent_count: agent_count as u32,
            latest_merged_at: row.try_get("latest")?,
        })
    }

    pub async fn remove_for_worktree(&self, worktree_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM merged_epics WHERE worktree_id = ?")
            .bind(worktree_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM merged_agents WHERE worktree_id = ?")
            .bind(worktree_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl MergedEpicRow {
    pub fn new(worktree_id: &str, source_epic_id: &str, title: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            worktree_id: worktree_id.to_string(),
            source_epic_id: source_epic_id.to_string(),
            title: title.to_string(),
            status_name: String::new(),
            status_color: String::new(),
            agent_name: None,
            parent_epic_id: None,
            tags: Vec::new(),
            merged_at: Utc::now(),
        }
    }
}

impl MergedAgentRow {
    pub fn new(worktree_id: &str, source_agent_id: &str, name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            worktree_id: worktree_id.to_string(),
            source_agent_id: source_agent_id.to_string(),
            name: name.to_string(),
            profile_name: None,
            epics_completed: 0,
            merged_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn batch_insert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let store = db.merged();

        let epic_a = MergedEpicRow::new("w1", "epic-root", "Root");
        let mut epic_b = MergedEpicRow::new("w1", "epic-child", "Child");
        epic_b.parent_epic_id = Some("epic-root".into());
        let agent = MergedAgentRow::new("w1", "agent-1", "Coder");

        store
            .insert_batch(&[epic_a.clone(), epic_b.clone()], &[agent.clone()])
            .await
            .unwrap();
        // Re-running with fresh row ids but the same dedup keys changes nothing.
        store
            .insert_batch(
                &[
                    MergedEpicRow::new("w1", "epic-root", "Root again"),
                    MergedEpicRow::new("w1", "epic-child", "Child again"),
                ],
                &[MergedAgentRow::new("w1", "agent-1", "Coder again")],
            )
            .await
            .unwrap();

        let epics = store.list_epics("w1").await.unwrap();
        assert_eq!(epics.len(), 2);
        assert_eq!(epics[0].title, "Root");
        let agents = store.list_agents("w1").await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "Coder");
    }

    #[tokio::test]
    async fn summary_counts_and_latest() {
        let db = Database::in_memory().await.unwrap();
        let store = db.merged();

        assert_eq!(store.summary("w1").await.unwrap(), MergedSummary::default());

        store
            .insert_batch(
                &[MergedEpicRow::new("w1", "e1", "One")],
                &[MergedAgentRow::new("w1", "a1", "Coder")],
            )
            .await
            .unwrap();

        let summary = store.summary("w1").await.unwrap();
        assert_eq!(summary.epic_count, 1);
        assert_eq!(summary.agent_count, 1);
        assert!(summary.latest_merged_at.is_some());
    }

    #[tokio::test]
    async fn different_worktrees_do_not_collide() {
        let db = Database::in_memory().await.unwrap();
        let store = db.merged();
        store
            .insert_batch(&[MergedEpicRow::new("w1", "e1", "One")], &[])
            .await
            .unwrap();
        store
            .insert_batch(&[MergedEpicRow::new("w2", "e1", "One elsewhere")], &[])
            .await
            .unwrap();
        assert_eq!(store.list_epics("w1").await.unwrap().len(), 1);
        assert_eq!(store.list_epics("w2").await.unwrap().len(), 1);
    }
}
