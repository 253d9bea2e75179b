//! Main-project rows: projects, epics, statuses, agents and agent
//! profiles. The task-merge engine's Level-2 import and the session
//! launcher both read through this store.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub initial_session_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EpicRow {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status_id: Option<String>,
    pub agent_id: Option<String>,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EpicRow {
    pub fn new(project_id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            status_id: None,
            agent_id: None,
            parent_id: None,
            tags: Vec::new(),
            data: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// The `mergedFrom` marker, when this epic was imported from a
    /// worktree. Used as the idempotency key for main-project imports.
    pub fn merged_from(&self) -> Option<(&str, &str)> {
        let marker = self.data.get("mergedFrom")?;
        Some((
            marker.get("worktreeId")?.as_str()?,
            marker.get("sourceEpicId")?.as_str()?,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct StatusRow {
    pub id: String,
    pub project_id: String,
    pub label: String,
    pub color: String,
}

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub profile_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentProfileRow {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    pub options: String,
}

fn row_to_project(row: &SqliteRow) -> Result<ProjectRow> {
    Ok(ProjectRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        root_path: row.try_get("root_path")?,
        initial_session_prompt: row.try_get("initial_session_prompt")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_epic(row: &SqliteRow) -> Result<EpicRow> {
    let tags_json: String = row.try_get("tags")?;
    let data_json: String = row.try_get("data")?;
    Ok(EpicRow {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        title: row.try_get("title")?,
        status_id: row.try_get("status_id")?,
        agent_id: row.try_get("agent_id")?,
        parent_id: row.try_get("parent_id")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        data: serde_json::from_str(&data_json).unwrap_or(serde_json::Value::Null),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
}

impl ProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<ProjectRow> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("project", id))?;
        row_to_project(&row)
    }

    pub async fn get_by_path(&self, root_path: &str) -> Result<Option<ProjectRow>> {
        let row = sqlx::query("SELECT * FROM projects WHERE root_path = ?")
            .bind(root_path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_project).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ProjectRow>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_project).collect()
    }

    /// Resolve the project rooted at `root_path`, creating it when
    /// absent. Used by main-mode bootstrap.
    pub async fn get_or_create_by_path(&self, name: &str, root_path: &str) -> Result<ProjectRow> {
        if let Some(existing) = self.get_by_path(root_path).await? {
            return Ok(existing);
        }
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO projects (id, name, root_path, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (root_path) DO NOTHING",
        )
        .bind(&id)
        .bind(name)
        .bind(root_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_by_path(root_path)
            .await?
            .ok_or_else(|| OrchestratorError::external("project insert did not persist"))
    }

    pub async fn set_initial_session_prompt(&self, id: &str, prompt: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET initial_session_prompt = ? WHERE id = ?")
            .bind(prompt)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- epics ---

    pub async fn list_epics(&self, project_id: &str) -> Result<Vec<EpicRow>> {
        let rows = sqlx::query("SELECT * FROM epics WHERE project_id = ? ORDER BY created_at")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_epic).collect()
    }

    pub async fn get_epic(&self, id: &str) -> Result<EpicRow> {
        let row = sqlx::query("SELECT * FROM epics WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("epic", id))?;
        row_to_epic(&row)
    }

    pub async fn insert_epic(&self, epic: &EpicRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO epics
                (id, project_id, title, status_id, agent_id, parent_id,
                 tags, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&epic.id)
        .bind(&epic.project_id)
        .bind(&epic.title)
        .bind(&epic.status_id)
        .bind(&epic.agent_id)
        .bind(&epic.parent_id)
        .bind(serde_json::to_string(&epic.tags).unwrap_or_else(|_| "[]".into()))
        .bind(epic.data.to_string())
        .bind(epic.created_at)
        .bind(epic.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-check used inside the merge lock: does an epic imported from
    /// `(worktree_id, source_epic_id)` already exist in this project?
    pub async fn find_merged_epic(
        &self,
        project_id: &str,
        worktree_id: &str,
        source_epic_id: &str,
    ) -> Result<Option<String>> {
        // The marker lives in JSON; the row count per project is small
        // enough that a scan with json_extract stays cheap.
        let row = sqlx::query(
            r#"
            SELECT id FROM epics
            WHERE project_id = ?
              AND json_extract(data, '$.mergedFrom.worktreeId') = ?
              AND json_extract(data, '$.mergedFrom.sourceEpicId') = ?
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(worktree_id)
        .bind(source_epic_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>("id")))
    }

    // --- statuses ---

    pub async fn list_statuses(&self, project_id: &str) -> Result<Vec<StatusRow>> {
        let rows = sqlx::query("SELECT * FROM statuses WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(StatusRow {
                    id: row.try_get("id")?,
                    project_id: row.try_get("project_id")?,
                    label: row.try_get("label")?,
                    color: row.try_get("color")?,
                })
            })
            .collect()
    }

    pub async fn create_status(
        &self,
        project_id: &str,
        label: &str,
        color: &str,
    ) -> Result<StatusRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO statuses (id, project_id, label, color) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(project_id)
            .bind(label)
            .bind(color)
            .execute(&self.pool)
            .await?;
        Ok(StatusRow {
            id,
            project_id: project_id.to_string(),
            label: label.to_string(),
            color: color.to_string(),
        })
    }

    // --- agents ---

    pub async fn list_agents(&self, project_id: &str) -> Result<Vec<AgentRow>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(AgentRow {
                    id: row.try_get("id")?,
                    project_id: row.try_get("project_id")?,
                    name: row.try_get("name")?,
                    profile_id: row.try_get("profile_id")?,
                })
            })
            .collect()
    }

    pub async fn get_agent(&self, id: &str) -> Result<AgentRow> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("agent", id))?;
        Ok(AgentRow {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            profile_id: row.try_get("profile_id")?,
        })
    }

    pub async fn insert_agent(&self, agent: &AgentRow) -> Result<()> {
        sqlx::query("INSERT INTO agents (id, project_id, name, profile_id) VALUES (?, ?, ?, ?)")
            .bind(&agent.id)
            .bind(&agent.project_id)
            .bind(&agent.name)
            .bind(&agent.profile_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- agent profiles ---

    pub async fn get_profile(&self, id: &str) -> Result<AgentProfileRow> {
        let row = sqlx::query("SELECT * FROM agent_profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("agent profile", id))?;
        Ok(AgentProfileRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            provider_id: row.try_get("provider_id")?,
            options: row.try_get("options")?,
        })
    }

    pub async fn list_profiles_for_provider(
        &self,
        provider_id: &str,
    ) -> Result<Vec<AgentProfileRow>> {
        let rows = sqlx::query("SELECT * FROM agent_profiles WHERE provider_id = ?")
            .bind(provider_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(AgentProfileRow {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    provider_id: row.try_get("provider_id")?,
                    options: row.try_get("options")?,
                })
            })
            .collect()
    }

    pub async fn insert_profile(&self, profile: &AgentProfileRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_profiles (id, name, provider_id, options) VALUES (?, ?, ?, ?)",
        )
        .bind(&profile.id)
        .bind(&profile.name)
        .bind(&profile.provider_id)
        .bind(&profile.options)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let store = db.projects();
        let a = store.get_or_create_by_path("repo", "/repo").await.unwrap();
        let b = store.get_or_create_by_path("repo", "/repo").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn merged_from_marker_is_queryable() {
        let db = Database::in_memory().await.unwrap();
        let store = db.projects();
        let project = store.get_or_create_by_path("repo", "/repo").await.unwrap();

        let mut epic = EpicRow::new(&project.id, "Imported");
        epic.data = serde_json::json!({
            "mergedFrom": { "worktreeId": "w1", "sourceEpicId": "e1" }
        });
        store.insert_epic(&epic).await.unwrap();

        let found = store
            .find_merged_epic(&project.id, "w1", "e1")
            .await
            .unwrap();
        assert_eq!(found, Some(epic.id.clone()));
        assert!(store
            .find_merged_epic(&project.id, "w1", "other")
            .await
            .unwrap()
            .is_none());

        let listed = store.list_epics(&project.id).await.unwrap();
        assert_eq!(listed[0].merged_from(), Some(("w1", "e1")));
    }

    #[tokio::test]
    async fn statuses_and_agents_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let store = db.projects();
        let project = store.get_or_create_by_path("repo", "/repo").await.unwrap();

        store
            .create_status(&project.id, "To Do", "#f0ad4e")
            .await
            .unwrap();
        let statuses = store.list_statuses(&project.id).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].label, "To Do");

        let agent = AgentRow {
            id: "agent-1".into(),
            project_id: project.id.clone(),
            name: "Coder".into(),
            profile_id: None,
        };
        store.insert_agent(&agent).await.unwrap();
        assert_eq!(store.get_agent("agent-1").await.unwrap().name, "Coder");
    }
}
