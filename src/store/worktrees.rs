//! Durable worktree rows and the owner-project index.
//!
//! No locking lives here; the lifecycle service owns operation ordering.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::worktree::{NewWorktree, RuntimeType, WorktreeRecord, WorktreeStatus};

#[derive(Clone)]
pub struct WorktreeStore {
    pool: SqlitePool,
}

fn row_to_record(row: &SqliteRow) -> Result<WorktreeRecord> {
    let status: String = row.try_get("status")?;
    let runtime_type: String = row.try_get("runtime_type")?;
    let container_port: Option<i64> = row.try_get("container_port")?;
    Ok(WorktreeRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        branch_name: row.try_get("branch_name")?,
        base_branch: row.try_get("base_branch")?,
        repo_path: row.try_get("repo_path")?,
        worktree_path: row.try_get("worktree_path")?,
        container_id: row.try_get("container_id")?,
        container_port: container_port.map(|p| p as u16),
        runtime_type: runtime_type
            .parse::<RuntimeType>()
            .map_err(OrchestratorError::external)?,
        template_slug: row.try_get("template_slug")?,
        owner_project_id: row.try_get("owner_project_id")?,
        status: status
            .parse::<WorktreeStatus>()
            .map_err(OrchestratorError::external)?,
        devchain_project_id: row.try_get("devchain_project_id")?,
        merge_commit: row.try_get("merge_commit")?,
        merge_conflicts: row.try_get("merge_conflicts")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl WorktreeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new row in status `creating`. The `(owner_project_id,
    /// name)` unique constraint surfaces as a conflict error.
    pub async fn create(
        &self,
        new: &NewWorktree,
        repo_path: &str,
        worktree_path: &str,
    ) -> Result<WorktreeRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO worktrees
                (id, name, branch_name, base_branch, repo_path, worktree_path,
                 runtime_type, template_slug, owner_project_id, status,
                 devchain_project_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.branch_name)
        .bind(&new.base_branch)
        .bind(repo_path)
        .bind(worktree_path)
        .bind(new.runtime_type.as_str())
        .bind(&new.template_slug)
        .bind(&new.owner_project_id)
        .bind(WorktreeStatus::Creating.as_str())
        .bind(&new.devchain_project_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get_by_id(&id).await,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(OrchestratorError::conflict(format!(
                    "worktree '{}' already exists in project {}",
                    new.name, new.owner_project_id
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list(&self) -> Result<Vec<WorktreeRecord>> {
        let rows = sqlx::query("SELECT * FROM worktrees ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn list_by_owner_project(&self, owner_project_id: &str) -> Result<Vec<WorktreeRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM worktrees WHERE owner_project_id = ? ORDER BY created_at",
        )
        .bind(owner_project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Worktrees whose runtimes need watching: running or errored.
    pub async fn list_monitored(&self) -> Result<Vec<WorktreeRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM worktrees WHERE status IN ('running', 'error') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<WorktreeRecord> {
        let row = sqlx::query("SELECT * FROM worktrees WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("worktree", id))?;
        row_to_record(&row)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<WorktreeRecord>> {
        let row = sqlx::query("SELECT * FROM worktrees WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    pub async fn get_by_container_id(&self, container_id: &str) -> Result<Option<WorktreeRecord>> {
        let row = sqlx::query("SELECT * FROM worktrees WHERE container_id = ?")
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Load, apply `updater`, stamp `updated_at`, write back every
    /// column. Returns the updated row.
    pub async fn update<F>(&self, id: &str, updater: F) -> Result<WorktreeRecord>
    where
        F: FnOnce(&mut WorktreeRecord),
    {
        let mut record = self.get_by_id(id).await?;
        updater(&mut record);
        record.updated_at = Utc::now();
        self.persist(&record).await?;
        Ok(record)
    }

    async fn persist(&self, record: &WorktreeRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE worktrees SET
                name = ?, branch_name = ?, base_branch = ?, repo_path = ?,
                worktree_path = ?, container_id = ?, container_port = ?,
                runtime_type = ?, template_slug = ?, owner_project_id = ?,
                status = ?, devchain_project_id = ?, merge_commit = ?,
                merge_conflicts = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.name)
        .bind(&record.branch_name)
        .bind(&record.base_branch)
        .bind(&record.repo_path)
        .bind(&record.worktree_path)
        .bind(&record.container_id)
        .bind(record.container_port.map(i64::from))
        .bind(record.runtime_type.as_str())
        .bind(&record.template_slug)
        .bind(&record.owner_project_id)
        .bind(record.status.as_str())
        .bind(&record.devchain_project_id)
        .bind(&record.merge_commit)
        .bind(&record.merge_conflicts)
        .bind(&record.error_message)
        .bind(record.updated_at)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM worktrees WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn sample(name: &str) -> NewWorktree {
        NewWorktree {
            name: name.to_string(),
            branch_name: format!("wt/{name}"),
            base_branch: "main".to_string(),
            owner_project_id: "proj-1".to_string(),
            runtime_type: RuntimeType::Container,
            template_slug: None,
            devchain_project_id: Some("p1".to_string()),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let store = db.worktrees();
        let record = store
            .create(&sample("feature-auth"), "/repo", "/repo/.devchain/worktrees/feature-auth")
            .await
            .unwrap();

        assert_eq!(record.status, WorktreeStatus::Creating);
        assert_eq!(record.runtime_type, RuntimeType::Container);
        assert!(record.container_port.is_none());

        let by_name = store.get_by_name("feature-auth").await.unwrap().unwrap();
        assert_eq!(by_name.id, record.id);
        assert!(store.get_by_name("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_name_in_project_conflicts() {
        let db = Database::in_memory().await.unwrap();
        let store = db.worktrees();
        store.create(&sample("dup"), "/repo", "/wt").await.unwrap();
        let err = store.create(&sample("dup"), "/repo", "/wt2").await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn update_stamps_updated_at_and_persists() {
        let db = Database::in_memory().await.unwrap();
        let store = db.worktrees();
        let record = store.create(&sample("w"), "/repo", "/wt").await.unwrap();
        let before = record.updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = store
            .update(&record.id, |r| {
                r.status = WorktreeStatus::Running;
                r.container_port = Some(41001);
                r.container_id = Some("c-1".into());
            })
            .await
            .unwrap();

        assert!(updated.updated_at > before);
        let fetched = store.get_by_id(&record.id).await.unwrap();
        assert_eq!(fetched.status, WorktreeStatus::Running);
        assert_eq!(fetched.container_port, Some(41001));
    }

    #[tokio::test]
    async fn monitored_filters_running_and_error() {
        let db = Database::in_memory().await.unwrap();
        let store = db.worktrees();
        let a = store.create(&sample("a"), "/repo", "/a").await.unwrap();
        let b = store.create(&sample("b"), "/repo", "/b").await.unwrap();
        let _c = store.create(&sample("c"), "/repo", "/c").await.unwrap();

        store
            .update(&a.id, |r| r.status = WorktreeStatus::Running)
            .await
            .unwrap();
        store
            .update(&b.id, |r| r.status = WorktreeStatus::Error)
            .await
            .unwrap();

        let monitored = store.list_monitored().await.unwrap();
        assert_eq!(monitored.len(), 2);
    }

    #[tokio::test]
    async fn remove_deletes_row() {
        let db = Database::in_memory().await.unwrap();
        let store = db.worktrees();
        let record = store.create(&sample("gone"), "/repo", "/wt").await.unwrap();
        store.remove(&record.id).await.unwrap();
        assert!(store.get_by_id(&record.id).await.is_err());
    }
}
