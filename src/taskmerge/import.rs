//! Level-2 import: re-projection of a worktree's epics into the main
//! project's own epic table.
//!
//! Idempotency key: the `data.mergedFrom = {worktreeId, sourceEpicId}`
//! marker on each imported epic. The check-then-insert window is closed
//! by the process-wide SQLite merge lock plus a re-check inside `BEGIN
//! IMMEDIATE`; two concurrent merges of the same worktree cannot both
//! pass the pre-check.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::store::ProjectStore;
use crate::worktree::WorktreeRecord;

use super::NormalizedEpic;

/// Default color for statuses created during import.
const IMPORT_STATUS_COLOR_FALLBACK: &str = "#6c757d";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: u32,
    pub already_present: u32,
    pub unresolved_parents: u32,
}

pub struct MainImporter {
    pool: SqlitePool,
    projects: ProjectStore,
    merge_lock: Arc<AsyncMutex<()>>,
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl MainImporter {
    pub fn new(pool: SqlitePool, merge_lock: Arc<AsyncMutex<()>>) -> Self {
        Self {
            projects: ProjectStore::new(pool.clone()),
            pool,
            merge_lock,
        }
    }

    /// Import `epics` into `main_project_id`, preserving parent-child
    /// topology where resolvable. Pass 1 walks epics topologically
    /// (parent absent or already imported); pass 2 imports leftovers
    /// (cycles and dangling parents) with `parentId = NULL` and an
    /// `unresolvedParent` marker.
    pub async fn import_epics(
        &self,
        main_project_id: &str,
        worktree: &WorktreeRecord,
        epics: &[NormalizedEpic],
    ) -> Result<ImportStats> {
        let mut stats = ImportStats::default();

        // source epic id -> main epic id, seeded from prior imports of
        // this worktree.
        let mut resolved: HashMap<String, String> = HashMap::new();
        for epic in self.projects.list_epics(main_project_id).await? {
            if let Some((wt, source)) = epic.merged_from() {
                if wt == worktree.id {
                    resolved.insert(source.to_string(), epic.id.clone());
                }
            }
        }

        let mut status_ids: HashMap<String, String> = self
            .projects
            .list_statuses(main_project_id)
            .await?
            .into_iter()
            .map(|s| (normalize_key(&s.label), s.id))
            .collect();
        let agent_ids: HashMap<String, String> = self
            .projects
            .list_agents(main_project_id)
            .await?
            .into_iter()
            .map(|a| (normalize_key(&a.name), a.id))
            .collect();

        let mut pending: Vec<&NormalizedEpic> = epics
            .iter()
            .filter(|e| !resolved.contains_key(&e.source_epic_id))
            .collect();
        stats.already_present = (epics.len() - pending.len()) as u32;

        // Pass 1, topological. Repeat until a sweep makes no progress.
        loop {
            let mut progressed = false;
            let mut still_pending = Vec::new();

            for epic in pending {
                // Ready when parentless or the parent is already mapped;
                // in-set parents resolve on a later sweep, everything
                // else falls through to the orphan pass.
                let parent_ready = match &epic.parent_epic_id {
                    None => true,
                    Some(parent) => resolved.contains_key(parent),
                };
                if !parent_ready {
                    still_pending.push(epic);
                    continue;
                }

                let parent_main_id = epic
                    .parent_epic_id
                    .as_ref()
                    .and_then(|p| resolved.get(p).cloned());
                let status_id = self
                    .ensure_status(main_project_id, &mut status_ids, epic)
                    .await?;
                let agent_id = epic
                    .agent_name
                    .as_ref()
                    .and_then(|name| agent_ids.get(&normalize_key(name)).cloned());

                let outcome = self
                    .insert_epic_deduped(
                        main_project_id,
                        worktree,
                        epic,
                        status_id,
                        agent_id,
                        parent_main_id,
                        false,
                    )
                    .await?;
                match outcome {
                    InsertOutcome::Inserted(main_id) => {
                        stats.imported += 1;
                        resolved.insert(epic.source_epic_id.clone(), main_id);
                    }
                    InsertOutcome::AlreadyPresent(main_id) => {
                        stats.already_present += 1;
                        resolved.insert(epic.source_epic_id.clone(), main_id);
                    }
                }
                progressed = true;
            }

            pending = still_pending;
            if pending.is_empty() || !progressed {
                break;
            }
        }

        // Pass 2, orphans: cycles and parents outside the set.
        for epic in pending {
            let status_id = self
                .ensure_status(main_project_id, &mut status_ids, epic)
                .await?;
            let agent_id = epic
                .agent_name
                .as_ref()
                .and_then(|name| agent_ids.get(&normalize_key(name)).cloned());
            let outcome = self
                .insert_epic_deduped(
                    main_project_id,
                    worktree,
                    epic,
                    status_id,
                    agent_id,
                    None,
                    true,
                )
                .await?;
            match outcome {
                InsertOutcome::Inserted(main_id) => {
                    stats.imported += 1;
                    stats.unresolved_parents += 1;
                    resolved.insert(epic.source_epic_id.clone(), main_id);
                }
                InsertOutcome::AlreadyPresent(_) => stats.already_present += 1,
            }
        }

        debug!(
            "main import for worktree {}: {} imported, {} already present, {} orphaned",
            worktree.name, stats.imported, stats.already_present, stats.unresolved_parents
        );
        Ok(stats)
    }

    async fn ensure_status(
        &self,
        project_id: &str,
        status_ids: &mut HashMap<String, String>,
        epic: &NormalizedEpic,
    ) -> Result<Option<String>> {
        let key = normalize_key(&epic.status_label);
        if key.is_empty() {
            return Ok(None);
        }
        if let Some(id) = status_ids.get(&key) {
            return Ok(Some(id.clone()));
        }
        let color = if epic.status_color.is_empty() {
            IMPORT_STATUS_COLOR_FALLBACK
        } else {
            &epic.status_color
        };
        let created = self
            .projects
            .create_status(project_id, &epic.status_label, color)
            .await?;
        status_ids.insert(key, created.id.clone());
        Ok(Some(created.id))
    }

    /// One epic insert under the merge lock. Inside: BEGIN IMMEDIATE,
    /// re-check the marker, insert only if still absent, COMMIT.
    #[allow(clippy::too_many_arguments)]
    async fn insert_epic_deduped(
        &self,
        project_id: &str,
        worktree: &WorktreeRecord,
        epic: &NormalizedEpic,
        status_id: Option<String>,
        agent_id: Option<String>,
        parent_main_id: Option<String>,
        unresolved_parent: bool,
    ) -> Result<InsertOutcome> {
        let _merge_guard = self.merge_lock.lock().await;
        let mut conn = self.pool.acquire().await?;

        sqlx::query("BEGIN IMMEDIATE TRANSACTION")
            .execute(&mut *conn)
            .await?;

        let result: Result<InsertOutcome> = async {
            let existing = sqlx::query(
                r#"
                SELECT id FROM epics
                WHERE project_id = ?
                  AND json_extract(data, '$.mergedFrom.worktreeId') = ?
                  AND json_extract(data, '$.mergedFrom.sourceEpicId') = ?
                LIMIT 1
                "#,
            )
            .bind(project_id)
            .bind(&worktree.id)
            .bind(&epic.source_epic_id)
            .fetch_optional(&mut *conn)
            .await?;

            if let Some(row) = existing {
                return Ok(InsertOutcome::AlreadyPresent(row.get("id")));
            }

            let mut merged_from = serde_json::json!({
                "worktreeId": worktree.id,
                "sourceEpicId": epic.source_epic_id,
            });
            if let Some(ref parent) = epic.parent_epic_id {
                merged_from["sourceParentEpicId"] = serde_json::Value::String(parent.clone());
            }
            if unresolved_parent {
                merged_from["unresolvedParent"] = serde_json::Value::Bool(true);
            }
            let data = serde_json::json!({ "mergedFrom": merged_from });

            let mut tags = epic.tags.clone();
            tags.push(format!("merged:{}", worktree.name));

            let id = Uuid::new_v4().to_string();
            let now = Utc::now();
            sqlx::query(
                r#"
                INSERT INTO epics
                    (id, project_id, title, status_id, agent_id, parent_id,
                     tags, data, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(project_id)
            .bind(&epic.title)
            .bind(&status_id)
            .bind(&agent_id)
            .bind(&parent_main_id)
            .bind(serde_json::to_string(&tags).unwrap_or_else(|_| "[]".into()))
            .bind(data.to_string())
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;

            Ok(InsertOutcome::Inserted(id))
        }
        .await;

        match result {
            Ok(outcome) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(outcome)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }
}

enum InsertOutcome {
    Inserted(String),
    AlreadyPresent(String),
}
