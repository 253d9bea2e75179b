//! Two-level idempotent task import from worktree containers.
//!
//! Level 1 writes content-addressed dedup rows local to the
//! orchestrator (`merged_epics` / `merged_agents`, keyed by worktree id
//! plus source id). Level 2, main mode only, re-projects those epics
//! into the main project's epic table with parent-child topology, keyed
//! by the `data.mergedFrom` marker.
//!
//! Container unreachable fails the whole operation before any row is
//! written. A Level-2 failure is surfaced in the report but never
//! undoes Level-1 rows; they are independently useful.

pub mod container;
pub mod import;

pub use container::{ContainerClient, ContainerSnapshot, LiveCounts, SourceAgent, SourceEpic};
pub use import::{ImportStats, MainImporter};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::store::{Database, MergedAgentRow, MergedEpicRow};
use crate::worktree::WorktreeRecord;

/// Label and color assigned when a status id cannot be resolved.
const UNKNOWN_STATUS_COLOR: &str = "#6c757d";

/// A source epic after normalization: trimmed ids, non-blank title,
/// resolved status label/color and agent display name.
#[derive(Debug, Clone)]
pub struct NormalizedEpic {
    pub source_epic_id: String,
    pub title: String,
    pub status_label: String,
    pub status_color: String,
    pub agent_name: Option<String>,
    pub parent_epic_id: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskMergeReport {
    pub epics_merged: u32,
    pub agents_merged: u32,
    pub main_import: Option<ImportStats>,
    pub main_import_error: Option<String>,
}

pub struct TaskMergeEngine {
    db: Database,
    config: OrchestratorConfig,
    client: ContainerClient,
    merge_lock: Arc<AsyncMutex<()>>,
}

/// Resolve every source status id to a display label + color.
fn build_status_map(snapshot: &ContainerSnapshot) -> HashMap<String, (String, String)> {
    snapshot
        .statuses
        .iter()
        .filter(|s| !s.id.trim().is_empty())
        .map(|s| {
            let label = if s.label.trim().is_empty() {
                format!("Unknown ({})", s.id.trim())
            } else {
                s.label.trim().to_string()
            };
            let color = s
                .color
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_STATUS_COLOR.to_string());
            (s.id.trim().to_string(), (label, color))
        })
        .collect()
}

fn resolve_status(
    status_id: Option<&str>,
    statuses: &HashMap<String, (String, String)>,
) -> (String, String) {
    match status_id.map(str::trim).filter(|s| !s.is_empty()) {
        None => ("Unknown".to_string(), UNKNOWN_STATUS_COLOR.to_string()),
        Some(id) => statuses.get(id).cloned().unwrap_or_else(|| {
            (
                format!("Unknown ({id})"),
                UNKNOWN_STATUS_COLOR.to_string(),
            )
        }),
    }
}

/// Normalize raw container epics: trim ids, default blank titles,
/// drop entries missing an id, resolve statuses and agent names.
pub fn normalize_epics(snapshot: &ContainerSnapshot) -> Vec<NormalizedEpic> {
    let statuses = build_status_map(snapshot);
    let agent_names: HashMap<String, String> = snapshot
        .agents
        .iter()
        .filter(|a| !a.id.trim().is_empty())
        .map(|a| (a.id.trim().to_string(), a.name.trim().to_string()))
        .collect();

    snapshot
        .epics
        .iter()
        .filter_map(|epic| {
            let id = epic.id.trim();
            if id.is_empty() {
                return None;
            }
            let title = if epic.title.trim().is_empty() {
                "Untitled Epic".to_string()
            } else {
                epic.title.trim().to_string()
            };
            let (status_label, status_color) =
                resolve_status(epic.status_id.as_deref(), &statuses);
            let agent_name = epic
                .agent_id
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(|agent_id| {
                    agent_names
                        .get(agent_id)
                        .filter(|name| !name.is_empty())
                        .cloned()
                        .unwrap_or_else(|| format!("Unknown ({agent_id})"))
                });
            Some(NormalizedEpic {
                source_epic_id: id.to_string(),
                title,
                status_label,
                status_color,
                agent_name,
                parent_epic_id: epic
                    .parent_epic_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
                tags: epic.tags.clone(),
            })
        })
        .collect()
}

/// Epics-per-agent counted from the source data; the canonical
/// `epics_completed` when the container does not provide one.
fn count_epics_per_agent(epics: &[SourceEpic]) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for epic in epics {
        if let Some(agent_id) = epic.agent_id.as_deref().map(str::trim) {
            if !agent_id.is_empty() {
                *counts.entry(agent_id.to_string()).or_insert(0) += 1;
            }
        }
    }
    counts
}

impl TaskMergeEngine {
    pub fn new(db: Database, config: OrchestratorConfig) -> Self {
        Self {
            db,
            config,
            client: ContainerClient::new(),
            merge_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Pull epics and agents out of the worktree's container and write
    /// dedup rows; in main mode, also import into the main project.
    /// Safe to call repeatedly and concurrently for the same worktree.
    pub async fn merge_tasks_from_container(&self, worktree_id: &str) -> Result<TaskMergeReport> {
        let worktree = self.db.worktrees().get_by_id(worktree_id).await?;
        let port = worktree.container_port.ok_or_else(|| {
            OrchestratorError::precondition(
                "WORKTREE_NOT_SERVING",
                format!("worktree '{}' has no container port", worktree.name),
            )
        })?;
        let project_id = worktree.devchain_project_id.clone().ok_or_else(|| {
            OrchestratorError::precondition(
                "WORKTREE_NOT_SERVING",
                format!("worktree '{}' has no devchain project id", worktree.name),
            )
        })?;

        let snapshot = self.client.fetch_snapshot(port, &project_id).await?;
        let normalized = normalize_epics(&snapshot);
        let epic_rows = self.build_epic_rows(&worktree, &normalized);
        let agent_rows = self.build_agent_rows(&worktree, &snapshot);

        self.db.merged().insert_batch(&epic_rows, &agent_rows).await?;
        info!(
            "merged {} epics / {} agents from worktree '{}'",
            epic_rows.len(),
            agent_rows.len(),
            worktree.name
        );

        let mut report = TaskMergeReport {
            epics_merged: epic_rows.len() as u32,
            agents_merged: agent_rows.len() as u32,
            main_import: None,
            main_import_error: None,
        };

        if self.config.is_main_mode() {
            match self.import_into_main_project(&worktree, &normalized).await {
                Ok(stats) => report.main_import = Some(stats),
                Err(err) => {
                    warn!(
                        "main-project import failed for worktree '{}': {err}",
                        worktree.name
                    );
                    report.main_import_error = Some(err.to_string());
                }
            }
        }

        Ok(report)
    }

    fn build_epic_rows(
        &self,
        worktree: &WorktreeRecord,
        normalized: &[NormalizedEpic],
    ) -> Vec<MergedEpicRow> {
        normalized
            .iter()
            .map(|epic| {
                let mut row =
                    MergedEpicRow::new(&worktree.id, &epic.source_epic_id, &epic.title);
                row.status_name = epic.status_label.clone();
                row.status_color = epic.status_color.clone();
                row.agent_name = epic.agent_name.clone();
                row.parent_epic_id = epic.parent_epic_id.clone();
                row.tags = epic.tags.clone();
                row
            })
            .collect()
    }

    fn build_agent_rows(
        &self,
        worktree: &WorktreeRecord,
        snapshot: &ContainerSnapshot,
    ) -> Vec<MergedAgentRow> {
        let profile_names: HashMap<String, String> = snapshot
            .profiles
            .iter()
            .filter(|p| !p.id.trim().is_empty())
            .map(|p| (p.id.trim().to_string(), p.name.trim().to_string()))
            .collect();
        let counted = count_epics_per_agent(&snapshot.epics);

        snapshot
            .agents
            .iter()
            .filter_map(|agent| {
                let id = agent.id.trim();
                if id.is_empty() {
                    return None;
                }
                let name = if agent.name.trim().is_empty() {
                    format!("Unknown ({id})")
                } else {
                    agent.name.trim().to_string()
                };
                let mut row = MergedAgentRow::new(&worktree.id, id, &name);
                row.profile_name = agent
                    .profile_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|profile_id| {
                        profile_names
                            .get(profile_id)
                            .filter(|n| !n.is_empty())
                            .cloned()
                            .unwrap_or_else(|| format!("Unknown ({profile_id})"))
                    });
                row.epics_completed = agent
                    .epics_completed
                    .unwrap_or_else(|| counted.get(id).copied().unwrap_or(0));
                Some(row)
            })
            .collect()
    }

    async fn import_into_main_project(
        &self,
        worktree: &WorktreeRecord,
        normalized: &[NormalizedEpic],
    ) -> Result<ImportStats> {
        let repo_root = self.config.resolve_repo_path();
        let project_name = repo_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "main".to_string());
        let project = self
            .db
            .projects()
            .get_or_create_by_path(&project_name, &repo_root.to_string_lossy())
            .await?;

        let importer = MainImporter::new(self.db.pool().clone(), Arc::clone(&self.merge_lock));
        importer
            .import_epics(&project.id, worktree, normalized)
            .await
    }

    /// Subscribe this engine to `worktree.task-merge-requested`.
    pub fn register_subscriber(self: &Arc<Self>, bus: &EventBus) {
        let engine = Arc::clone(self);
        bus.subscribe(
            "worktree.task-merge-requested",
            "taskmerge.engine",
            Arc::new(move |payload| {
                let engine = Arc::clone(&engine);
                Box::pin(async move {
                    let worktree_id = payload
                        .get("worktreeId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("payload missing worktreeId"))?
                        .to_string();
                    let report = engine
                        .merge_tasks_from_container(&worktree_id)
                        .await
                        .map_err(|e| anyhow::anyhow!("{e}"))?;
                    Ok(format!(
                        "merged {} epics, {} agents",
                        report.epics_merged, report.agents_merged
                    ))
                })
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::container::{SourceProfile, SourceStatus};
    use super::*;

    fn epic(id: &str, title: &str, status: Option<&str>, agent: Option<&str>, parent: Option<&str>) -> SourceEpic {
        SourceEpic {
            id: id.to_string(),
            title: title.to_string(),
            status_id: status.map(str::to_string),
            agent_id: agent.map(str::to_string),
            parent_epic_id: parent.map(str::to_string),
            tags: Vec::new(),
        }
    }

    fn snapshot() -> ContainerSnapshot {
        ContainerSnapshot {
            epics: vec![
                epic("epic-root", "Root", Some("done-status"), Some("agent-1"), None),
                epic("epic-child", "", Some("todo-status"), Some("agent-1"), Some("epic-root")),
                epic("  ", "dropped: no id", None, None, None),
                epic("epic-odd", "Odd", Some("mystery"), Some("ghost"), None),
            ],
            agents: vec![
                SourceAgent {
                    id: "agent-1".into(),
                    name: "Coder".into(),
                    profile_id: Some("prof-1".into()),
                    epics_completed: None,
                },
                SourceAgent {
                    id: "agent-2".into(),
                    name: "Reviewer".into(),
                    profile_id: None,
                    epics_completed: Some(7),
                },
            ],
            statuses: vec![
                SourceStatus {
                    id: "done-status".into(),
                    label: "Done".into(),
                    color: Some("#28a745".into()),
                },
                SourceStatus {
                    id: "todo-status".into(),
                    label: "To Do".into(),
                    color: Some("#f0ad4e".into()),
                },
            ],
            profiles: vec![SourceProfile {
                id: "prof-1".into(),
                name: "Implementer".into(),
            }],
        }
    }

    #[test]
    fn normalization_rules() {
        let normalized = normalize_epics(&snapshot());
        assert_eq!(normalized.len(), 3);

        let root = &normalized[0];
        assert_eq!(root.status_label, "Done");
        assert_eq!(root.status_color, "#28a745");
        assert_eq!(root.agent_name.as_deref(), Some("Coder"));

        let child = &normalized[1];
        assert_eq!(child.title, "Untitled Epic");
        assert_eq!(child.parent_epic_id.as_deref(), Some("epic-root"));
        assert_eq!(child.status_label, "To Do");

        let odd = &normalized[2];
        assert_eq!(odd.status_label, "Unknown (mystery)");
        assert_eq!(odd.status_color, "#6c757d");
        assert_eq!(odd.agent_name.as_deref(), Some("Unknown (ghost)"));
    }

    #[test]
    fn epics_per_agent_counted_from_source() {
        let counts = count_epics_per_agent(&snapshot().epics);
        assert_eq!(counts.get("agent-1"), Some(&2));
        assert_eq!(counts.get("agent-2"), None);
    }

    #[test]
    fn missing_statuses_fall_back_to_unknown_labels() {
        let mut snap = snapshot();
        snap.statuses.clear();
        let normalized = normalize_epics(&snap);
        assert_eq!(normalized[0].status_label, "Unknown (done-status)");
        assert_eq!(normalized[0].status_color, "#6c757d");
    }
}
