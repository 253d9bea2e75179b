//! Lazy overview snapshots combining durable rows, git ahead/behind and
//! live container metrics.
//!
//! Four independent 30-second caches keyed by worktree id. Each entry
//! carries a signature derived from the durable row; a cached value is
//! reused only when both the TTL and the signature match, so an
//! `updated_at` bump invalidates a snapshot even inside its window.
//! Failed live fetches are cached too; one unreachable worktree must
//! not retry on every request.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::git::{BranchStatus, GitRunner};
use crate::store::{Database, MergedEpicRow, MergedSummary};
use crate::taskmerge::ContainerClient;
use crate::worktree::{WorktreeRecord, WorktreeStatus};

const CACHE_TTL: Duration = Duration::from_secs(30);

struct CacheEntry<V> {
    value: V,
    signature: String,
    stored_at: Instant,
}

/// TTL + signature cache. Single mutex per cache; mutations are cheap.
struct TtlCache<V> {
    ttl: Duration,
    entries: StdMutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: StdMutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str, signature: &str) -> Option<V> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        if entry.signature == signature && entry.stored_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn put(&self, key: &str, signature: &str, value: V) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            CacheEntry {
                value,
                signature: signature.to_string(),
                stored_at: Instant::now(),
            },
        );
    }

    fn invalidate(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

/// Live container metrics block. On fetch failure the zeroed block is
/// recorded with the error and still cached.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LiveData {
    pub epics_total: u32,
    pub epics_by_status: BTreeMap<String, u32>,
    pub agents_total: u32,
    pub agents_active: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LiveData {
    fn failed(error: String) -> Self {
        Self {
            epics_total: 0,
            epics_by_status: BTreeMap::new(),
            agents_total: 0,
            agents_active: 0,
            error: Some(error),
        }
    }

    fn unavailable() -> Self {
        Self {
            epics_total: 0,
            epics_by_status: BTreeMap::new(),
            agents_total: 0,
            agents_active: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedOverview {
    pub epic_count: u32,
    pub agent_count: u32,
    pub latest_merged_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&MergedSummary> for MergedOverview {
    fn from(summary: &MergedSummary) -> Self {
        Self {
            epic_count: summary.epic_count,
            agent_count: summary.agent_count,
            latest_merged_at: summary.latest_merged_at,
        }
    }
}

/// Combined snapshot served to callers.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeSnapshot {
    pub id: String,
    pub name: String,
    pub branch_name: String,
    pub base_branch: String,
    pub status: WorktreeStatus,
    pub container_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitOverview>,
    pub live: LiveData,
    pub merged: MergedOverview,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GitOverview {
    pub commits_ahead: u32,
    pub commits_behind: u32,
}

impl From<BranchStatus> for GitOverview {
    fn from(status: BranchStatus) -> Self {
        Self {
            commits_ahead: status.commits_ahead,
            commits_behind: status.commits_behind,
        }
    }
}

/// A merged epic with its children, source-space parent links resolved.
#[derive(Debug, Clone, Serialize)]
pub struct EpicNode {
    pub epic: MergedEpicRow,
    pub children: Vec<EpicNode>,
}

pub struct OverviewCache {
    db: Database,
    git: Arc<GitRunner>,
    client: ContainerClient,
    snapshot_cache: TtlCache<WorktreeSnapshot>,
    git_cache: TtlCache<Option<GitOverview>>,
    live_cache: TtlCache<LiveData>,
    merged_cache: TtlCache<MergedSummary>,
}

impl OverviewCache {
    pub fn new(db: Database, git: Arc<GitRunner>) -> Self {
        Self {
            db,
            git,
            client: ContainerClient::new(),
            snapshot_cache: TtlCache::new(CACHE_TTL),
            git_cache: TtlCache::new(CACHE_TTL),
            live_cache: TtlCache::new(CACHE_TTL),
            merged_cache: TtlCache::new(CACHE_TTL),
        }
    }

    pub async fn snapshot(&self, worktree_id: &str) -> Result<WorktreeSnapshot> {
        let record = self.db.worktrees().get_by_id(worktree_id).await?;
        self.snapshot_for(&record).await
    }

    /// Snapshots for every stored worktree; each piece hits its cache
    /// independently.
    pub async fn fetch_all_worktree_statuses(&self) -> Result<Vec<WorktreeSnapshot>> {
        let records = self.db.worktrees().list().await?;
        let mut snapshots = Vec::with_capacity(records.len());
        for record in &records {
            snapshots.push(self.snapshot_for(record).await?);
        }
        Ok(snapshots)
    }

    async fn snapshot_for(&self, record: &WorktreeRecord) -> Result<WorktreeSnapshot> {
        let merged = self.merged_summary(record).await?;
        let signature = format!(
            "{}|{}|{}|{}",
            record.cache_signature(),
            merged.epic_count,
            merged.agent_count,
            merged
                .latest_merged_at
                .map(|t| t.timestamp_micros().to_string())
                .unwrap_or_default(),
        );

        if let Some(snapshot) = self.snapshot_cache.get(&record.id, &signature) {
            return Ok(snapshot);
        }

        let git = self.git_overview(record).await;
        let live = self.live_data(record).await;

        let snapshot = WorktreeSnapshot {
            id: record.id.clone(),
            name: record.name.clone(),
            branch_name: record.branch_name.clone(),
            base_branch: record.base_branch.clone(),
            status: record.status,
            container_port: record.container_port,
            git,
            live,
            merged: MergedOverview::from(&merged),
        };
        self.snapshot_cache.put(&record.id, &signature, snapshot.clone());
        Ok(snapshot)
    }

    async fn merged_summary(&self, record: &WorktreeRecord) -> Result<MergedSummary> {
        if let Some(summary) = self.merged_cache.get(&record.id, "") {
            return Ok(summary);
        }
        let summary = self.db.merged().summary(&record.id).await?;
        self.merged_cache.put(&record.id, "", summary.clone());
        Ok(summary)
    }

    async fn git_overview(&self, record: &WorktreeRecord) -> Option<GitOverview> {
        let signature = format!("{}|{}", record.base_branch, record.branch_name);
        if let Some(cached) = self.git_cache.get(&record.id, &signature) {
            return cached;
        }
        let repo = PathBuf::from(&record.repo_path);
        let overview = self
            .git
            .branch_status(Some(&repo), &record.base_branch, &record.branch_name)
            .await
            .ok()
            .map(GitOverview::from);
        self.git_cache.put(&record.id, &signature, overview);
        overview
    }

    async fn live_data(&self, record: &WorktreeRecord) -> LiveData {
        let (Some(port), Some(project_id)) = (
            record.container_port,
            record.devchain_project_id.as_deref(),
        ) else {
            return LiveData::unavailable();
        };
        if !record.status.is_available() {
            return LiveData::unavailable();
        }

        let signature = format!("{port}|{project_id}");
        if let Some(cached) = self.live_cache.get(&record.id, &signature) {
            return cached;
        }

        let live = match self.client.fetch_live_counts(port, project_id).await {
            Ok(counts) => LiveData {
                epics_total: counts.epics_total,
                epics_by_status: counts.epics_by_status,
                agents_total: counts.agents_total,
                agents_active: counts.agents_active,
                error: None,
            },
            Err(err) => LiveData::failed(err.to_string()),
        };
        self.live_cache.put(&record.id, &signature, live.clone());
        live
    }

    /// Drop every cached piece for one worktree.
    pub fn invalidate(&self, worktree_id: &str) {
        self.snapshot_cache.invalidate(worktree_id);
        self.git_cache.invalidate(worktree_id);
        self.live_cache.invalidate(worktree_id);
        self.merged_cache.invalidate(worktree_id);
    }

    /// Parent→children tree over merged-epic rows using source-space
    /// ids. Orphans (missing or foreign parents) are promoted to roots.
    /// Siblings and roots are ordered by ascending `merged_at`.
    pub async fn merged_epic_hierarchy(&self, worktree_id: &str) -> Result<Vec<EpicNode>> {
        let rows = self.db.merged().list_epics(worktree_id).await?;
        Ok(build_hierarchy(rows))
    }
}

fn build_hierarchy(rows: Vec<MergedEpicRow>) -> Vec<EpicNode> {
    let known: std::collections::HashSet<String> =
        rows.iter().map(|r| r.source_epic_id.clone()).collect();

    let mut children_of: HashMap<String, Vec<MergedEpicRow>> = HashMap::new();
    let mut roots = Vec::new();
    for row in rows {
        match row.parent_epic_id.clone() {
            Some(parent) if known.contains(&parent) => {
                children_of.entry(parent).or_default().push(row);
            }
            _ => roots.push(row),
        }
    }

    fn attach(row: MergedEpicRow, children_of: &mut HashMap<String, Vec<MergedEpicRow>>) -> EpicNode {
        let child_rows = children_of.remove(&row.source_epic_id).unwrap_or_default();
        EpicNode {
            epic: row,
            children: child_rows
                .into_iter()
                .map(|child| attach(child, children_of))
                .collect(),
        }
    }

    roots
        .into_iter()
        .map(|row| attach(row, &mut children_of))
        .collect()
}
