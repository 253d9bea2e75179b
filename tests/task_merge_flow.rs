//! End-to-end task-merge behavior against a loopback stand-in for a
//! worktree container.

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use tempfile::TempDir;

use devchain::config::{OrchestratorConfig, OrchestratorMode};
use devchain::store::Database;
use devchain::taskmerge::TaskMergeEngine;
use devchain::worktree::{NewWorktree, RuntimeType, WorktreeStatus};

/// Serve a fixed container API on a random loopback port: two epics
/// (root done, child todo), two agents, two statuses, one profile.
async fn spawn_container_fixture() -> u16 {
    let app = Router::new()
        .route(
            "/api/epics",
            get(|| async {
                Json(serde_json::json!({ "epics": [
                    {
                        "id": "epic-root",
                        "title": "Root epic",
                        "statusId": "done-status",
                        "agentId": "agent-1",
                        "tags": ["backend"]
                    },
                    {
                        "id": "epic-child",
                        "title": "Child epic",
                        "statusId": "todo-status",
                        "agentId": "agent-2",
                        "parentEpicId": "epic-root"
                    }
                ]}))
            }),
        )
        .route(
            "/api/agents",
            get(|| async {
                Json(serde_json::json!({ "agents": [
                    { "id": "agent-1", "name": "Coder", "profileId": "prof-1" },
                    { "id": "agent-2", "name": "Reviewer" }
                ]}))
            }),
        )
        .route(
            "/api/statuses",
            get(|| async {
                Json(serde_json::json!({ "statuses": [
                    { "id": "done-status", "label": "Done", "color": "#28a745" },
                    { "id": "todo-status", "label": "To Do", "color": "#f0ad4e" }
                ]}))
            }),
        )
        .route(
            "/api/agent-profiles",
            get(|| async {
                Json(serde_json::json!({ "profiles": [
                    { "id": "prof-1", "name": "Implementer" }
                ]}))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

struct Harness {
    db: Database,
    engine: Arc<TaskMergeEngine>,
    worktree_id: String,
    _repo: TempDir,
}

async fn harness(container_port: u16) -> Harness {
    let repo = TempDir::new().unwrap();
    let config = OrchestratorConfig {
        mode: OrchestratorMode::Main,
        repo_root: Some(repo.path().to_path_buf()),
        ..Default::default()
    };
    let db = Database::in_memory().await.unwrap();

    let record = db
        .worktrees()
        .create(
            &NewWorktree {
                name: "feature-auth".into(),
                branch_name: "wt/feature-auth".into(),
                base_branch: "main".into(),
                owner_project_id: "proj-1".into(),
                runtime_type: RuntimeType::Container,
                template_slug: None,
                devchain_project_id: Some("p1".into()),
            },
            &repo.path().to_string_lossy(),
            "/unused",
        )
        .await
        .unwrap();
    db.worktrees()
        .update(&record.id, |r| {
            r.status = WorktreeStatus::Running;
            r.container_port = Some(container_port);
        })
        .await
        .unwrap();

    let engine = Arc::new(TaskMergeEngine::new(db.clone(), config));
    Harness {
        db,
        engine,
        worktree_id: record.id,
        _repo: repo,
    }
}

#[tokio::test]
async fn happy_merge_writes_dedup_rows_and_main_epics() {
    let port = spawn_container_fixture().await;
    let hx = harness(port).await;

    let report = hx
        .engine
        .merge_tasks_from_container(&hx.worktree_id)
        .await
        .unwrap();
    assert_eq!(report.epics_merged, 2);
    assert_eq!(report.agents_merged, 2);
    assert!(report.main_import_error.is_none());
    let stats = report.main_import.unwrap();
    assert_eq!(stats.imported, 2);
    assert_eq!(stats.unresolved_parents, 0);

    // Level 1: dedup rows with resolved labels and source-space parent.
    let epics = hx.db.merged().list_epics(&hx.worktree_id).await.unwrap();
    assert_eq!(epics.len(), 2);
    let child = epics
        .iter()
        .find(|e| e.source_epic_id == "epic-child")
        .unwrap();
    assert_eq!(child.parent_epic_id.as_deref(), Some("epic-root"));
    assert_eq!(child.status_name, "To Do");
    assert_eq!(child.agent_name.as_deref(), Some("Reviewer"));

    let agents = hx.db.merged().list_agents(&hx.worktree_id).await.unwrap();
    assert_eq!(agents.len(), 2);
    let coder = agents
        .iter()
        .find(|a| a.source_agent_id == "agent-1")
        .unwrap();
    assert_eq!(coder.profile_name.as_deref(), Some("Implementer"));
    assert_eq!(coder.epics_completed, 1);

    // Level 2: every source epic has exactly one marked main epic, and
    // the child's parent resolves to the root's import.
    let projects = hx.db.projects().list().await.unwrap();
    assert_eq!(projects.len(), 1);
    let main_epics = hx.db.projects().list_epics(&projects[0].id).await.unwrap();
    assert_eq!(main_epics.len(), 2);

    let root = main_epics
        .iter()
        .find(|e| e.merged_from() == Some((hx.worktree_id.as_str(), "epic-root")))
        .unwrap();
    let child = main_epics
        .iter()
        .find(|e| e.merged_from() == Some((hx.worktree_id.as_str(), "epic-child")))
        .unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    assert!(child.tags.contains(&"merged:feature-auth".to_string()));

    // The child's status was created by label in the main project.
    let statuses = hx.db.projects().list_statuses(&projects[0].id).await.unwrap();
    assert!(statuses.iter().any(|s| s.label == "To Do"));
    assert!(statuses.iter().any(|s| s.label == "Done"));
}

#[tokio::test]
async fn repeated_and_concurrent_merges_stay_idempotent() {
    let port = spawn_container_fixture().await;
    let hx = harness(port).await;

    let first = {
        let engine = Arc::clone(&hx.engine);
        let id = hx.worktree_id.clone();
        tokio::spawn(async move { engine.merge_tasks_from_container(&id).await })
    };
    let second = {
        let engine = Arc::clone(&hx.engine);
        let id = hx.worktree_id.clone();
        tokio::spawn(async move { engine.merge_tasks_from_container(&id).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // And once more, sequentially.
    hx.engine
        .merge_tasks_from_container(&hx.worktree_id)
        .await
        .unwrap();

    let epics = hx.db.merged().list_epics(&hx.worktree_id).await.unwrap();
    assert_eq!(epics.len(), 2);
    let agents = hx.db.merged().list_agents(&hx.worktree_id).await.unwrap();
    assert_eq!(agents.len(), 2);

    let projects = hx.db.projects().list().await.unwrap();
    let main_epics = hx.db.projects().list_epics(&projects[0].id).await.unwrap();
    assert_eq!(main_epics.len(), 2, "no duplicate main-project imports");
}

#[tokio::test]
async fn missing_container_port_is_a_precondition_failure() {
    let hx = harness(1).await;
    hx.db
        .worktrees()
        .update(&hx.worktree_id, |r| r.container_port = None)
        .await
        .unwrap();

    let err = hx
        .engine
        .merge_tasks_from_container(&hx.worktree_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "WORKTREE_NOT_SERVING");
    assert!(hx
        .db
        .merged()
        .list_epics(&hx.worktree_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unreachable_container_writes_no_rows() {
    // Port 1 refuses connections.
    let hx = harness(1).await;
    let err = hx
        .engine
        .merge_tasks_from_container(&hx.worktree_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONTAINER_UNREACHABLE");
    assert!(hx
        .db
        .merged()
        .list_epics(&hx.worktree_id)
        .await
        .unwrap()
        .is_empty());
}

/// A cyclic parent chain in the source data imports with null parents
/// and the `unresolvedParent` marker rather than aborting.
#[tokio::test]
async fn cyclic_parents_import_as_orphans() {
    let app = Router::new()
        .route(
            "/api/epics",
            get(|| async {
                Json(serde_json::json!([
                    { "id": "a", "title": "A", "parentEpicId": "b" },
                    { "id": "b", "title": "B", "parentEpicId": "a" }
                ]))
            }),
        )
        .route("/api/agents", get(|| async { Json(serde_json::json!([])) }))
        .route("/api/statuses", get(|| async { Json(serde_json::json!([])) }))
        .route(
            "/api/agent-profiles",
            get(|| async { Json(serde_json::json!([])) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let hx = harness(port).await;
    let report = hx
        .engine
        .merge_tasks_from_container(&hx.worktree_id)
        .await
        .unwrap();
    let stats = report.main_import.unwrap();
    assert_eq!(stats.imported, 2);
    assert_eq!(stats.unresolved_parents, 2);

    let projects = hx.db.projects().list().await.unwrap();
    let main_epics = hx.db.projects().list_epics(&projects[0].id).await.unwrap();
    for epic in &main_epics {
        assert!(epic.parent_id.is_none());
        assert_eq!(epic.data["mergedFrom"]["unresolvedParent"], true);
    }
}
