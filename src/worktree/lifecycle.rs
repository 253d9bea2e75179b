//! Worktree lifecycle: create, start, stop, merge, rebase, delete.
//!
//! This service exclusively owns a worktree's mutable state. Every
//! transition goes through the store, and every mutation publishes an
//! `orchestrator.worktree.activity` event through the events service so
//! the handler-table contract holds even for internal state changes.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::git::{GitRunner, MergeOutcome, RebaseOutcome};
use crate::store::Database;
use crate::taskmerge::TaskMergeEngine;
use crate::worktree::{NewWorktree, RuntimeManager, WorktreeRecord, WorktreeStatus};

pub struct WorktreeLifecycle {
    db: Database,
    git: Arc<GitRunner>,
    runtime: Arc<RuntimeManager>,
    events: EventBus,
    taskmerge: Arc<TaskMergeEngine>,
    config: OrchestratorConfig,
}

impl WorktreeLifecycle {
    pub fn new(
        db: Database,
        git: Arc<GitRunner>,
        runtime: Arc<RuntimeManager>,
        events: EventBus,
        taskmerge: Arc<TaskMergeEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            git,
            runtime,
            events,
            taskmerge,
            config,
        }
    }

    fn require_status(
        record: &WorktreeRecord,
        allowed: &[WorktreeStatus],
        action: &str,
    ) -> Result<()> {
        if allowed.contains(&record.status) {
            Ok(())
        } else {
            Err(OrchestratorError::precondition(
                "INVALID_STATUS",
                format!(
                    "cannot {action} worktree '{}' in status '{}'",
                    record.name, record.status
                ),
            ))
        }
    }

    async fn publish_activity(&self, record: &WorktreeRecord, kind: &str) {
        let payload = serde_json::json!({
            "worktreeId": record.id,
            "ownerProjectId": record.owner_project_id,
            "type": kind,
        });
        if let Err(err) = self
            .events
            .publish("orchestrator.worktree.activity", payload, None)
            .await
        {
            warn!("publishing worktree activity failed: {err}");
        }
    }

    async fn fail_worktree(&self, id: &str, message: String) -> Result<WorktreeRecord> {
        let record = self
            .db
            .worktrees()
            .update(id, |r| {
                r.status = WorktreeStatus::Error;
                r.error_message = Some(message);
            })
            .await?;
        self.publish_activity(&record, "errored").await;
        Ok(record)
    }

    /// Create the durable row, the git worktree and the runtime; ends in
    /// `running`, or `error` with the failure recorded.
    pub async fn create(&self, new: NewWorktree) -> Result<WorktreeRecord> {
        crate::git::validate_worktree_name(&new.name)?;
        crate::git::validate_ref_name(&new.branch_name)?;
        crate::git::validate_ref_name(&new.base_branch)?;

        let repo_root = self.config.resolve_repo_path();
        let worktree_path = self.config.worktrees_root(&repo_root).join(&new.name);

        let record = self
            .db
            .worktrees()
            .create(
                &new,
                &repo_root.to_string_lossy(),
                &worktree_path.to_string_lossy(),
            )
            .await?;

        if let Err(err) = self
            .git
            .create_worktree(
                &new.name,
                &new.branch_name,
                &new.base_branch,
                Some(&repo_root),
                Some(&worktree_path),
            )
            .await
        {
            self.fail_worktree(&record.id, err.to_string()).await?;
            return Err(err);
        }

        let provisioned = match self.runtime.provision(&record).await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                self.fail_worktree(&record.id, err.to_string()).await?;
                return Err(err);
            }
        };

        let record = self
            .db
            .worktrees()
            .update(&record.id, |r| {
                r.container_id = provisioned.container_id.clone();
                r.container_port = provisioned.container_port;
                r.status = WorktreeStatus::Running;
                r.error_message = None;
            })
            .await?;

        info!("worktree '{}' created on branch {}", record.name, record.branch_name);
        self.publish_activity(&record, "started").await;
        Ok(record)
    }

    /// Start a stopped or errored worktree and wait for its health
    /// predicate; a health timeout lands the worktree in `error`.
    pub async fn start(&self, id: &str) -> Result<WorktreeRecord> {
        let record = self.db.worktrees().get_by_id(id).await?;
        Self::require_status(
            &record,
            &[WorktreeStatus::Stopped, WorktreeStatus::Error],
            "start",
        )?;

        let port = match self.runtime.start(&record).await {
            Ok(port) => port,
            Err(err) => {
                self.fail_worktree(id, err.to_string()).await?;
                return Err(err);
            }
        };

        if let Err(err) = self.runtime.wait_healthy(&record, port).await {
            self.fail_worktree(id, err.to_string()).await?;
            return Err(err);
        }

        let record = self
            .db
            .worktrees()
            .update(id, |r| {
                r.status = WorktreeStatus::Running;
                r.container_port = port;
                r.error_message = None;
            })
            .await?;
        self.publish_activity(&record, "started").await;
        Ok(record)
    }

    /// Stop a running worktree's runtime, gracefully then forcibly.
    pub async fn stop(&self, id: &str) -> Result<WorktreeRecord> {
        let record = self.db.worktrees().get_by_id(id).await?;
        Self::require_status(&record, &[WorktreeStatus::Running], "stop")?;

        self.runtime.stop(&record).await?;

        let record = self
            .db
            .worktrees()
            .update(id, |r| {
                r.status = WorktreeStatus::Stopped;
                r.container_port = None;
            })
            .await?;
        self.publish_activity(&record, "stopped").await;
        Ok(record)
    }

    /// Merge the worktree's branch back into its base branch.
    ///
    /// Epics are extracted from the container *before* any branch is
    /// touched, so the task database survives even a conflicted merge.
    /// Conflicts are recorded on the row, move the worktree to `error`,
    /// and are never retried automatically.
    pub async fn merge(&self, id: &str, message: Option<&str>) -> Result<WorktreeRecord> {
        let record = self.db.worktrees().get_by_id(id).await?;
        Self::require_status(&record, &[WorktreeStatus::Running], "merge")?;

        let repo_root = PathBuf::from(&record.repo_path);
        let tree = self.git.working_tree_status(Some(&repo_root)).await?;
        if !tree.clean {
            return Err(OrchestratorError::precondition_with(
                "WORKING_TREE_DIRTY",
                format!(
                    "repository working tree is dirty; commit or stash before merging '{}'",
                    record.name
                ),
                serde_json::json!({ "status": tree.output }),
            ));
        }

        self.taskmerge.merge_tasks_from_container(id).await?;

        self.db
            .worktrees()
            .update(id, |r| r.status = WorktreeStatus::Merging)
            .await?;

        let outcome = match self
            .git
            .execute_merge(
                Some(&repo_root),
                &record.branch_name,
                &record.base_branch,
                message,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail_worktree(id, err.to_string()).await?;
                return Err(err);
            }
        };

        match outcome {
            MergeOutcome::Merged { commit } => {
                if let Err(err) = self.runtime.stop(&record).await {
                    warn!("post-merge runtime stop for '{}' failed: {err}", record.name);
                }
                let record = self
                    .db
                    .worktrees()
                    .update(id, |r| {
                        r.status = WorktreeStatus::Merged;
                        r.merge_commit = Some(commit.clone());
                        r.merge_conflicts = None;
                        r.container_port = None;
                    })
                    .await?;
                self.events
                    .publish(
                        "orchestrator.worktree.merged",
                        serde_json::json!({
                            "worktreeId": record.id,
                            "mergeCommit": commit,
                        }),
                        None,
                    )
                    .await?;
                self.publish_activity(&record, "merged").await;
                info!("worktree '{}' merged as {commit}", record.name);
                Ok(record)
            }
            MergeOutcome::Conflicted { conflicts, output } => {
                let joined = conflicts.join("\n");
                self.db
                    .worktrees()
                    .update(id, |r| {
                        r.status = WorktreeStatus::Error;
                        r.merge_conflicts = Some(joined.clone());
                        r.error_message = Some(format!("merge conflicts: {output}"));
                    })
                    .await?;
                let record = self.db.worktrees().get_by_id(id).await?;
                self.publish_activity(&record, "errored").await;
                Err(OrchestratorError::precondition_with(
                    "MERGE_CONFLICTS",
                    format!("merging '{}' produced conflicts", record.name),
                    serde_json::json!({ "conflicts": conflicts }),
                ))
            }
        }
    }

    /// Rebase the worktree branch onto its base. The worktree stays
    /// `running` either way; conflicts are reported to the caller.
    pub async fn rebase(&self, id: &str) -> Result<RebaseOutcome> {
        let record = self.db.worktrees().get_by_id(id).await?;
        Self::require_status(&record, &[WorktreeStatus::Running], "rebase")?;

        let worktree_path = PathBuf::from(&record.worktree_path);
        let outcome = self
            .git
            .execute_rebase(
                Some(&worktree_path),
                &record.base_branch,
                &record.branch_name,
            )
            .await?;

        if let RebaseOutcome::Conflicted { ref conflicts, .. } = outcome {
            info!(
                "rebase of '{}' reported {} conflicts",
                record.name,
                conflicts.len()
            );
        }
        Ok(outcome)
    }

    /// Delete the worktree: best-effort runtime teardown, worktree
    /// removal, optional branch deletion, row removal. Forbidden only
    /// while a merge is in flight.
    pub async fn delete(&self, id: &str, delete_branch: bool) -> Result<()> {
        let record = self.db.worktrees().get_by_id(id).await?;
        if record.status == WorktreeStatus::Merging {
            return Err(OrchestratorError::precondition(
                "INVALID_STATUS",
                format!("worktree '{}' is merging; wait for it to finish", record.name),
            ));
        }

        // A dead docker daemon must not make cleanup impossible: stop
        // and remove are best-effort on the delete path.
        if record.status == WorktreeStatus::Running {
            if let Err(err) = self.runtime.stop(&record).await {
                warn!("stopping runtime for '{}' failed: {err}", record.name);
            }
        }
        if let Err(err) = self.runtime.remove(&record).await {
            warn!("removing runtime for '{}' failed: {err}", record.name);
        }

        let repo_root = PathBuf::from(&record.repo_path);
        if let Err(err) = self
            .git
            .remove_worktree(&record.worktree_path, Some(&repo_root), true)
            .await
        {
            warn!("removing git worktree '{}' failed: {err}", record.name);
        }
        if delete_branch {
            if let Err(err) = self
                .git
                .delete_branch(&record.branch_name, Some(&repo_root), true)
                .await
            {
                warn!("deleting branch '{}' failed: {err}", record.branch_name);
            }
        }

        self.db.worktrees().remove(id).await?;
        self.publish_activity(&record, "deleted").await;
        info!("worktree '{}' deleted", record.name);
        Ok(())
    }

    /// Request an asynchronous task merge for a worktree through the
    /// event bus (the engine subscribes to this name).
    pub async fn request_task_merge(&self, id: &str) -> Result<String> {
        self.events
            .publish(
                "worktree.task-merge-requested",
                serde_json::json!({ "worktreeId": id }),
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorMode;
    use crate::realtime::RealtimeBus;
    use crate::subprocess::SubprocessManager;
    use crate::worktree::RuntimeType;
    use tempfile::TempDir;

    struct Fixture {
        lifecycle: WorktreeLifecycle,
        db: Database,
        _repo: TempDir,
    }

    async fn fixture(subprocess: SubprocessManager) -> Fixture {
        let repo = TempDir::new().unwrap();
        let config = OrchestratorConfig {
            mode: OrchestratorMode::Main,
            repo_root: Some(repo.path().to_path_buf()),
            ..Default::default()
        };
        let db = Database::in_memory().await.unwrap();
        let events = EventBus::new(db.events(), RealtimeBus::new());
        let git = Arc::new(GitRunner::new(
            subprocess.clone(),
            repo.path().to_path_buf(),
            config.worktrees_root(repo.path()),
        ));
        let runtime = Arc::new(RuntimeManager::new(subprocess, config.clone()));
        let taskmerge = Arc::new(TaskMergeEngine::new(db.clone(), config.clone()));
        let lifecycle =
            WorktreeLifecycle::new(db.clone(), git, runtime, events, taskmerge, config);
        Fixture {
            lifecycle,
            db,
            _repo: repo,
        }
    }

    fn new_process_worktree(name: &str) -> NewWorktree {
        NewWorktree {
            name: name.to_string(),
            branch_name: format!("wt/{name}"),
            base_branch: "main".to_string(),
            owner_project_id: "proj-1".to_string(),
            runtime_type: RuntimeType::Process,
            template_slug: None,
            devchain_project_id: Some("p1".to_string()),
        }
    }

    #[tokio::test]
    async fn create_transitions_to_running_and_publishes_activity() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree"))
            .finish();

        let fx = fixture(subprocess).await;
        let record = fx
            .lifecycle
            .create(new_process_worktree("feature-auth"))
            .await
            .unwrap();
        assert_eq!(record.status, WorktreeStatus::Running);

        let events = fx
            .db
            .events()
            .list(&Default::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["type"], "started");
        assert_eq!(events[0].payload["ownerProjectId"], "proj-1");
    }

    #[tokio::test]
    async fn create_failure_lands_in_error_with_message() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree"))
            .returns_stderr("fatal: 'wt/broken' already exists")
            .returns_exit_code(128)
            .finish();

        let fx = fixture(subprocess).await;
        let err = fx
            .lifecycle
            .create(new_process_worktree("broken"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let record = fx.db.worktrees().get_by_name("broken").await.unwrap().unwrap();
        assert_eq!(record.status, WorktreeStatus::Error);
        assert!(record.error_message.unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn stop_requires_running() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree"))
            .finish();

        let fx = fixture(subprocess).await;
        let record = fx
            .lifecycle
            .create(new_process_worktree("w"))
            .await
            .unwrap();

        fx.lifecycle.stop(&record.id).await.unwrap();
        let err = fx.lifecycle.stop(&record.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS");
    }

    #[tokio::test]
    async fn delete_is_forbidden_while_merging() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree"))
            .finish();

        let fx = fixture(subprocess).await;
        let record = fx
            .lifecycle
            .create(new_process_worktree("busy"))
            .await
            .unwrap();
        fx.db
            .worktrees()
            .update(&record.id, |r| r.status = WorktreeStatus::Merging)
            .await
            .unwrap();

        let err = fx.lifecycle.delete(&record.id, false).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS");
        assert!(fx.db.worktrees().get_by_id(&record.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_proceeds_when_git_cleanup_fails() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree") && args.get(1).map(String::as_str) == Some("add"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree") && args.get(1).map(String::as_str) == Some("remove"))
            .returns_stderr("fatal: not a working tree")
            .returns_exit_code(128)
            .finish();

        let fx = fixture(subprocess).await;
        let record = fx
            .lifecycle
            .create(new_process_worktree("doomed"))
            .await
            .unwrap();

        fx.lifecycle.delete(&record.id, false).await.unwrap();
        assert!(fx.db.worktrees().get_by_id(&record.id).await.is_err());
    }

    #[tokio::test]
    async fn merge_requires_clean_working_tree() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("status"))
            .returns_stdout(" M src/main.rs\n")
            .finish();

        let fx = fixture(subprocess).await;
        let record = fx
            .lifecycle
            .create(new_process_worktree("dirty"))
            .await
            .unwrap();

        let err = fx.lifecycle.merge(&record.id, None).await.unwrap_err();
        assert_eq!(err.code(), "WORKING_TREE_DIRTY");
        // Status untouched: still running, not merging.
        let record = fx.db.worktrees().get_by_id(&record.id).await.unwrap();
        assert_eq!(record.status, WorktreeStatus::Running);
    }

    #[tokio::test]
    async fn create_rejects_bad_names_before_any_side_effect() {
        let (subprocess, _mock) = SubprocessManager::mock();
        let fx = fixture(subprocess).await;
        let mut bad = new_process_worktree("x");
        bad.name = "bad name".into();
        bad.branch_name = "wt/bad".into();
        let err = fx.lifecycle.create(bad).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(fx.db.worktrees().list().await.unwrap().is_empty());
    }
}
