//! Serialized git access for worktree orchestration.
//!
//! Every git invocation issued through a [`GitRunner`] flows through one
//! FIFO queue: callers enqueue work, a single worker task executes jobs
//! in submission order, and no two git commands ever overlap for that
//! runner. git does not tolerate concurrent index writes; this queue is
//! the system's concurrency baseline for git correctness. Composite
//! operations (merge, rebase, preview) run as one queue job so they
//! observe a working tree no other command can have touched since the
//! last dequeue.
//!
//! Errors do not poison the queue; a failed job only fails its caller.

pub mod ops;
pub mod parsing;
pub mod validation;

pub use ops::{
    BranchStatus, CreatedWorktree, MergeOutcome, MergePreview, RebaseOutcome, WorkingTreeStatus,
};
pub use parsing::{DiffStatTotals as ChangeSummary, WorktreeListEntry};
pub use validation::{validate_ref_name, validate_worktree_name};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use crate::error::{OrchestratorError, Result};
use crate::subprocess::SubprocessManager;

type QueueJob = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct GitRunner {
    subprocess: SubprocessManager,
    tx: mpsc::UnboundedSender<QueueJob>,
    default_repo: PathBuf,
    worktrees_root: PathBuf,
}

impl GitRunner {
    /// `default_repo` is used when a caller passes no repository path
    /// (REPO_ROOT in main mode, cwd otherwise; resolved by config).
    /// `worktrees_root` is where unnamed worktree checkouts land.
    pub fn new(
        subprocess: SubprocessManager,
        default_repo: PathBuf,
        worktrees_root: PathBuf,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self {
            subprocess,
            tx,
            default_repo,
            worktrees_root,
        }
    }

    fn resolve_repo(&self, repo_path: Option<&Path>) -> PathBuf {
        repo_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_repo.clone())
    }

    /// Enqueue a job and wait for its result. Jobs execute strictly in
    /// submission order.
    async fn submit<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: QueueJob = Box::pin(async move {
            let _ = reply_tx.send(fut.await);
        });
        self.tx
            .send(job)
            .map_err(|_| OrchestratorError::external("git queue worker has stopped"))?;
        reply_rx
            .await
            .map_err(|_| OrchestratorError::external("git queue dropped the job"))?
    }

    pub async fn create_worktree(
        &self,
        name: &str,
        branch_name: &str,
        base_branch: &str,
        repo_path: Option<&Path>,
        worktree_path: Option<&Path>,
    ) -> Result<CreatedWorktree> {
        validate_worktree_name(name)?;
        validate_ref_name(branch_name)?;
        validate_ref_name(base_branch)?;
        let repo = self.resolve_repo(repo_path);
        let path = worktree_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.worktrees_root.join(name));
        self.submit(ops::create_worktree(
            self.subprocess.clone(),
            repo,
            name.to_string(),
            branch_name.to_string(),
            base_branch.to_string(),
            path,
        ))
        .await
    }

    pub async fn remove_worktree(
        &self,
        name_or_path: &str,
        repo_path: Option<&Path>,
        force: bool,
    ) -> Result<()> {
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::remove_worktree(
            self.subprocess.clone(),
            repo,
            name_or_path.to_string(),
            force,
        ))
        .await
    }

    pub async fn list_worktrees(&self, repo_path: Option<&Path>) -> Result<Vec<WorktreeListEntry>> {
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::list_worktrees(self.subprocess.clone(), repo))
            .await
    }

    pub async fn list_branches(&self, repo_path: Option<&Path>) -> Result<Vec<String>> {
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::list_branches(self.subprocess.clone(), repo))
            .await
    }

    pub async fn delete_branch(
        &self,
        name: &str,
        repo_path: Option<&Path>,
        force: bool,
    ) -> Result<()> {
        validate_ref_name(name)?;
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::delete_branch(
            self.subprocess.clone(),
            repo,
            name.to_string(),
            force,
        ))
        .await
    }

    pub async fn branch_status(
        &self,
        repo_path: Option<&Path>,
        base: &str,
        branch: &str,
    ) -> Result<BranchStatus> {
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::branch_status(
            self.subprocess.clone(),
            repo,
            base.to_string(),
            branch.to_string(),
        ))
        .await
    }

    pub async fn change_summary(
        &self,
        path: &Path,
        base_ref: Option<&str>,
    ) -> Result<ChangeSummary> {
        self.submit(ops::change_summary(
            self.subprocess.clone(),
            path.to_path_buf(),
            base_ref.unwrap_or("HEAD").to_string(),
        ))
        .await
    }

    pub async fn working_tree_status(
        &self,
        repo_path: Option<&Path>,
    ) -> Result<WorkingTreeStatus> {
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::working_tree_status(self.subprocess.clone(), repo))
            .await
    }

    pub async fn preview_merge(
        &self,
        repo_path: Option<&Path>,
        source: &str,
        target: &str,
    ) -> Result<MergePreview> {
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::preview_merge(
            self.subprocess.clone(),
            repo,
            source.to_string(),
            target.to_string(),
        ))
        .await
    }

    pub async fn execute_merge(
        &self,
        repo_path: Option<&Path>,
        source: &str,
        target: &str,
        message: Option<&str>,
    ) -> Result<MergeOutcome> {
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::execute_merge(
            self.subprocess.clone(),
            repo,
            source.to_string(),
            target.to_string(),
            message.map(str::to_string),
        ))
        .await
    }

    pub async fn execute_rebase(
        &self,
        repo_path: Option<&Path>,
        source: &str,
        target: &str,
    ) -> Result<RebaseOutcome> {
        let repo = self.resolve_repo(repo_path);
        self.submit(ops::execute_rebase(
            self.subprocess.clone(),
            repo,
            source.to_string(),
            target.to_string(),
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn runner_with(subprocess: SubprocessManager) -> GitRunner {
        GitRunner::new(
            subprocess,
            PathBuf::from("/repo"),
            PathBuf::from("/repo/.devchain/worktrees"),
        )
    }

    #[tokio::test]
    async fn queue_preserves_submission_order() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("for-each-ref"))
            .delays(Duration::from_millis(50))
            .returns_stdout("main\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("status"))
            .returns_stdout("")
            .finish();

        let runner = Arc::new(runner_with(subprocess));
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow = {
            let runner = Arc::clone(&runner);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                runner.list_branches(None).await.unwrap();
                order.lock().unwrap().push("branches");
            })
        };
        // Give the first submission a head start so ordering is fixed.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fast = {
            let runner = Arc::clone(&runner);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                runner.working_tree_status(None).await.unwrap();
                order.lock().unwrap().push("status");
            })
        };

        slow.await.unwrap();
        fast.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["branches", "status"]);
    }

    #[tokio::test]
    async fn failure_does_not_poison_queue() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("for-each-ref"))
            .returns_stderr("fatal: not a git repository")
            .returns_exit_code(128)
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("status"))
            .returns_stdout(" M src/lib.rs\n")
            .finish();

        let runner = runner_with(subprocess);
        let err = runner.list_branches(None).await.unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
        assert!(err.to_string().contains("/repo"));

        let status = runner.working_tree_status(None).await.unwrap();
        assert!(!status.clean);
    }

    #[tokio::test]
    async fn delete_branch_shields_ref_with_double_dash() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args == ["branch", "-d", "--", "wt/feature"])
            .finish();

        let runner = runner_with(subprocess);
        runner.delete_branch("wt/feature", None, false).await.unwrap();
    }

    #[tokio::test]
    async fn create_worktree_rejects_invalid_names_without_running_git() {
        let (subprocess, mock) = SubprocessManager::mock();
        let runner = runner_with(subprocess);

        let err = runner
            .create_worktree("bad name", "wt/x", "main", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = runner
            .create_worktree("ok", "bad..ref", "main", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        assert!(mock.call_history().is_empty());
    }

    #[tokio::test]
    async fn execute_merge_reports_conflicts_and_aborts() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args == ["rev-parse", "--abbrev-ref", "HEAD"])
            .returns_stdout("main\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("checkout"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("merge") && args.len() > 2)
            .returns_stdout("CONFLICT (content): Merge conflict in src/app.rs\n")
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| args == ["diff", "--name-only", "--diff-filter=U"])
            .returns_stdout("src/app.rs\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| args == ["merge", "--abort"])
            .finish();

        let runner = runner_with(subprocess);
        let outcome = runner
            .execute_merge(None, "wt/feature", "main", None)
            .await
            .unwrap();
        match outcome {
            MergeOutcome::Conflicted { conflicts, .. } => {
                assert_eq!(conflicts, vec!["src/app.rs".to_string()]);
            }
            other => panic!("expected conflict outcome, got {other:?}"),
        }

        assert_eq!(mock.count_calls("git", "merge"), 2);
    }
}
