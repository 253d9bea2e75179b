//! Git operation implementations. These run inside the runner's FIFO
//! queue; nothing here may be called concurrently for one repository.

use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};
use crate::subprocess::{ProcessCommandBuilder, ProcessOutput, SubprocessManager};

use super::parsing::{
    merge_tree_has_marker_conflicts, parse_diff_stat_totals, parse_left_right_count,
    parse_merge_tree_conflicts, parse_worktree_list, DiffStatTotals, WorktreeListEntry,
};

#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BranchStatus {
    pub commits_ahead: u32,
    pub commits_behind: u32,
}

#[derive(Debug, Clone)]
pub struct WorkingTreeStatus {
    pub clean: bool,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct MergePreview {
    pub merge_base: Option<String>,
    pub has_conflicts: bool,
    pub conflicts: Vec<String>,
    pub output: String,
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged { commit: String },
    Conflicted { conflicts: Vec<String>, output: String },
}

#[derive(Debug, Clone)]
pub enum RebaseOutcome {
    Completed,
    Conflicted { conflicts: Vec<String>, output: String },
}

/// Run a git command, requiring exit code 0. Failures carry the command
/// line, the working directory and git's combined diagnostics.
async fn git(
    subprocess: &SubprocessManager,
    repo: &Path,
    args: &[&str],
) -> Result<ProcessOutput> {
    let output = git_unchecked(subprocess, repo, args).await?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(OrchestratorError::external(format!(
            "git {} failed in {}: {}",
            args.join(" "),
            repo.display(),
            output.combined_message()
        )))
    }
}

/// Run a git command without checking the exit code. Only spawn-level
/// failures surface as errors.
async fn git_unchecked(
    subprocess: &SubprocessManager,
    repo: &Path,
    args: &[&str],
) -> Result<ProcessOutput> {
    let command = ProcessCommandBuilder::new("git")
        .args(args)
        .current_dir(repo)
        .build();
    subprocess.runner().run(command).await.map_err(Into::into)
}

pub(super) async fn create_worktree(
    subprocess: SubprocessManager,
    repo: PathBuf,
    name: String,
    branch: String,
    base_branch: String,
    worktree_path: PathBuf,
) -> Result<CreatedWorktree> {
    if let Some(parent) = worktree_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| OrchestratorError::external(format!("creating worktree root: {e}")))?;
    }
    let path_str = worktree_path.to_string_lossy().to_string();
    git(
        &subprocess,
        &repo,
        &["worktree", "add", "-b", &branch, &path_str, &base_branch],
    )
    .await?;
    Ok(CreatedWorktree {
        name,
        path: worktree_path,
        branch,
    })
}

pub(super) async fn remove_worktree(
    subprocess: SubprocessManager,
    repo: PathBuf,
    name_or_path: String,
    force: bool,
) -> Result<()> {
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(&name_or_path);
    git(&subprocess, &repo, &args).await?;
    Ok(())
}

pub(super) async fn list_worktrees(
    subprocess: SubprocessManager,
    repo: PathBuf,
) -> Result<Vec<WorktreeListEntry>> {
    let output = git(&subprocess, &repo, &["worktree", "list", "--porcelain"]).await?;
    Ok(parse_worktree_list(&output.stdout))
}

pub(super) async fn list_branches(
    subprocess: SubprocessManager,
    repo: PathBuf,
) -> Result<Vec<String>> {
    // for-each-ref succeeds with empty output in a repo with no commits,
    // unlike `git branch` which errors on an unborn HEAD.
    let output = git(
        &subprocess,
        &repo,
        &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
    )
    .await?;
    Ok(output
        .stdout
        .lines()
        .map(str::to_string)
        .filter(|l| !l.is_empty())
        .collect())
}

pub(super) async fn delete_branch(
    subprocess: SubprocessManager,
    repo: PathBuf,
    name: String,
    force: bool,
) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    // `--` keeps a leading dash in the ref from becoming a flag.
    git(&subprocess, &repo, &["branch", flag, "--", &name]).await?;
    Ok(())
}

pub(super) async fn branch_status(
    subprocess: SubprocessManager,
    repo: PathBuf,
    base: String,
    branch: String,
) -> Result<BranchStatus> {
    let range = format!("{base}...{branch}");
    let output = git(
        &subprocess,
        &repo,
        &["rev-list", "--left-right", "--count", &range],
    )
    .await?;
    let (behind, ahead) = parse_left_right_count(&output.stdout).ok_or_else(|| {
        OrchestratorError::external(format!(
            "unparseable rev-list output for {range}: {:?}",
            output.stdout
        ))
    })?;
    Ok(BranchStatus {
        commits_ahead: ahead,
        commits_behind: behind,
    })
}

pub(super) async fn change_summary(
    subprocess: SubprocessManager,
    path: PathBuf,
    base_ref: String,
) -> Result<DiffStatTotals> {
    let output = git(&subprocess, &path, &["diff", "--stat", &base_ref]).await?;
    Ok(parse_diff_stat_totals(&output.stdout))
}

pub(super) async fn working_tree_status(
    subprocess: SubprocessManager,
    repo: PathBuf,
) -> Result<WorkingTreeStatus> {
    let output = git(&subprocess, &repo, &["status", "--porcelain"]).await?;
    Ok(WorkingTreeStatus {
        clean: output.stdout.trim().is_empty(),
        output: output.stdout,
    })
}

pub(super) async fn preview_merge(
    subprocess: SubprocessManager,
    repo: PathBuf,
    source: String,
    target: String,
) -> Result<MergePreview> {
    let base_output = git_unchecked(&subprocess, &repo, &["merge-base", &target, &source]).await?;
    let merge_base = base_output
        .status
        .success()
        .then(|| base_output.stdout.trim().to_string())
        .filter(|s| !s.is_empty());

    let Some(ref base) = merge_base else {
        // Unrelated histories: nothing merge-tree can say.
        return Ok(MergePreview {
            merge_base: None,
            has_conflicts: true,
            conflicts: Vec::new(),
            output: base_output.combined_message(),
        });
    };

    let tree_output = git_unchecked(
        &subprocess,
        &repo,
        &["merge-tree", base, &target, &source],
    )
    .await?;
    let conflicts = parse_merge_tree_conflicts(&tree_output.stdout);
    let has_conflicts =
        !conflicts.is_empty() || merge_tree_has_marker_conflicts(&tree_output.stdout);

    Ok(MergePreview {
        merge_base,
        has_conflicts,
        conflicts,
        output: tree_output.stdout,
    })
}

pub(super) async fn execute_merge(
    subprocess: SubprocessManager,
    repo: PathBuf,
    source: String,
    target: String,
    message: Option<String>,
) -> Result<MergeOutcome> {
    let head = git(&subprocess, &repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let original_branch = head.stdout.trim().to_string();

    git(&subprocess, &repo, &["checkout", &target]).await?;

    let message = message.unwrap_or_else(|| format!("Merge {source} into {target}"));
    let merge_output = git_unchecked(
        &subprocess,
        &repo,
        &["merge", "--no-ff", "-m", &message, &source],
    )
    .await?;

    let outcome = if merge_output.status.success() {
        let commit = git(&subprocess, &repo, &["rev-parse", "HEAD"]).await?;
        MergeOutcome::Merged {
            commit: commit.stdout.trim().to_string(),
        }
    } else {
        let conflict_list = git_unchecked(
            &subprocess,
            &repo,
            &["diff", "--name-only", "--diff-filter=U"],
        )
        .await?;
        let conflicts = conflict_list
            .stdout
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect();
        let _ = git_unchecked(&subprocess, &repo, &["merge", "--abort"]).await;
        MergeOutcome::Conflicted {
            conflicts,
            output: merge_output.combined_message(),
        }
    };

    // Restore whichever branch was checked out before, success or not.
    if !original_branch.is_empty()
        && original_branch != "HEAD"
        && original_branch != target
    {
        let _ = git_unchecked(&subprocess, &repo, &["checkout", &original_branch]).await;
    }

    Ok(outcome)
}

pub(super) async fn execute_rebase(
    subprocess: SubprocessManager,
    repo: PathBuf,
    source: String,
    target: String,
) -> Result<RebaseOutcome> {
    let head = git(&subprocess, &repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let original_branch = head.stdout.trim().to_string();

    git(&subprocess, &repo, &["checkout", &target]).await?;

    let rebase_output = git_unchecked(&subprocess, &repo, &["rebase", &source]).await?;

    let outcome = if rebase_output.status.success() {
        RebaseOutcome::Completed
    } else {
        let conflict_list = git_unchecked(
            &subprocess,
            &repo,
            &["diff", "--name-only", "--diff-filter=U"],
        )
        .await?;
        let conflicts = conflict_list
            .stdout
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect();
        let _ = git_unchecked(&subprocess, &repo, &["rebase", "--abort"]).await;
        RebaseOutcome::Conflicted {
            conflicts,
            output: rebase_output.combined_message(),
        }
    };

    if !original_branch.is_empty()
        && original_branch != "HEAD"
        && original_branch != target
    {
        let _ = git_unchecked(&subprocess, &repo, &["checkout", &original_branch]).await;
    }

    Ok(outcome)
}
