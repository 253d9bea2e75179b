//! Pure parsers for git plumbing output. No I/O here.

use std::path::PathBuf;

/// One record from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeListEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

/// Parse `git worktree list --porcelain` output. Records are separated
/// by blank lines; each starts with a `worktree <path>` line.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeListEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeListEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeListEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
                detached: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "detached" {
            entry.detached = true;
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

/// Parse `git rev-list --left-right --count base...branch` into
/// (commits_behind, commits_ahead) relative to the branch.
pub fn parse_left_right_count(output: &str) -> Option<(u32, u32)> {
    let mut fields = output.split_whitespace();
    let left = fields.next()?.parse().ok()?;
    let right = fields.next()?.parse().ok()?;
    Some((left, right))
}

/// Totals parsed from the last line of `git diff --stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStatTotals {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// Parse the summary line of `git diff --stat`, e.g.
/// ` 3 files changed, 14 insertions(+), 2 deletions(-)`.
/// An empty diff has no summary line and parses to all zeroes.
pub fn parse_diff_stat_totals(output: &str) -> DiffStatTotals {
    let mut totals = DiffStatTotals::default();
    let Some(summary) = output
        .lines()
        .rev()
        .find(|line| line.contains("changed"))
    else {
        return totals;
    };

    for part in summary.split(',') {
        let part = part.trim();
        let Some(number) = part
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        if part.contains("file") {
            totals.files_changed = number;
        } else if part.contains("insertion") {
            totals.insertions = number;
        } else if part.contains("deletion") {
            totals.deletions = number;
        }
    }
    totals
}

/// Extract conflicted paths from legacy `git merge-tree` output.
///
/// The three-argument form prints `changed in both` stanzas whose
/// `our`/`their` lines carry mode, oid and path; conflict hunks inside
/// file bodies carry `<<<<<<<` markers. A file is conflicted when it
/// appears in a `changed in both` stanza.
pub fn parse_merge_tree_conflicts(output: &str) -> Vec<String> {
    let mut conflicts = Vec::new();
    let mut in_both = false;

    for line in output.lines() {
        if line == "changed in both" {
            in_both = true;
            continue;
        }
        if in_both {
            if let Some(rest) = line.strip_prefix("  our ") {
                // "  our    100644 <oid> <path>"
                if let Some(path) = rest.split_whitespace().nth(2) {
                    let path = path.to_string();
                    if !conflicts.contains(&path) {
                        conflicts.push(path);
                    }
                }
                in_both = false;
            } else if !line.starts_with("  ") {
                in_both = false;
            }
        }
    }
    conflicts
}

/// Whether merge-tree output contains textual conflict markers.
pub fn merge_tree_has_marker_conflicts(output: &str) -> bool {
    output.lines().any(|line| line.starts_with("+<<<<<<<"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_porcelain() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\nworktree /repo/.devchain/worktrees/feature-auth\nHEAD def456\nbranch refs/heads/wt/feature-auth\n\nworktree /repo/.devchain/worktrees/probe\nHEAD 999aaa\ndetached\n";
        let entries = parse_worktree_list(output);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(
            entries[1].path,
            PathBuf::from("/repo/.devchain/worktrees/feature-auth")
        );
        assert_eq!(entries[1].branch.as_deref(), Some("wt/feature-auth"));
        assert!(entries[2].detached);
        assert!(entries[2].branch.is_none());
    }

    #[test]
    fn parses_empty_worktree_list() {
        assert!(parse_worktree_list("").is_empty());
    }

    #[test]
    fn parses_left_right_count() {
        assert_eq!(parse_left_right_count("2\t5\n"), Some((2, 5)));
        assert_eq!(parse_left_right_count("0 0"), Some((0, 0)));
        assert_eq!(parse_left_right_count("garbage"), None);
    }

    #[test]
    fn parses_diff_stat_totals() {
        let output = " src/main.rs | 10 +++++-----\n src/lib.rs  |  4 ++--\n 2 files changed, 14 insertions(+), 7 deletions(-)\n";
        let totals = parse_diff_stat_totals(output);
        assert_eq!(
            totals,
            DiffStatTotals {
                files_changed: 2,
                insertions: 14,
                deletions: 7
            }
        );
    }

    #[test]
    fn diff_stat_singular_forms() {
        let output = " a.txt | 1 +\n 1 file changed, 1 insertion(+)\n";
        let totals = parse_diff_stat_totals(output);
        assert_eq!(totals.files_changed, 1);
        assert_eq!(totals.insertions, 1);
        assert_eq!(totals.deletions, 0);
    }

    #[test]
    fn empty_diff_is_all_zero() {
        assert_eq!(parse_diff_stat_totals(""), DiffStatTotals::default());
    }

    #[test]
    fn extracts_merge_tree_conflicts() {
        let output = "changed in both\n  base   100644 1111111 src/app.rs\n  our    100644 2222222 src/app.rs\n  their  100644 3333333 src/app.rs\n@@ -1,3 +1,7 @@\n+<<<<<<< .our\n line\n+=======\n other\n+>>>>>>> .their\nadded in remote\n  their  100644 4444444 src/new.rs\n";
        let conflicts = parse_merge_tree_conflicts(output);
        assert_eq!(conflicts, vec!["src/app.rs".to_string()]);
        assert!(merge_tree_has_marker_conflicts(output));
    }

    #[test]
    fn clean_merge_tree_has_no_conflicts() {
        let output = "added in remote\n  their  100644 4444444 src/new.rs\n";
        assert!(parse_merge_tree_conflicts(output).is_empty());
        assert!(!merge_tree_has_marker_conflicts(output));
    }
}
