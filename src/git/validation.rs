//! Name validation for git refs and worktrees.
//!
//! Ref names follow git's own `check-ref-format` rules; worktree names
//! use a stricter allow-list since they become path components and tmux
//! session fragments.

use crate::error::OrchestratorError;

/// Conservative allow-list for worktree names: alphanumeric start, then
/// alphanumerics, dot, underscore, dash. Max 100 characters.
pub fn validate_worktree_name(name: &str) -> Result<(), OrchestratorError> {
    if name.is_empty() || name.len() > 100 {
        return Err(OrchestratorError::validation_field(
            format!("invalid worktree name '{name}': must be 1-100 characters"),
            "name",
        ));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(OrchestratorError::validation_field(
            format!("invalid worktree name '{name}': must start with a letter or digit"),
            "name",
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-') {
        return Err(OrchestratorError::validation_field(
            format!("invalid worktree name '{name}': only [A-Za-z0-9._-] allowed"),
            "name",
        ));
    }
    Ok(())
}

/// Git ref-name rules, per `git-check-ref-format(1)`.
pub fn validate_ref_name(name: &str) -> Result<(), OrchestratorError> {
    let invalid = |reason: &str| {
        Err(OrchestratorError::validation_field(
            format!("invalid ref name '{name}': {reason}"),
            "branch",
        ))
    };

    if name.is_empty() {
        return invalid("empty");
    }
    if name == "@" {
        return invalid("the single character '@' is reserved");
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return invalid("bad slash placement");
    }
    if name.ends_with('.') || name.contains("..") {
        return invalid("dots misplaced");
    }
    if name.contains("@{") {
        return invalid("'@{' sequence not allowed");
    }
    if name.ends_with(".lock") {
        return invalid("'.lock' suffix not allowed");
    }
    for component in name.split('/') {
        if component.is_empty() || component.starts_with('.') || component.ends_with(".lock") {
            return invalid("bad path component");
        }
    }
    for c in name.chars() {
        if c.is_ascii_control()
            || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\')
        {
            return invalid("forbidden character");
        }
    }
    Ok(())
}
