//! Claude project-settings merge.
//!
//! After registering the MCP endpoint, Claude projects get
//! `mcp__devchain` merged into `permissions.allow` in the project's
//! `.claude/settings.local.json`. Best-effort at the call site; this
//! module reports errors but callers only log them.

use std::path::Path;

use anyhow::{Context, Result};

pub const ALLOW_ENTRY: &str = "mcp__devchain";

/// Merge `mcp__devchain` into the project's local allow-list, creating
/// the directory and file as needed. Existing settings are preserved.
pub fn merge_allow_entry(project_root: &Path) -> Result<()> {
    let settings_dir = project_root.join(".claude");
    let settings_path = settings_dir.join("settings.local.json");

    let mut settings: serde_json::Value = if settings_path.exists() {
        let raw = std::fs::read_to_string(&settings_path)
            .with_context(|| format!("reading {settings_path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {settings_path:?}"))?
    } else {
        serde_json::json!({})
    };

    if !settings.is_object() {
        anyhow::bail!("{settings_path:?} does not contain a JSON object");
    }

    let permissions = settings
        .as_object_mut()
        .expect("checked object above")
        .entry("permissions")
        .or_insert_with(|| serde_json::json!({}));
    if !permissions.is_object() {
        anyhow::bail!("'permissions' in {settings_path:?} is not an object");
    }
    let allow = permissions
        .as_object_mut()
        .expect("checked object above")
        .entry("allow")
        .or_insert_with(|| serde_json::json!([]));
    let Some(allow_list) = allow.as_array_mut() else {
        anyhow::bail!("'permissions.allow' in {settings_path:?} is not an array");
    };

    let already_present = allow_list
        .iter()
        .any(|entry| entry.as_str() == Some(ALLOW_ENTRY));
    if !already_present {
        allow_list.push(serde_json::Value::String(ALLOW_ENTRY.to_string()));
    }

    std::fs::create_dir_all(&settings_dir)
        .with_context(|| format!("creating {settings_dir:?}"))?;
    std::fs::write(
        &settings_path,
        serde_json::to_string_pretty(&settings).context("serializing settings")?,
    )
    .with_context(|| format!("writing {settings_path:?}"))?;
    Ok(())
}
