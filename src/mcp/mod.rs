//! MCP-ensure coordinator.
//!
//! Reconciles a provider's MCP server list so that exactly one entry
//! `devchain` points at this orchestrator's endpoint. Calls are
//! single-flighted per `(provider, projectPath|global)` key: concurrent
//! callers with the same key share one reconciliation, different keys
//! run in parallel. Project paths are validated before any side effect.

pub mod adapters;
pub mod claude_settings;

pub use adapters::{McpEntry, ProviderKind};

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::preflight::PreflightCache;
use crate::store::{Database, ProviderRow, ProviderStore};
use crate::subprocess::{ProcessCommandBuilder, SubprocessManager};
use crate::sync::SingleFlight;

pub const MCP_ALIAS: &str = "devchain";
const PROVIDER_CLI_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureAction {
    AlreadyConfigured,
    FixedMismatch,
    Added,
    Error,
}

impl EnsureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyConfigured => "already_configured",
            Self::FixedMismatch => "fixed_mismatch",
            Self::Added => "added",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub action: EnsureAction,
    pub endpoint: String,
    pub message: Option<String>,
}

impl EnsureOutcome {
    pub fn succeeded(&self) -> bool {
        self.action != EnsureAction::Error
    }
}

/// Result of a read-only MCP expectation check, used by preflight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpCheck {
    Pass,
    Warn,
    Fail,
}

pub struct McpCoordinator {
    db: Database,
    subprocess: SubprocessManager,
    config: OrchestratorConfig,
    preflight_cache: Arc<PreflightCache>,
    flight: SingleFlight<EnsureOutcome>,
}

/// Reject relative paths and any `..` segment before touching anything.
fn validate_project_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(OrchestratorError::validation_field(
            format!("project path must be absolute: {}", path.display()),
            "projectPath",
        ));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(OrchestratorError::validation_field(
            format!("project path must not contain '..': {}", path.display()),
            "projectPath",
        ));
    }
    Ok(())
}

fn provider_binary(provider: &ProviderRow, kind: ProviderKind) -> String {
    provider
        .bin_path
        .clone()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| kind.default_binary().to_string())
}

async fn run_provider_cli(
    subprocess: &SubprocessManager,
    binary: &str,
    args: Vec<String>,
) -> std::result::Result<String, String> {
    let command = ProcessCommandBuilder::new(binary)
        .args(args.iter().map(String::as_str))
        .timeout(PROVIDER_CLI_TIMEOUT)
        .build();
    match subprocess.runner().run(command).await {
        Ok(output) if output.status.success() => Ok(output.stdout),
        Ok(output) => Err(output.combined_message()),
        Err(err) => Err(err.to_string()),
    }
}

/// One reconciliation pass. Adapter-level failures fold into an
/// `Error` outcome carrying the adapter's message.
#[allow(clippy::too_many_arguments)]
async fn reconcile(
    subprocess: SubprocessManager,
    providers: ProviderStore,
    provider: ProviderRow,
    kind: ProviderKind,
    endpoint: String,
    project_root: Option<PathBuf>,
    preflight_cache: Arc<PreflightCache>,
) -> EnsureOutcome {
    let binary = provider_binary(&provider, kind);

    let listing = match run_provider_cli(&subprocess, &binary, kind.list_args()).await {
        Ok(stdout) => stdout,
        Err(message) => {
            return EnsureOutcome {
                action: EnsureAction::Error,
                endpoint,
                message: Some(message),
            }
        }
    };

    let entries = kind.parse_list_output(&listing);
    let existing = entries.iter().find(|e| e.alias == MCP_ALIAS);

    let action = match existing {
        Some(entry) if entry.endpoint == endpoint => EnsureAction::AlreadyConfigured,
        Some(entry) => {
            debug!(
                "provider '{}' has '{MCP_ALIAS}' at {}, expected {endpoint}; fixing",
                provider.name, entry.endpoint
            );
            if let Err(message) =
                run_provider_cli(&subprocess, &binary, kind.remove_args(MCP_ALIAS)).await
            {
                return EnsureOutcome {
                    action: EnsureAction::Error,
                    endpoint,
                    message: Some(message),
                };
            }
            if let Err(message) =
                run_provider_cli(&subprocess, &binary, kind.add_args(MCP_ALIAS, &endpoint)).await
            {
                return EnsureOutcome {
                    action: EnsureAction::Error,
                    endpoint,
                    message: Some(message),
                };
            }
            EnsureAction::FixedMismatch
        }
        None => {
            if let Err(message) =
                run_provider_cli(&subprocess, &binary, kind.add_args(MCP_ALIAS, &endpoint)).await
            {
                return EnsureOutcome {
                    action: EnsureAction::Error,
                    endpoint,
                    message: Some(message),
                };
            }
            EnsureAction::Added
        }
    };

    // Metadata update and settings merge are transient-best-effort:
    // logged, never failing the request.
    if matches!(action, EnsureAction::FixedMismatch | EnsureAction::Added) {
        if let Err(err) = providers.mark_mcp_configured(&provider.id, &endpoint).await {
            warn!("updating MCP metadata for '{}' failed: {err}", provider.name);
        }
    }
    if kind == ProviderKind::Claude {
        if let Some(ref root) = project_root {
            if let Err(err) = claude_settings::merge_allow_entry(root) {
                warn!("merging Claude settings for {root:?} failed: {err:#}");
            }
        }
    }

    preflight_cache.clear();

    EnsureOutcome {
        action,
        endpoint,
        message: None,
    }
}

impl McpCoordinator {
    pub fn new(
        db: Database,
        subprocess: SubprocessManager,
        config: OrchestratorConfig,
        preflight_cache: Arc<PreflightCache>,
    ) -> Self {
        Self {
            db,
            subprocess,
            config,
            preflight_cache,
            flight: SingleFlight::new(),
        }
    }

    /// Idempotently reconcile one provider's registration, optionally
    /// scoped to a project (Claude settings merge applies then).
    pub async fn ensure(
        &self,
        provider_id: &str,
        project_path: Option<&Path>,
    ) -> Result<EnsureOutcome> {
        let project_root = match project_path {
            None => None,
            Some(path) => {
                validate_project_path(path)?;
                let registered = self
                    .db
                    .projects()
                    .get_by_path(&path.to_string_lossy())
                    .await?;
                if registered.is_none() {
                    return Err(OrchestratorError::validation_field(
                        format!("no registered project has root {}", path.display()),
                        "projectPath",
                    ));
                }
                Some(path.to_path_buf())
            }
        };

        let provider = self.db.providers().get_by_id(provider_id).await?;
        let kind = ProviderKind::from_name(&provider.name).ok_or_else(|| {
            OrchestratorError::validation(format!(
                "provider '{}' has no MCP adapter",
                provider.name
            ))
        })?;

        let key = format!(
            "{}:{}",
            provider_id,
            project_root
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| "global".to_string())
        );

        let subprocess = self.subprocess.clone();
        let providers = self.db.providers();
        let endpoint = self.config.mcp_endpoint();
        let preflight_cache = Arc::clone(&self.preflight_cache);
        let outcome = self
            .flight
            .run(&key, move || {
                reconcile(
                    subprocess,
                    providers,
                    provider,
                    kind,
                    endpoint,
                    project_root,
                    preflight_cache,
                )
            })
            .await;
        Ok(outcome)
    }

    /// Read-only expectation check: pass when `devchain` points at the
    /// expected endpoint, warn on a mismatched endpoint, fail when the
    /// alias is absent or the CLI cannot be queried.
    pub async fn evaluate_mcp_status(&self, provider: &ProviderRow) -> McpCheck {
        let Some(kind) = ProviderKind::from_name(&provider.name) else {
            return McpCheck::Fail;
        };
        let binary = provider_binary(provider, kind);
        let listing = match run_provider_cli(&self.subprocess, &binary, kind.list_args()).await {
            Ok(stdout) => stdout,
            Err(_) => return McpCheck::Fail,
        };
        let expected = self.config.mcp_endpoint();
        match kind
            .parse_list_output(&listing)
            .into_iter()
            .find(|e| e.alias == MCP_ALIAS)
        {
            Some(entry) if entry.endpoint == expected => McpCheck::Pass,
            Some(_) => McpCheck::Warn,
            None => McpCheck::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn coordinator_with(
        subprocess: SubprocessManager,
    ) -> (McpCoordinator, Database, ProviderRow) {
        let db = Database::in_memory().await.unwrap();
        let provider = ProviderRow::new("claude", Some("/usr/local/bin/claude"));
        db.providers().insert(&provider).await.unwrap();
        let coordinator = McpCoordinator::new(
            db.clone(),
            subprocess,
            OrchestratorConfig::default(),
            Arc::new(PreflightCache::new()),
        );
        (coordinator, db, provider)
    }

    #[tokio::test]
    async fn endpoint_mismatch_is_fixed_and_metadata_updated() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("/usr/local/bin/claude")
            .with_args(|args| args == ["mcp", "list"])
            .returns_stdout("devchain: http://127.0.0.1:4000/mcp (HTTP) - ✓ Connected\n")
            .finish();
        mock.expect_command("/usr/local/bin/claude")
            .with_args(|args| args == ["mcp", "remove", "devchain"])
            .finish();
        mock.expect_command("/usr/local/bin/claude")
            .with_args(|args| args.first().map(String::as_str) == Some("mcp") && args.get(1).map(String::as_str) == Some("add"))
            .finish();

        let (coordinator, db, provider) = coordinator_with(subprocess).await;
        let outcome = coordinator.ensure(&provider.id, None).await.unwrap();
        assert_eq!(outcome.action, EnsureAction::FixedMismatch);

        let stored = db.providers().get_by_id(&provider.id).await.unwrap();
        assert!(stored.mcp_configured);
        assert_eq!(
            stored.mcp_endpoint.as_deref(),
            Some("http://127.0.0.1:3000/mcp")
        );
    }

    #[tokio::test]
    async fn already_configured_makes_no_changes() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("/usr/local/bin/claude")
            .with_args(|args| args == ["mcp", "list"])
            .returns_stdout("devchain: http://127.0.0.1:3000/mcp (HTTP) - ✓ Connected\n")
            .finish();

        let (coordinator, _db, provider) = coordinator_with(subprocess).await;
        let outcome = coordinator.ensure(&provider.id, None).await.unwrap();
        assert_eq!(outcome.action, EnsureAction::AlreadyConfigured);
        assert_eq!(mock.count_calls("/usr/local/bin/claude", "mcp"), 1);
    }

    #[tokio::test]
    async fn concurrent_same_key_shares_one_list_call() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("/usr/local/bin/claude")
            .with_args(|args| args == ["mcp", "list"])
            .delays(Duration::from_millis(30))
            .returns_stdout("devchain: http://127.0.0.1:3000/mcp (HTTP) - ✓ Connected\n")
            .finish();

        let (coordinator, _db, provider) = coordinator_with(subprocess).await;
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = Arc::clone(&coordinator);
            let provider_id = provider.id.clone();
            handles.push(tokio::spawn(async move {
                coordinator.ensure(&provider_id, None).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().action, EnsureAction::AlreadyConfigured);
        }
        assert_eq!(mock.count_calls("/usr/local/bin/claude", "mcp"), 1);
    }

    #[tokio::test]
    async fn adapter_failure_is_an_error_outcome() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("/usr/local/bin/claude")
            .with_args(|args| args == ["mcp", "list"])
            .returns_stderr("command not found: mcp")
            .returns_exit_code(1)
            .finish();

        let (coordinator, _db, provider) = coordinator_with(subprocess).await;
        let outcome = coordinator.ensure(&provider.id, None).await.unwrap();
        assert_eq!(outcome.action, EnsureAction::Error);
        assert!(outcome.message.unwrap().contains("command not found"));
    }

    #[tokio::test]
    async fn project_path_is_validated_before_any_side_effect() {
        let (subprocess, mock) = SubprocessManager::mock();
        let (coordinator, db, provider) = coordinator_with(subprocess).await;

        let err = coordinator
            .ensure(&provider.id, Some(Path::new("relative/path")))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = coordinator
            .ensure(&provider.id, Some(Path::new("/tmp/../etc")))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        // Absolute and clean, but not a registered project root.
        let err = coordinator
            .ensure(&provider.id, Some(Path::new("/not/registered")))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        assert!(mock.call_history().is_empty());

        // Registering the root makes the same call valid.
        db.projects()
            .get_or_create_by_path("proj", "/registered/root")
            .await
            .unwrap();
        let result = coordinator
            .ensure(&provider.id, Some(Path::new("/registered/root")))
            .await;
        // The mock has no expectations: the adapter list call now runs
        // and fails, which must surface as an error outcome.
        assert_eq!(result.unwrap().action, EnsureAction::Error);
    }
}
