//! Cached readiness checks run before launching sessions.
//!
//! Checks: tmux presence and version, provider binaries and option
//! strings, MCP registration state, `.devchain/` writability. Results
//! are cached for 60 seconds per project path; the MCP coordinator
//! clears the cache after changing registration state.

use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::mcp::{McpCheck, McpCoordinator};
use crate::session::options::parse_provider_options;
use crate::store::Database;
use crate::subprocess::{ProcessCommandBuilder, SubprocessManager};

const CACHE_TTL: Duration = Duration::from_secs(60);
const MIN_TMUX_MINOR: (u32, u32) = (2, 6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub status: CheckStatus,
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    fn from_checks(checks: Vec<CheckResult>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Pass);
        Self { status, checks }
    }

    /// MCP state for one provider, as reported by the provider checks.
    pub fn mcp_status_for(&self, provider_name: &str) -> Option<CheckStatus> {
        let name = format!("provider:{}:mcp", provider_name.to_lowercase());
        self.checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
    }
}

/// Shared 60-second result cache, keyed by project path ("" = global).
#[derive(Default)]
pub struct PreflightCache {
    entries: StdMutex<HashMap<String, (Instant, PreflightReport)>>,
}

impl PreflightCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<PreflightReport> {
        let entries = self.entries.lock().unwrap();
        let (stored_at, report) = entries.get(key)?;
        (stored_at.elapsed() < CACHE_TTL).then(|| report.clone())
    }

    fn put(&self, key: &str, report: PreflightReport) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (Instant::now(), report));
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Parse `tmux -V` output like `tmux 3.4` or `tmux 2.6a`.
pub(crate) fn parse_tmux_version(output: &str) -> Option<(u32, u32)> {
    let version = output.trim().strip_prefix("tmux ")?;
    let version = version.strip_prefix("next-").unwrap_or(version);
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor_raw = parts.next()?;
    let minor: String = minor_raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    Some((major, minor.parse().ok()?))
}

pub struct PreflightChecker {
    db: Database,
    subprocess: SubprocessManager,
    config: OrchestratorConfig,
    mcp: std::sync::Arc<McpCoordinator>,
    cache: std::sync::Arc<PreflightCache>,
}

impl PreflightChecker {
    pub fn new(
        db: Database,
        subprocess: SubprocessManager,
        config: OrchestratorConfig,
        mcp: std::sync::Arc<McpCoordinator>,
        cache: std::sync::Arc<PreflightCache>,
    ) -> Self {
        Self {
            db,
            subprocess,
            config,
            mcp,
            cache,
        }
    }

    pub async fn run(&self, project_path: Option<&Path>) -> Result<PreflightReport> {
        if self.config.skip_preflight {
            return Ok(PreflightReport::from_checks(vec![CheckResult {
                name: "skipped".into(),
                status: CheckStatus::Pass,
                message: "SKIP_PREFLIGHT=1".into(),
                details: None,
            }]));
        }

        let key = project_path
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(report) = self.cache.get(&key) {
            debug!("preflight cache hit for '{key}'");
            return Ok(report);
        }

        let mut checks = vec![self.check_tmux().await];
        checks.extend(self.check_providers().await?);
        if let Some(path) = project_path {
            checks.push(self.check_devchain_access(path));
        }

        let report = PreflightReport::from_checks(checks);
        self.cache.put(&key, report.clone());
        Ok(report)
    }

    async fn check_tmux(&self) -> CheckResult {
        let command = ProcessCommandBuilder::new("tmux")
            .arg("-V")
            .timeout(Duration::from_secs(5))
            .build();
        match self.subprocess.runner().run(command).await {
            Ok(output) if output.status.success() => {
                match parse_tmux_version(&output.stdout) {
                    Some((major, minor)) if (major, minor) >= MIN_TMUX_MINOR => CheckResult {
                        name: "tmux".into(),
                        status: CheckStatus::Pass,
                        message: format!("tmux {major}.{minor}"),
                        details: None,
                    },
                    Some((major, minor)) => CheckResult {
                        name: "tmux".into(),
                        status: CheckStatus::Warn,
                        message: format!(
                            "tmux {major}.{minor} is older than {}.{}; scrollback handling may misbehave",
                            MIN_TMUX_MINOR.0, MIN_TMUX_MINOR.1
                        ),
                        details: None,
                    },
                    None => CheckResult {
                        name: "tmux".into(),
                        status: CheckStatus::Warn,
                        message: format!("could not parse tmux version: {}", output.stdout.trim()),
                        details: None,
                    },
                }
            }
            Ok(output) => CheckResult {
                name: "tmux".into(),
                status: CheckStatus::Fail,
                message: format!("tmux -V failed: {}", output.combined_message()),
                details: None,
            },
            Err(err) => CheckResult {
                name: "tmux".into(),
                status: CheckStatus::Fail,
                message: format!("tmux not available: {err}"),
                details: None,
            },
        }
    }

    async fn check_providers(&self) -> Result<Vec<CheckResult>> {
        let mut providers = self.db.providers().list().await?;
        if let Some(ref enabled) = self.config.enabled_providers {
            providers.retain(|p| enabled.contains(&p.name.to_lowercase()));
        }

        let mut checks = Vec::new();
        for provider in providers {
            let label = provider.name.to_lowercase();
            checks.push(self.check_provider_binary(&provider, &label));
            checks.extend(self.check_provider_options(&provider, &label).await?);

            let mcp_status = match self.mcp.evaluate_mcp_status(&provider).await {
                McpCheck::Pass => CheckStatus::Pass,
                McpCheck::Warn => CheckStatus::Warn,
                McpCheck::Fail => CheckStatus::Fail,
            };
            checks.push(CheckResult {
                name: format!("provider:{label}:mcp"),
                status: mcp_status,
                message: match mcp_status {
                    CheckStatus::Pass => "MCP alias 'devchain' registered".into(),
                    CheckStatus::Warn => "MCP alias 'devchain' points at another endpoint".into(),
                    CheckStatus::Fail => "MCP alias 'devchain' is not registered".into(),
                },
                details: None,
            });
        }
        Ok(checks)
    }

    fn check_provider_binary(
        &self,
        provider: &crate::store::ProviderRow,
        label: &str,
    ) -> CheckResult {
        let name = format!("provider:{label}:binary");
        let Some(bin_path) = provider.bin_path.clone().filter(|p| !p.trim().is_empty()) else {
            // No explicit path: resolve through PATH.
            return match which::which(label) {
                Ok(resolved) => CheckResult {
                    name,
                    status: CheckStatus::Pass,
                    message: format!("found on PATH at {}", resolved.display()),
                    details: None,
                },
                Err(_) => CheckResult {
                    name,
                    status: CheckStatus::Fail,
                    message: format!("'{label}' not found on PATH and no binPath configured"),
                    details: None,
                },
            };
        };

        let path = Path::new(&bin_path);
        if path.is_absolute() {
            let executable = is_executable(path);
            CheckResult {
                name,
                status: if executable {
                    CheckStatus::Pass
                } else {
                    CheckStatus::Fail
                },
                message: if executable {
                    format!("{bin_path} is executable")
                } else {
                    format!("{bin_path} is missing or not executable")
                },
                details: None,
            }
        } else {
            match which::which(&bin_path) {
                Ok(resolved) => CheckResult {
                    name,
                    status: CheckStatus::Pass,
                    message: format!("resolved to {}", resolved.display()),
                    details: None,
                },
                Err(_) => CheckResult {
                    name,
                    status: CheckStatus::Fail,
                    message: format!("'{bin_path}' not found on PATH"),
                    details: None,
                },
            }
        }
    }

    async fn check_provider_options(
        &self,
        provider: &crate::store::ProviderRow,
        label: &str,
    ) -> Result<Vec<CheckResult>> {
        let profiles = self
            .db
            .projects()
            .list_profiles_for_provider(&provider.id)
            .await?;
        let mut checks = Vec::new();
        for profile in profiles {
            if let Err(err) = parse_provider_options(&profile.options) {
                checks.push(CheckResult {
                    name: format!("provider:{label}:options:{}", profile.name),
                    status: CheckStatus::Fail,
                    message: format!("profile '{}' has invalid options: {err}", profile.name),
                    details: None,
                });
            }
        }
        Ok(checks)
    }

    fn check_devchain_access(&self, project_path: &Path) -> CheckResult {
        let devchain_dir = project_path.join(".devchain");
        let probe = devchain_dir.join(".preflight-probe");

        let outcome = std::fs::create_dir_all(&devchain_dir)
            .and_then(|_| std::fs::write(&probe, b"ok"))
            .and_then(|_| std::fs::remove_file(&probe));

        match outcome {
            Ok(()) => CheckResult {
                name: ".devchain".into(),
                status: CheckStatus::Pass,
                message: format!("{} is writable", devchain_dir.display()),
                details: None,
            },
            Err(err) => CheckResult {
                name: ".devchain".into(),
                status: CheckStatus::Fail,
                message: format!("{} is not writable: {err}", devchain_dir.display()),
                details: None,
            },
        }
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn checker_with(subprocess: SubprocessManager, db: Database) -> PreflightChecker {
        let cache = Arc::new(PreflightCache::new());
        let mcp = Arc::new(McpCoordinator::new(
            db.clone(),
            subprocess.clone(),
            OrchestratorConfig::default(),
            Arc::clone(&cache),
        ));
        PreflightChecker::new(db, subprocess, OrchestratorConfig::default(), mcp, cache)
    }

    #[test]
    fn tmux_version_parsing() {
        assert_eq!(parse_tmux_version("tmux 3.4\n"), Some((3, 4)));
        assert_eq!(parse_tmux_version("tmux 2.6a"), Some((2, 6)));
        assert_eq!(parse_tmux_version("tmux next-3.5"), Some((3, 5)));
        assert_eq!(parse_tmux_version("screen 4.0"), None);
    }

    #[tokio::test]
    async fn old_tmux_warns_and_missing_tmux_fails() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("tmux")
            .with_args(|args| args == ["-V"])
            .returns_stdout("tmux 2.4\n")
            .finish();
        let db = Database::in_memory().await.unwrap();
        let checker = checker_with(subprocess, db);

        let report = checker.run(None).await.unwrap();
        assert_eq!(report.status, CheckStatus::Warn);

        let (subprocess, _mock) = SubprocessManager::mock();
        let db = Database::in_memory().await.unwrap();
        let checker = checker_with(subprocess, db);
        // Clear-cache path: new checker, no tmux expectation => run error.
        let report = checker.run(None).await.unwrap();
        assert_eq!(report.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn results_are_cached_for_the_same_key() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("tmux")
            .with_args(|args| args == ["-V"])
            .returns_stdout("tmux 3.4\n")
            .times(1)
            .finish();
        let db = Database::in_memory().await.unwrap();
        let checker = checker_with(subprocess, db);

        let first = checker.run(None).await.unwrap();
        let second = checker.run(None).await.unwrap();
        assert_eq!(first.status, CheckStatus::Pass);
        assert_eq!(second.status, CheckStatus::Pass);
        assert_eq!(mock.count_calls("tmux", "-V"), 1);
    }

    #[tokio::test]
    async fn devchain_dir_is_created_and_probed() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("tmux")
            .with_args(|args| args == ["-V"])
            .returns_stdout("tmux 3.4\n")
            .finish();
        let db = Database::in_memory().await.unwrap();
        let checker = checker_with(subprocess, db);

        let project = tempfile::TempDir::new().unwrap();
        let report = checker.run(Some(project.path())).await.unwrap();
        assert_eq!(report.status, CheckStatus::Pass);
        assert!(project.path().join(".devchain").is_dir());
    }

    #[tokio::test]
    async fn enabled_providers_filter_applies() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("tmux")
            .with_args(|args| args == ["-V"])
            .returns_stdout("tmux 3.4\n")
            .finish();

        let db = Database::in_memory().await.unwrap();
        db.providers()
            .insert(&crate::store::ProviderRow::new("claude", Some("/nope/claude")))
            .await
            .unwrap();
        db.providers()
            .insert(&crate::store::ProviderRow::new("codex", Some("/nope/codex")))
            .await
            .unwrap();

        let cache = Arc::new(PreflightCache::new());
        let config = OrchestratorConfig {
            enabled_providers: Some(vec!["codex".into()]),
            ..Default::default()
        };
        let mcp = Arc::new(McpCoordinator::new(
            db.clone(),
            subprocess.clone(),
            config.clone(),
            Arc::clone(&cache),
        ));
        let checker = PreflightChecker::new(db, subprocess, config, mcp, cache);

        let report = checker.run(None).await.unwrap();
        assert!(report
            .checks
            .iter()
            .any(|c| c.name.starts_with("provider:codex")));
        assert!(!report
            .checks
            .iter()
            .any(|c| c.name.starts_with("provider:claude")));
    }
}
