//! Session launcher: one tmux session per agent, created under the
//! agent lock.
//!
//! The whole launch body runs inside [`KeyedLocks::with_lock`] keyed by
//! the agent id. The lock is NON-REENTRANT: never call `launch_session`
//! or `stop_session` from code already holding the same agent's lock;
//! that deadlocks by construction (see the regression test in
//! `sync::keyed_lock`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::mcp::McpCoordinator;
use crate::preflight::{CheckStatus, PreflightChecker};
use crate::realtime::RealtimeBus;
use crate::store::{AgentRow, Database, EpicRow, SessionRow};
use crate::sync::KeyedLocks;

use super::options::parse_provider_options;
use super::prompt::{self, PromptVars};
use super::tmux::TmuxDriver;

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub silent: bool,
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub project_id: String,
    pub agent_id: String,
    pub epic_id: Option<String>,
    pub options: LaunchOptions,
}

#[derive(Debug, Clone)]
pub struct LaunchedSession {
    pub session: SessionRow,
    pub agent: AgentRow,
    pub epic: Option<EpicRow>,
}

pub struct SessionLauncher {
    db: Database,
    tmux: TmuxDriver,
    preflight: Arc<PreflightChecker>,
    mcp: Arc<McpCoordinator>,
    realtime: RealtimeBus,
    events: EventBus,
    locks: Arc<KeyedLocks>,
    claude_config_path: PathBuf,
}

/// Claude's user-level config carries `autoCompactEnabled`; sessions
/// must not launch while it is on.
fn claude_auto_compact_enabled(config_path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(config_path) else {
        return false;
    };
    let Ok(config) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return false;
    };
    config
        .get("autoCompactEnabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

impl SessionLauncher {
    pub fn new(
        db: Database,
        tmux: TmuxDriver,
        preflight: Arc<PreflightChecker>,
        mcp: Arc<McpCoordinator>,
        realtime: RealtimeBus,
        events: EventBus,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        let claude_config_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude.json");
        Self {
            db,
            tmux,
            preflight,
            mcp,
            realtime,
            events,
            locks,
            claude_config_path,
        }
    }

    /// Override where the Claude user config is read from (tests).
    pub fn with_claude_config_path(mut self, path: PathBuf) -> Self {
        self.claude_config_path = path;
        self
    }

    pub fn agent_locks(&self) -> Arc<KeyedLocks> {
        Arc::clone(&self.locks)
    }

    /// Launch (or return the already-running) session for an agent.
    pub async fn launch_session(&self, request: LaunchRequest) -> Result<LaunchedSession> {
        let agent_id = request.agent_id.clone();
        self.locks
            .with_lock(&agent_id, self.launch_locked(request))
            .await
    }

    async fn launch_locked(&self, request: LaunchRequest) -> Result<LaunchedSession> {
        // 1. Idempotence: an active session wins.
        if let Some(existing) = self
            .db
            .sessions()
            .get_active_for_agent(&request.agent_id)
            .await?
        {
            let agent = self.db.projects().get_agent(&request.agent_id).await?;
            let epic = self.load_epic(existing.epic_id.as_deref()).await?;
            return Ok(LaunchedSession {
                session: existing,
                agent,
                epic,
            });
        }

        // 2. Load the object graph.
        let agent = self.db.projects().get_agent(&request.agent_id).await?;
        let project = self.db.projects().get_by_id(&request.project_id).await?;
        let epic = self.load_epic(request.epic_id.as_deref()).await?;
        let profile_id = agent.profile_id.clone().ok_or_else(|| {
            OrchestratorError::precondition(
                "AGENT_HAS_NO_PROFILE",
                format!("agent '{}' has no profile assigned", agent.name),
            )
        })?;
        let profile = self.db.projects().get_profile(&profile_id).await?;
        let provider = self.db.providers().get_by_id(&profile.provider_id).await?;

        // 3. Validation before any side effect.
        let bin_path = provider
            .bin_path
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                OrchestratorError::precondition(
                    "PROVIDER_BIN_MISSING",
                    format!("provider '{}' has no binary configured", provider.name),
                )
            })?;
        let provider_args = parse_provider_options(&profile.options)?;

        // 4. Claude auto-compact gate, before preflight so the UI sees
        // the block immediately.
        if provider.is_claude() && claude_auto_compact_enabled(&self.claude_config_path) {
            self.realtime.broadcast(
                "sessions",
                "session_blocked",
                serde_json::json!({
                    "reason": "claude_auto_compact",
                    "agentId": agent.id,
                    "agentName": agent.name,
                    "providerId": provider.id,
                    "providerName": provider.name,
                    "silent": request.options.silent,
                }),
            );
            return Err(OrchestratorError::precondition(
                "CLAUDE_AUTO_COMPACT_ENABLED",
                "Claude auto-compact is enabled; disable it before launching sessions",
            ));
        }

        // 5. Preflight, with one MCP-ensure retry.
        let project_root = PathBuf::from(&project.root_path);
        let report = self.preflight.run(Some(&project_root)).await?;
        if matches!(
            report.mcp_status_for(&provider.name),
            Some(CheckStatus::Warn) | Some(CheckStatus::Fail)
        ) {
            let outcome = self.mcp.ensure(&provider.id, Some(&project_root)).await?;
            let recovered = outcome.succeeded()
                && self.mcp.evaluate_mcp_status(&provider).await == crate::mcp::McpCheck::Pass;
            if !recovered {
                return Err(OrchestratorError::precondition(
                    "MCP_NOT_CONFIGURED",
                    format!(
                        "provider '{}' has no working MCP registration for alias 'devchain'",
                        provider.name
                    ),
                ));
            }
        }

        // 6. Deterministic session name, unique in the multiplexer.
        let session = SessionRow::running(&agent.id, "", request.epic_id.as_deref());
        let tmux_name = prompt::session_name(
            &project.name,
            epic.as_ref().map(|e| e.title.as_str()),
            &agent.id,
            &session.id,
        );
        if self.tmux.has_session(&tmux_name).await? {
            return Err(OrchestratorError::conflict(format!(
                "tmux session '{tmux_name}' already exists"
            )));
        }
        let session = SessionRow {
            tmux_session_id: tmux_name.clone(),
            ..session
        };

        // 7. Durable row first; a unique violation means another launch
        // won the race (or a crash left an active row): adopt it.
        if let Err(err) = self.db.sessions().insert(&session).await {
            if matches!(err, OrchestratorError::Conflict { .. }) {
                if self.tmux.has_session(&tmux_name).await? {
                    let _ = self.tmux.kill_session(&tmux_name).await;
                }
                let existing = self
                    .db
                    .sessions()
                    .get_active_for_agent(&agent.id)
                    .await?
                    .ok_or(err)?;
                let epic = self.load_epic(existing.epic_id.as_deref()).await?;
                return Ok(LaunchedSession {
                    session: existing,
                    agent,
                    epic,
                });
            }
            return Err(err);
        }

        // 8-9. Multiplexer session, provider argv, initial prompt.
        if let Err(err) = self
            .start_provider(
                &tmux_name,
                &project_root,
                &bin_path,
                &provider_args,
                &project,
                &agent,
                &epic,
                &session,
            )
            .await
        {
            warn!("session start for agent '{}' failed: {err}", agent.name);
            let _ = self.db.sessions().mark_ended(&session.id, "failed").await;
            let _ = self.tmux.kill_session(&tmux_name).await;
            return Err(err);
        }

        // 10. The event is published strictly after the row is durable.
        self.events
            .publish(
                "session.started",
                serde_json::json!({
                    "sessionId": session.id,
                    "epicId": session.epic_id,
                    "agentId": agent.id,
                    "tmuxSessionName": tmux_name,
                }),
                None,
            )
            .await?;

        info!("session {} started for agent '{}'", session.id, agent.name);
        Ok(LaunchedSession {
            session,
            agent,
            epic,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_provider(
        &self,
        tmux_name: &str,
        project_root: &Path,
        bin_path: &str,
        provider_args: &[String],
        project: &crate::store::projects::ProjectRow,
        agent: &AgentRow,
        epic: &Option<EpicRow>,
        session: &SessionRow,
    ) -> Result<()> {
        self.tmux.create_session(tmux_name, project_root).await?;

        let mut argv = vec![bin_path.to_string()];
        argv.extend(provider_args.iter().cloned());
        self.tmux.send_command_line(tmux_name, &argv).await?;

        let vars = PromptVars {
            agent_name: agent.name.clone(),
            project_name: project.name.clone(),
            epic_title: epic.as_ref().map(|e| e.title.clone()),
            session_id: session.id.clone(),
        };
        let text = match project.initial_session_prompt.as_deref() {
            Some(template) if !template.trim().is_empty() => {
                prompt::render_initial_prompt(template, &vars)
            }
            _ => prompt::fallback_prompt(&vars),
        };
        self.tmux.paste_and_submit(tmux_name, &text).await
    }

    async fn load_epic(&self, epic_id: Option<&str>) -> Result<Option<EpicRow>> {
        match epic_id {
            None => Ok(None),
            Some(id) => Ok(Some(self.db.projects().get_epic(id).await?)),
        }
    }

    /// Tear down an agent's active session. Runs under the same agent
    /// lock as launching.
    pub async fn stop_session(&self, agent_id: &str) -> Result<Option<SessionRow>> {
        self.locks
            .with_lock(agent_id, async {
                let Some(session) = self.db.sessions().get_active_for_agent(agent_id).await? else {
                    return Ok(None);
                };
                if let Err(err) = self.tmux.kill_session(&session.tmux_session_id).await {
                    warn!(
                        "killing tmux session '{}' failed: {err}",
                        session.tmux_session_id
                    );
                }
                self.db.sessions().mark_ended(&session.id, "stopped").await?;
                Ok(Some(session))
            })
            .await
    }
}
