//! Application wiring and the HTTP surface.
//!
//! Construction order matters only in that the preflight cache is
//! shared between the MCP coordinator (which clears it) and the
//! preflight checker (which fills it), and that the task-merge engine
//! subscribes to the event bus before any lifecycle operation can
//! publish.

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::events::EventBus;
use crate::git::GitRunner;
use crate::mcp::McpCoordinator;
use crate::preflight::{PreflightCache, PreflightChecker};
use crate::proxy::{self, ProxyState};
use crate::realtime::RealtimeBus;
use crate::session::{SessionLauncher, TmuxDriver};
use crate::store::Database;
use crate::subprocess::SubprocessManager;
use crate::sync::KeyedLocks;
use crate::taskmerge::TaskMergeEngine;
use crate::worktree::{OverviewCache, RuntimeManager, WorktreeLifecycle};

pub struct App {
    pub config: OrchestratorConfig,
    pub db: Database,
    pub realtime: RealtimeBus,
    pub events: EventBus,
    pub git: Arc<GitRunner>,
    pub lifecycle: Arc<WorktreeLifecycle>,
    pub overview: Arc<OverviewCache>,
    pub taskmerge: Arc<TaskMergeEngine>,
    pub mcp: Arc<McpCoordinator>,
    pub preflight: Arc<PreflightChecker>,
    pub launcher: Arc<SessionLauncher>,
}

impl App {
    pub async fn build(config: OrchestratorConfig) -> Result<Self> {
        let db = Database::connect(&config.database_url)
            .await
            .context("opening orchestrator database")?;
        let subprocess = SubprocessManager::production();
        let realtime = RealtimeBus::new();
        let events = EventBus::new(db.events(), realtime.clone());

        let repo_root = config.resolve_repo_path();
        let git = Arc::new(GitRunner::new(
            subprocess.clone(),
            repo_root.clone(),
            config.worktrees_root(&repo_root),
        ));
        let runtime = Arc::new(RuntimeManager::new(subprocess.clone(), config.clone()));

        let taskmerge = Arc::new(TaskMergeEngine::new(db.clone(), config.clone()));
        taskmerge.register_subscriber(&events);

        let lifecycle = Arc::new(WorktreeLifecycle::new(
            db.clone(),
            Arc::clone(&git),
            Arc::clone(&runtime),
            events.clone(),
            Arc::clone(&taskmerge),
            config.clone(),
        ));
        let overview = Arc::new(OverviewCache::new(db.clone(), Arc::clone(&git)));

        let preflight_cache = Arc::new(PreflightCache::new());
        let mcp = Arc::new(McpCoordinator::new(
            db.clone(),
            subprocess.clone(),
            config.clone(),
            Arc::clone(&preflight_cache),
        ));
        let preflight = Arc::new(PreflightChecker::new(
            db.clone(),
            subprocess.clone(),
            config.clone(),
            Arc::clone(&mcp),
            preflight_cache,
        ));

        let launcher = Arc::new(SessionLauncher::new(
            db.clone(),
            TmuxDriver::new(subprocess),
            Arc::clone(&preflight),
            Arc::clone(&mcp),
            realtime.clone(),
            events.clone(),
            Arc::new(KeyedLocks::new()),
        ));

        events.spawn_retention_sweeper();
        if let Err(err) = events.sweep_retention().await {
            tracing::warn!("initial retention sweep failed: {err}");
        }

        Ok(Self {
            config,
            db,
            realtime,
            events,
            git,
            lifecycle,
            overview,
            taskmerge,
            mcp,
            preflight,
            launcher,
        })
    }

    /// The HTTP surface owned by the core: the per-worktree proxy, the
    /// realtime stream and a health probe.
    pub fn router(&self) -> Router {
        let realtime = self.realtime.clone();
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/ws", get(ws_handler))
            .with_state(realtime)
            .merge(proxy::router(ProxyState::new(self.db.clone())))
            .layer(CorsLayer::permissive())
    }

    pub async fn serve(self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.config.port);
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("devchain orchestrator listening on {addr}");
        axum::serve(listener, router).await.context("serving HTTP")
    }
}

/// Realtime stream: every bus message, serialized as one JSON text
/// frame. Inbound frames are ignored except for close.
async fn ws_handler(
    State(realtime): State<RealtimeBus>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |mut socket| async move {
        let mut rx = realtime.subscribe();
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Ok(message) = message else { break };
                    let Ok(text) = serde_json::to_string(&message) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                inbound = socket.recv() => {
                    match inbound {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }
    })
}
