//! Worktree runtime management: docker containers or host processes.
//!
//! Docker availability probes are coalesced through a single-flight and
//! cached for a bounded TTL so bursts of worktree operations do not
//! hammer the daemon. Health waits use exponential backoff probes with
//! a bounded total budget; on timeout the lifecycle service transitions
//! the worktree to `error`.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::subprocess::{ProcessCommandBuilder, SubprocessManager};
use crate::sync::SingleFlight;
use crate::worktree::{RuntimeType, WorktreeRecord};

const DOCKER_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_WAIT_BUDGET: Duration = Duration::from_secs(60);
const DEFAULT_TEMPLATE_IMAGE: &str = "devchain/worktree:latest";
/// Port the worktree image serves on inside the container.
const CONTAINER_HTTP_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct DockerAvailability {
    pub available: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionedRuntime {
    pub container_id: Option<String>,
    pub container_port: Option<u16>,
}

pub struct RuntimeManager {
    subprocess: SubprocessManager,
    config: OrchestratorConfig,
    http: reqwest::Client,
    docker_flight: SingleFlight<DockerAvailability>,
    docker_cache: StdMutex<Option<(Instant, DockerAvailability)>>,
}

/// Backoff schedule for health probes: 250ms doubling to a 5s ceiling.
pub(crate) fn probe_delays(budget: Duration) -> Vec<Duration> {
    let mut delays = Vec::new();
    let mut delay = Duration::from_millis(250);
    let mut total = Duration::ZERO;
    while total < budget {
        delays.push(delay);
        total += delay;
        delay = (delay * 2).min(Duration::from_secs(5));
    }
    delays
}

/// Parse `docker port` output like `127.0.0.1:49153` into the port.
pub(crate) fn parse_mapped_port(output: &str) -> Option<u16> {
    output
        .lines()
        .next()?
        .trim()
        .rsplit(':')
        .next()?
        .parse()
        .ok()
}

impl RuntimeManager {
    pub fn new(subprocess: SubprocessManager, config: OrchestratorConfig) -> Self {
        Self {
            subprocess,
            config,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("reqwest client construction is infallible with static options"),
            docker_flight: SingleFlight::new(),
            docker_cache: StdMutex::new(None),
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let command = ProcessCommandBuilder::new("docker")
            .args(args)
            .timeout(DOCKER_COMMAND_TIMEOUT)
            .build();
        let output = self.subprocess.runner().run(command).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(OrchestratorError::external(format!(
                "docker {} failed: {}",
                args.join(" "),
                output.combined_message()
            )))
        }
    }

    /// Probe the docker daemon, coalescing concurrent probes and caching
    /// the answer for the configured TTL.
    pub async fn docker_available(&self) -> DockerAvailability {
        {
            let cache = self.docker_cache.lock().unwrap();
            if let Some((probed_at, ref availability)) = *cache {
                if probed_at.elapsed() < self.config.docker_availability_ttl {
                    return availability.clone();
                }
            }
        }

        let subprocess = self.subprocess.clone();
        let availability = self
            .docker_flight
            .run("docker", move || async move {
                let command = ProcessCommandBuilder::new("docker")
                    .args(["info", "--format", "{{.ServerVersion}}"])
                    .timeout(DOCKER_COMMAND_TIMEOUT)
                    .build();
                match subprocess.runner().run(command).await {
                    Ok(output) if output.status.success() => DockerAvailability {
                        available: true,
                        detail: format!("server {}", output.stdout.trim()),
                    },
                    Ok(output) => DockerAvailability {
                        available: false,
                        detail: output.combined_message(),
                    },
                    Err(err) => DockerAvailability {
                        available: false,
                        detail: err.to_string(),
                    },
                }
            })
            .await;

        *self.docker_cache.lock().unwrap() = Some((Instant::now(), availability.clone()));
        availability
    }

    fn data_dir(&self, record: &WorktreeRecord) -> PathBuf {
        let repo_root = PathBuf::from(&record.repo_path);
        self.config
            .worktrees_data_root(&repo_root)
            .join(&record.name)
    }

    /// Create the runtime for a freshly created worktree: a container
    /// plus data volume, or a process slot with its heartbeat directory.
    pub async fn provision(&self, record: &WorktreeRecord) -> Result<ProvisionedRuntime> {
        let data_dir = self.data_dir(record);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| OrchestratorError::external(format!("creating data dir: {e}")))?;

        match record.runtime_type {
            RuntimeType::Process => Ok(ProvisionedRuntime {
                container_id: None,
                container_port: None,
            }),
            RuntimeType::Container => {
                let availability = self.docker_available().await;
                if !availability.available {
                    return Err(OrchestratorError::precondition(
                        "DOCKER_UNAVAILABLE",
                        format!("docker daemon unavailable: {}", availability.detail),
                    ));
                }

                let image = record
                    .template_slug
                    .as_deref()
                    .map(|slug| format!("devchain/worktree-{slug}:latest"))
                    .unwrap_or_else(|| DEFAULT_TEMPLATE_IMAGE.to_string());
                let container_name = format!("devchain-wt-{}", record.name);
                let publish = format!("127.0.0.1:0:{CONTAINER_HTTP_PORT}");
                let volume = format!("{}:/data", data_dir.display());
                let workspace = format!("{}:/workspace", record.worktree_path);

                let stdout = self
                    .docker(&[
                        "run", "-d", "--name", &container_name, "-p", &publish, "-v", &volume,
                        "-v", &workspace, &image,
                    ])
                    .await?;
                let container_id = stdout.trim().to_string();
                let port = self.mapped_port(&container_id).await?;
                Ok(ProvisionedRuntime {
                    container_id: Some(container_id),
                    container_port: Some(port),
                })
            }
        }
    }

    async fn mapped_port(&self, container_id: &str) -> Result<u16> {
        let spec = format!("{CONTAINER_HTTP_PORT}/tcp");
        let output = self.docker(&["port", container_id, &spec]).await?;
        parse_mapped_port(&output).ok_or_else(|| {
            OrchestratorError::external(format!(
                "could not parse mapped port from docker output: {output:?}"
            ))
        })
    }

    pub async fn start(&self, record: &WorktreeRecord) -> Result<Option<u16>> {
        match record.runtime_type {
            RuntimeType::Process => Ok(record.container_port),
            RuntimeType::Container => {
                let container_id = record.container_id.as_deref().ok_or_else(|| {
                    OrchestratorError::precondition(
                        "RUNTIME_MISSING",
                        format!("worktree '{}' has no container to start", record.name),
                    )
                })?;
                self.docker(&["start", container_id]).await?;
                Ok(Some(self.mapped_port(container_id).await?))
            }
        }
    }

    /// Graceful stop, then forced. Failures surface; delete paths treat
    /// them as best-effort.
    pub async fn stop(&self, record: &WorktreeRecord) -> Result<()> {
        match record.runtime_type {
            RuntimeType::Process => Ok(()),
            RuntimeType::Container => {
                let Some(container_id) = record.container_id.as_deref() else {
                    return Ok(());
                };
                if self.docker(&["stop", "-t", "10", container_id]).await.is_err() {
                    debug!("graceful stop failed for {container_id}, killing");
                    self.docker(&["kill", container_id]).await?;
                }
                Ok(())
            }
        }
    }

    /// Remove the container and the data volume directory.
    pub async fn remove(&self, record: &WorktreeRecord) -> Result<()> {
        if record.runtime_type == RuntimeType::Container {
            if let Some(container_id) = record.container_id.as_deref() {
                self.docker(&["rm", "-f", container_id]).await?;
            }
        }
        let data_dir = self.data_dir(record);
        if data_dir.exists() {
            if let Err(err) = tokio::fs::remove_dir_all(&data_dir).await {
                warn!("removing data dir {data_dir:?} failed: {err}");
            }
        }
        Ok(())
    }

    /// Wait until the runtime answers its health predicate: HTTP 200 on
    /// `/health` for containers, a heartbeat file for processes.
    pub async fn wait_healthy(&self, record: &WorktreeRecord, port: Option<u16>) -> Result<()> {
        for delay in probe_delays(HEALTH_WAIT_BUDGET) {
            if self.probe_once(record, port).await {
                return Ok(());
            }
            tokio::time::sleep(delay).await;
        }
        Err(OrchestratorError::timeout(
            format!("health wait for worktree '{}'", record.name),
            HEALTH_WAIT_BUDGET,
        ))
    }

    async fn probe_once(&self, record: &WorktreeRecord, port: Option<u16>) -> bool {
        match record.runtime_type {
            RuntimeType::Container => {
                let Some(port) = port else { return false };
                let url = format!("http://127.0.0.1:{port}/health");
                matches!(
                    self.http.get(&url).send().await,
                    Ok(response) if response.status().is_success()
                )
            }
            RuntimeType::Process => self.heartbeat_path(record).exists(),
        }
    }

    fn heartbeat_path(&self, record: &WorktreeRecord) -> PathBuf {
        self.data_dir(record).join("heartbeat")
    }

    /// Process-runtime slots announce liveness by touching this file.
    pub fn heartbeat_file(&self, record: &WorktreeRecord) -> PathBuf {
        self.heartbeat_path(record)
    }

    pub fn data_directory(&self, record: &WorktreeRecord) -> PathBuf {
        self.data_dir(record)
    }
}

/// Convenience used by tests and process-runtime supervisors.
pub fn touch_heartbeat(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, chrono::Utc::now().to_rfc3339())
}
