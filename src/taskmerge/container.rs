//! HTTP client for a worktree's in-container API.
//!
//! Every request carries a hard 5-second deadline. Epics and agents are
//! required; statuses and agent profiles are optional with fallbacks at
//! normalization time. Response bodies are tolerated in either bare
//! array form or wrapped (`{"epics": [...]}`, `{"data": [...]}`).

use serde::Deserialize;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

pub const CONTAINER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEpic {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub parent_epic_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAgent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub epics_completed: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Everything pulled from one container in a single sweep.
#[derive(Debug, Clone, Default)]
pub struct ContainerSnapshot {
    pub epics: Vec<SourceEpic>,
    pub agents: Vec<SourceAgent>,
    pub statuses: Vec<SourceStatus>,
    pub profiles: Vec<SourceProfile>,
}

/// Live counters the overview cache displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveCounts {
    pub epics_total: u32,
    pub epics_by_status: std::collections::BTreeMap<String, u32>,
    pub agents_total: u32,
    pub agents_active: u32,
}

#[derive(Clone)]
pub struct ContainerClient {
    http: reqwest::Client,
}

impl Default for ContainerClient {
    fn default() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(CONTAINER_REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client construction is infallible with static options"),
        }
    }
}

/// Unwrap `{"epics": [...]}` / `{"data": [...]}` / bare-array bodies.
fn extract_array(value: serde_json::Value, keys: &[&str]) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => {
            for key in keys {
                if let Some(serde_json::Value::Array(items)) = map.remove(*key) {
                    return items;
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn parse_items<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    keys: &[&str],
) -> Vec<T> {
    extract_array(value, keys)
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

impl ContainerClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn classify(operation: &str, err: reqwest::Error) -> OrchestratorError {
        if err.is_timeout() {
            OrchestratorError::timeout(operation.to_string(), CONTAINER_REQUEST_TIMEOUT)
        } else if err.is_connect() {
            OrchestratorError::precondition(
                "CONTAINER_UNREACHABLE",
                format!("{operation}: container not reachable: {err}"),
            )
        } else {
            OrchestratorError::external_with(format!("{operation} failed"), err.into())
        }
    }

    async fn get_json(&self, port: u16, path_and_query: &str) -> Result<serde_json::Value> {
        let url = format!("http://127.0.0.1:{port}{path_and_query}");
        let operation = format!("GET {path_and_query}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::classify(&operation, e))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::external(format!(
                "{operation} returned HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Self::classify(&operation, e))
    }

    pub async fn fetch_epics(&self, port: u16, project_id: &str) -> Result<Vec<SourceEpic>> {
        let body = self
            .get_json(
                port,
                &format!("/api/epics?projectId={project_id}&limit=1000&type=all"),
            )
            .await?;
        Ok(parse_items(body, &["epics", "data", "items"]))
    }

    pub async fn fetch_agents(&self, port: u16, project_id: &str) -> Result<Vec<SourceAgent>> {
        let body = self
            .get_json(port, &format!("/api/agents?projectId={project_id}&limit=1000"))
            .await?;
        Ok(parse_items(body, &["agents", "data", "items"]))
    }

    /// Optional: a missing statuses endpoint just yields fallback labels.
    pub async fn fetch_statuses(&self, port: u16, project_id: &str) -> Vec<SourceStatus> {
        match self
            .get_json(port, &format!("/api/statuses?projectId={project_id}&limit=1000"))
            .await
        {
            Ok(body) => parse_items(body, &["statuses", "data", "items"]),
            Err(_) => Vec::new(),
        }
    }

    /// Optional: `/api/agent-profiles` first, `/api/profiles` fallback.
    pub async fn fetch_profiles(&self, port: u16, project_id: &str) -> Vec<SourceProfile> {
        let primary = self
            .get_json(
                port,
                &format!("/api/agent-profiles?projectId={project_id}&limit=1000"),
            )
            .await;
        let body = match primary {
            Ok(body) => body,
            Err(_) => match self
                .get_json(port, &format!("/api/profiles?projectId={project_id}"))
                .await
            {
                Ok(body) => body,
                Err(_) => return Vec::new(),
            },
        };
        parse_items(body, &["profiles", "data", "items"])
    }

    /// Required and optional endpoints fetched concurrently.
    pub async fn fetch_snapshot(&self, port: u16, project_id: &str) -> Result<ContainerSnapshot> {
        let (epics, agents, statuses, profiles) = tokio::join!(
            self.fetch_epics(port, project_id),
            self.fetch_agents(port, project_id),
            self.fetch_statuses(port, project_id),
            self.fetch_profiles(port, project_id),
        );
        Ok(ContainerSnapshot {
            epics: epics?,
            agents: agents?,
            statuses,
            profiles,
        })
    }

    /// Live counters for the overview cache. Any failure propagates;
    /// the cache records and caches the error block.
    pub async fn fetch_live_counts(&self, port: u16, project_id: &str) -> Result<LiveCounts> {
        let (epics, agents) = tokio::try_join!(
            self.fetch_epics(port, project_id),
            self.fetch_agents(port, project_id),
        )?;
        let mut by_status = std::collections::BTreeMap::new();
        for epic in &epics {
            let key = epic.status_id.clone().unwrap_or_else(|| "unknown".into());
            *by_status.entry(key).or_insert(0) += 1;
        }
        let active = agents
            .iter()
            .filter(|a| a.epics_completed.unwrap_or(0) > 0)
            .count() as u32;
        Ok(LiveCounts {
            epics_total: epics.len() as u32,
            epics_by_status: by_status,
            agents_total: agents.len() as u32,
            agents_active: active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_wrapped_and_bare_arrays() {
        let wrapped = serde_json::json!({"epics": [{"id": "e1", "title": "T"}]});
        let items: Vec<SourceEpic> = parse_items(wrapped, &["epics", "data"]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "e1");

        let bare = serde_json::json!([{"id": "a1", "name": "Coder"}]);
        let agents: Vec<SourceAgent> = parse_items(bare, &["agents"]);
        assert_eq!(agents[0].name, "Coder");
    }

    #[test]
    fn malformed_items_are_dropped() {
        let body = serde_json::json!({"data": [{"id": "ok"}, "not-an-object", 42]});
        let items: Vec<SourceEpic> = parse_items(body, &["data"]);
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_container_is_a_precondition_failure() {
        let client = ContainerClient::new();
        // Port 1 on loopback refuses connections.
        let err = client.fetch_epics(1, "p1").await.unwrap_err();
        assert_eq!(err.code(), "CONTAINER_UNREACHABLE");
    }
}
