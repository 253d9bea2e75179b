//! Event publication, handler dispatch and retention.
//!
//! `publish` validates against the static registry, persists one row,
//! broadcasts `event_created` on `events/logs`, then runs every
//! registered handler inline. Each handler outcome is recorded as a
//! handler row and broadcast as `handler_recorded`; one handler's
//! failure never prevents the others from running.
//!
//! Handlers are plain function values registered at component
//! construction; there is no dynamic subscriber discovery.

pub mod registry;

use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::realtime::RealtimeBus;
use crate::store::events::{EventFilter, EventLogEntry, HandlerRecord};
use crate::store::EventStore;

pub use registry::ACTIVITY_EVENT;

/// A subscriber: receives the stored payload (with `eventId` attached),
/// returns a detail string recorded on success.
pub type EventHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

#[derive(Clone)]
pub struct EventBus {
    store: EventStore,
    realtime: RealtimeBus,
    handlers: Arc<StdMutex<HashMap<String, Vec<(String, EventHandler)>>>>,
}

impl EventBus {
    pub fn new(store: EventStore, realtime: RealtimeBus) -> Self {
        Self {
            store,
            realtime,
            handlers: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Register `handler` for `name`. Call during wiring, before any
    /// publish for that name.
    pub fn subscribe(&self, name: &str, handler_name: &str, handler: EventHandler) {
        self.handlers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push((handler_name.to_string(), handler));
    }

    /// Publish an event: validate, persist, broadcast, dispatch.
    /// Returns the stored event id.
    pub async fn publish(
        &self,
        name: &str,
        payload: serde_json::Value,
        request_id: Option<&str>,
    ) -> Result<String> {
        if !registry::is_registered(name) {
            return Err(OrchestratorError::validation(format!(
                "unknown event name '{name}'"
            )));
        }
        if let Some(violation) = registry::validate_payload(name, &payload) {
            return Err(OrchestratorError::validation(format!(
                "invalid payload for '{name}': {violation}"
            )));
        }

        let entry = self.store.insert_event(name, &payload, request_id).await?;

        let mut emitted = payload.clone();
        emitted["eventId"] = serde_json::Value::String(entry.id.clone());
        self.realtime.broadcast(
            "events/logs",
            "event_created",
            serde_json::json!({ "id": entry.id, "name": name, "payload": emitted }),
        );

        self.dispatch(name, &entry.id, emitted).await;
        Ok(entry.id)
    }

    async fn dispatch(&self, name: &str, event_id: &str, payload: serde_json::Value) {
        let handlers: Vec<(String, EventHandler)> = self
            .handlers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();

        for (handler_name, handler) in handlers {
            let started_at = Utc::now();
            let outcome = handler(payload.clone()).await;
            let ended_at = Utc::now();

            let (status, detail) = match outcome {
                Ok(detail) => {
                    debug!("handler {handler_name} for {name} ok: {detail}");
                    ("success", detail)
                }
                Err(err) => {
                    warn!("handler {handler_name} for {name} failed: {err:#}");
                    ("failure", format!("{err:#}"))
                }
            };

            let record = HandlerRecord {
                id: Uuid::new_v4().to_string(),
                event_id: event_id.to_string(),
                handler: handler_name.clone(),
                status: status.to_string(),
                detail: Some(detail),
                started_at,
                ended_at,
            };
            if let Err(err) = self.store.insert_handler_record(&record).await {
                warn!("recording handler outcome failed: {err}");
            }
            self.realtime.broadcast(
                "events/logs",
                "handler_recorded",
                serde_json::json!({
                    "eventId": event_id,
                    "handler": handler_name,
                    "status": status,
                }),
            );
        }
    }

    pub async fn list(&self, filter: &EventFilter) -> Result<Vec<EventLogEntry>> {
        self.store.list(filter).await
    }

    pub async fn handler_records(&self, event_id: &str) -> Result<Vec<HandlerRecord>> {
        self.store.list_handler_records(event_id).await
    }

    /// One retention sweep: drop activity rows older than 30 days.
    pub async fn sweep_retention(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(30);
        let deleted = self.store.delete_activity_older_than(cutoff).await?;
        if deleted > 0 {
            debug!("retention sweep removed {deleted} activity events");
        }
        Ok(deleted)
    }

    /// Daily retention timer with an initial sweep on start. The task
    /// runs for the process lifetime; dropping the handle detaches it.
    pub fn spawn_retention_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            loop {
                timer.tick().await;
                if let Err(err) = bus.sweep_retention().await {
                    warn!("retention sweep failed: {err}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_bus(db: &Database) -> EventBus {
        EventBus::new(db.events(), RealtimeBus::new())
    }

    #[tokio::test]
    async fn publish_persists_and_returns_id() {
        let db = Database::in_memory().await.unwrap();
        let bus = test_bus(&db);

        let id = bus
            .publish(
                "orchestrator.worktree.merged",
                serde_json::json!({"worktreeId": "w1", "mergeCommit": "abc123"}),
                Some("req-1"),
            )
            .await
            .unwrap();

        let entries = bus.list(&EventFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn unknown_name_is_rejected_without_persisting() {
        let db = Database::in_memory().await.unwrap();
        let bus = test_bus(&db);

        let err = bus
            .publish("nope.event", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(bus.list(&EventFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let bus = test_bus(&db);

        let err = bus
            .publish(
                "orchestrator.worktree.merged",
                serde_json::json!({"worktreeId": "w1"}),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mergeCommit"));
    }

    #[tokio::test]
    async fn every_registered_handler_runs_and_is_recorded() {
        let db = Database::in_memory().await.unwrap();
        let bus = test_bus(&db);
        let calls = Arc::new(AtomicUsize::new(0));

        let ok_calls = Arc::clone(&calls);
        bus.subscribe(
            "worktree.task-merge-requested",
            "taskmerge",
            Arc::new(move |_payload| {
                let calls = Arc::clone(&ok_calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("merged".to_string())
                })
            }),
        );
        let fail_calls = Arc::clone(&calls);
        bus.subscribe(
            "worktree.task-merge-requested",
            "broken-subscriber",
            Arc::new(move |_payload| {
                let calls = Arc::clone(&fail_calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("container unreachable")
                })
            }),
        );

        let id = bus
            .publish(
                "worktree.task-merge-requested",
                serde_json::json!({"worktreeId": "w1"}),
                None,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let records = bus.handler_records(&id).await.unwrap();
        assert_eq!(records.len(), 2);
        let statuses: Vec<&str> = records.iter().map(|r| r.status.as_str()).collect();
        assert!(statuses.contains(&"success"));
        assert!(statuses.contains(&"failure"));
    }

    #[tokio::test]
    async fn handler_payload_carries_event_id() {
        let db = Database::in_memory().await.unwrap();
        let bus = test_bus(&db);
        let seen = Arc::new(StdMutex::new(None));

        let seen_clone = Arc::clone(&seen);
        bus.subscribe(
            "worktree.task-merge-requested",
            "capture",
            Arc::new(move |payload| {
                let seen = Arc::clone(&seen_clone);
                Box::pin(async move {
                    *seen.lock().unwrap() =
                        payload.get("eventId").and_then(|v| v.as_str()).map(String::from);
                    Ok(String::new())
                })
            }),
        );

        let id = bus
            .publish(
                "worktree.task-merge-requested",
                serde_json::json!({"worktreeId": "w1"}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some(id.as_str()));
    }
}
