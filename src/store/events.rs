//! Event log rows and handler outcome records.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub request_id: Option<String>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HandlerRecord {
    pub id: String,
    pub event_id: String,
    pub handler: String,
    pub status: String,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Filters for event-log listing. All optional; combined with AND.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub name: Option<String>,
    pub handler: Option<String>,
    pub handler_status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub owner_project_id: Option<String>,
}

fn row_to_entry(row: &SqliteRow) -> Result<Option<EventLogEntry>> {
    let payload_json: String = row.try_get("payload")?;
    // Malformed stored payloads are excluded rather than failing the query.
    let Ok(payload) = serde_json::from_str(&payload_json) else {
        return Ok(None);
    };
    Ok(Some(EventLogEntry {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        payload,
        request_id: row.try_get("request_id")?,
        published_at: row.try_get("published_at")?,
    }))
}

#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_event(
        &self,
        name: &str,
        payload: &serde_json::Value,
        request_id: Option<&str>,
    ) -> Result<EventLogEntry> {
        let entry = EventLogEntry {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            payload: payload.clone(),
            request_id: request_id.map(str::to_string),
            published_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO event_log (id, name, payload, request_id, published_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.name)
        .bind(entry.payload.to_string())
        .bind(&entry.request_id)
        .bind(entry.published_at)
        .execute(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn insert_handler_record(&self, record: &HandlerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_handlers
                (id, event_id, handler, status, detail, started_at, ended_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.event_id)
        .bind(&record.handler)
        .bind(&record.status)
        .bind(&record.detail)
        .bind(record.started_at)
        .bind(record.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_handler_records(&self, event_id: &str) -> Result<Vec<HandlerRecord>> {
        let rows = sqlx::query("SELECT * FROM event_handlers WHERE event_id = ? ORDER BY started_at")
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(HandlerRecord {
                    id: row.try_get("id")?,
                    event_id: row.try_get("event_id")?,
                    handler: row.try_get("handler")?,
                    status: row.try_get("status")?,
                    detail: row.try_get("detail")?,
                    started_at: row.try_get("started_at")?,
                    ended_at: row.try_get("ended_at")?,
                })
            })
            .collect()
    }

    pub async fn list(&self, filter: &EventFilter) -> Result<Vec<EventLogEntry>> {
        let mut sql = String::from("SELECT DISTINCT e.* FROM event_log e");
        let needs_handler_join = filter.handler.is_some() || filter.handler_status.is_some();
        if needs_handler_join {
            sql.push_str(" JOIN event_handlers h ON h.event_id = e.id");
        }
        sql.push_str(" WHERE 1=1");
        if filter.name.is_some() {
            sql.push_str(" AND e.name = ?");
        }
        if filter.handler.is_some() {
            sql.push_str(" AND h.handler = ?");
        }
        if filter.handler_status.is_some() {
            sql.push_str(" AND h.status = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND e.published_at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND e.published_at <= ?");
        }
        sql.push_str(" ORDER BY e.published_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(ref name) = filter.name {
            query = query.bind(name);
        }
        if let Some(ref handler) = filter.handler {
            query = query.bind(handler);
        }
        if let Some(ref status) = filter.handler_status {
            query = query.bind(status);
        }
        if let Some(since) = filter.since {
            query = query.bind(since);
        }
        if let Some(until) = filter.until {
            query = query.bind(until);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut entries = Vec::new();
        for row in &rows {
            let Some(entry) = row_to_entry(row)? else {
                continue;
            };
            if let Some(ref owner) = filter.owner_project_id {
                let matches = entry
                    .payload
                    .get("ownerProjectId")
                    .and_then(|v| v.as_str())
                    .map(|v| v == owner)
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Rolling retention for the high-volume activity stream; other
    /// event names are kept indefinitely.
    pub async fn delete_activity_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM event_log WHERE name = 'orchestrator.worktree.activity' AND published_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
