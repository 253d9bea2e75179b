//! Provider rows. `name` is case-insensitive and keys into the MCP
//! adapter table (claude / codex / gemini).

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub id: String,
    pub name: String,
    pub bin_path: Option<String>,
    pub mcp_configured: bool,
    pub mcp_endpoint: Option<String>,
    pub mcp_registered_at: Option<DateTime<Utc>>,
    pub auto_compact_threshold: Option<i64>,
}

impl ProviderRow {
    pub fn new(name: &str, bin_path: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            bin_path: bin_path.map(str::to_string),
            mcp_configured: false,
            mcp_endpoint: None,
            mcp_registered_at: None,
            auto_compact_threshold: None,
        }
    }

    pub fn is_claude(&self) -> bool {
        self.name.eq_ignore_ascii_case("claude")
    }
}

fn row_to_provider(row: &SqliteRow) -> Result<ProviderRow> {
    let mcp_configured: i64 = row.try_get("mcp_configured")?;
    Ok(ProviderRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        bin_path: row.try_get("bin_path")?,
        mcp_configured: mcp_configured != 0,
        mcp_endpoint: row.try_get("mcp_endpoint")?,
        mcp_registered_at: row.try_get("mcp_registered_at")?,
        auto_compact_threshold: row.try_get("auto_compact_threshold")?,
    })
}

#[derive(Clone)]
pub struct ProviderStore {
    pool: SqlitePool,
}

impl ProviderStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, provider: &ProviderRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO providers
                (id, name, bin_path, mcp_configured, mcp_endpoint,
                 mcp_registered_at, auto_compact_threshold)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&provider.id)
        .bind(&provider.name)
        .bind(&provider.bin_path)
        .bind(i64::from(provider.mcp_configured))
        .bind(&provider.mcp_endpoint)
        .bind(provider.mcp_registered_at)
        .bind(provider.auto_compact_threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ProviderRow>> {
        let rows = sqlx::query("SELECT * FROM providers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_provider).collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<ProviderRow> {
        let row = sqlx::query("SELECT * FROM providers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("provider", id))?;
        row_to_provider(&row)
    }

    /// Case-insensitive name lookup (the `name` column is NOCASE).
    pub async fn get_by_name(&self, name: &str) -> Result<Option<ProviderRow>> {
        let row = sqlx::query("SELECT * FROM providers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_provider).transpose()
    }

    /// Record a successful MCP registration. Best-effort at call sites:
    /// a failure here is logged, not propagated.
    pub async fn mark_mcp_configured(&self, id: &str, endpoint: &str) -> Result<()> {
        sqlx::query(
            "UPDATE providers SET mcp_configured = 1, mcp_endpoint = ?, mcp_registered_at = ? WHERE id = ?",
        )
        .bind(endpoint)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn name_lookup_is_case_insensitive() {
        let db = Database::in_memory().await.unwrap();
        let store = db.providers();
        store
            .insert(&ProviderRow::new("Claude", Some("/usr/local/bin/claude")))
            .await
            .unwrap();

        let found = store.get_by_name("claude").await.unwrap().unwrap();
        assert!(found.is_claude());
        assert_eq!(found.bin_path.as_deref(), Some("/usr/local/bin/claude"));

        let dup = store.insert(&ProviderRow::new("CLAUDE", None)).await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn mcp_metadata_update() {
        let db = Database::in_memory().await.unwrap();
        let store = db.providers();
        let provider = ProviderRow::new("codex", Some("/usr/bin/codex"));
        store.insert(&provider).await.unwrap();

        store
            .mark_mcp_configured(&provider.id, "http://127.0.0.1:3000/mcp")
            .await
            .unwrap();

        let updated = store.get_by_id(&provider.id).await.unwrap();
        assert!(updated.mcp_configured);
        assert_eq!(
            updated.mcp_endpoint.as_deref(),
            Some("http://127.0.0.1:3000/mcp")
        );
        assert!(updated.mcp_registered_at.is_some());
    }
}
