//! SQLite-backed event log, used only by the dashboard.
//!
//! The proxy's hot path never reads from this database — it only appends
//! to it, best-effort, after a phase transition or swap. A write failure
//! here is logged and swallowed; it must never fail a client request.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::models::{ConversationRow, EventRow, NewEvent};

/// Best-effort observability sink. Every method swallows its own errors —
/// nothing in the hot path may fail because the dashboard couldn't be told.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn touch_conversation(&self, registry_key: &str, conv_id_prefix: &str, model: &str);
    async fn record_event(&self, registry_key: &str, kind: &str, phase: &str, detail: Option<&str>);
}

pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn touch_conversation(&self, _registry_key: &str, _conv_id_prefix: &str, _model: &str) {}
    async fn record_event(&self, _registry_key: &str, _kind: &str, _phase: &str, _detail: Option<&str>) {}
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                registry_key TEXT PRIMARY KEY,
                conv_id_prefix TEXT NOT NULL,
                model TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                registry_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                phase TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS events_registry_key_idx ON events (registry_key)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn touch_conversation(&self, registry_key: &str, conv_id_prefix: &str, model: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (registry_key, conv_id_prefix, model, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(registry_key) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(registry_key)
        .bind(conv_id_prefix)
        .bind(model)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_event(&self, event: NewEvent<'_>) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO events (registry_key, kind, phase, detail, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.registry_key)
        .bind(event.kind)
        .bind(event.phase)
        .bind(event.detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_events(&self, registry_key: &str, limit: i64) -> anyhow::Result<Vec<EventRow>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, registry_key, kind, phase, detail, created_at FROM events
             WHERE registry_key = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(registry_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_conversations(&self) -> anyhow::Result<Vec<ConversationRow>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT registry_key, conv_id_prefix, model, first_seen, last_seen FROM conversations ORDER BY last_seen DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl EventSink for Store {
    async fn touch_conversation(&self, registry_key: &str, conv_id_prefix: &str, model: &str) {
        if let Err(err) = Store::touch_conversation(self, registry_key, conv_id_prefix, model).await {
            tracing::warn!(error = %err, "failed to record conversation touch");
        }
    }

    async fn record_event(&self, registry_key: &str, kind: &str, phase: &str, detail: Option<&str>) {
        let event = NewEvent { registry_key, kind, phase, detail };
        if let Err(err) = Store::record_event(self, event).await {
            tracing::warn!(error = %err, "failed to record dashboard event");
        }
    }
}
