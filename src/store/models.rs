//! Row types for the observability database.
//!
//! Nothing here is load-bearing for proxy correctness — the buffer state
//! machine and registry hold the only state the proxy actually needs. This
//! is purely a trailing record of what happened, for the dashboard and for
//! post-mortem debugging after a restart wipes the in-memory registry.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ConversationRow {
    pub registry_key: String,
    pub conv_id_prefix: String,
    pub model: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
    pub registry_key: String,
    pub kind: String,
    pub phase: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub registry_key: &'a str,
    pub kind: &'a str,
    pub phase: &'a str,
    pub detail: Option<&'a str>,
}
