//! PostgreSQL persistence for conversation calls, events, and policy records.

use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use time::OffsetDateTime;

use crate::events::ConversationEvent;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conversation_calls (
        call_id TEXT PRIMARY KEY,
        model_name TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversation_events (
        id BIGSERIAL PRIMARY KEY,
        call_id TEXT NOT NULL REFERENCES conversation_calls(call_id),
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS conversation_events_call_id_idx
        ON conversation_events (call_id, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS policy_config (
        id BIGSERIAL PRIMARY KEY,
        policy_class_ref TEXT NOT NULL,
        config JSONB NOT NULL DEFAULT '{}'::jsonb,
        enabled_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        enabled_by TEXT,
        is_active BOOLEAN NOT NULL DEFAULT false
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        auth_mode TEXT NOT NULL DEFAULT 'disabled',
        validate_credentials BOOLEAN NOT NULL DEFAULT false,
        valid_cache_ttl_seconds INTEGER NOT NULL DEFAULT 300,
        invalid_cache_ttl_seconds INTEGER NOT NULL DEFAULT 60,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_by TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS request_logs (
        id BIGSERIAL PRIMARY KEY,
        transaction_id TEXT NOT NULL,
        direction TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        http_method TEXT NOT NULL,
        url TEXT NOT NULL,
        request_headers JSONB,
        request_body JSONB,
        response_status INTEGER,
        response_headers JSONB,
        response_body JSONB
    )
    "#,
];

/// An active policy record loaded from the `policy_config` table.
#[derive(Debug, Clone)]
pub struct PolicyConfigRow {
    /// Class reference in `module:Class` form.
    pub policy_class_ref: String,
    /// Free-form configuration payload.
    pub config: Value,
}

/// One inbound or outbound HTTP exchange for the `request_logs` table.
#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    /// Transaction this exchange belongs to.
    pub transaction_id: String,
    /// `inbound` (client → proxy) or `outbound` (proxy → backend).
    pub direction: String,
    /// HTTP method of the request.
    pub http_method: String,
    /// Request URL.
    pub url: String,
    /// Request headers, sensitive values already stripped by the caller.
    pub request_headers: Option<Value>,
    /// Request body when it was JSON.
    pub request_body: Option<Value>,
    /// Response status code, when the exchange completed.
    pub response_status: Option<i32>,
    /// Response body when it was JSON.
    pub response_body: Option<Value>,
}

/// Durable store handle. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the store and verify the connection.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool, mainly for tests.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema when it does not exist yet.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Insert the call row if missing.
    pub async fn ensure_call(&self, call_id: &str, model: Option<&str>) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO conversation_calls (call_id, model_name, status)
             VALUES ($1, $2, 'active')
             ON CONFLICT (call_id) DO NOTHING",
        )
        .bind(call_id)
        .bind(model)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a call finished with the given terminal status.
    pub async fn complete_call(&self, call_id: &str, status: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE conversation_calls
             SET status = $2, completed_at = $3
             WHERE call_id = $1",
        )
        .bind(call_id)
        .bind(status)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one event row. The call row is created on demand so events
    /// for calls the recorder never opened still land somewhere.
    pub async fn insert_event(&self, event: &ConversationEvent) -> anyhow::Result<()> {
        self.ensure_call(&event.call_id, None).await?;

        sqlx::query(
            "INSERT INTO conversation_events (call_id, event_type, payload, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&event.call_id)
        .bind(&event.event_type)
        .bind(Json(&event.payload))
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch the currently active policy record, newest first.
    pub async fn active_policy_config(&self) -> anyhow::Result<Option<PolicyConfigRow>> {
        let row = sqlx::query(
            "SELECT policy_class_ref, config
             FROM policy_config
             WHERE is_active
             ORDER BY enabled_at DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PolicyConfigRow {
            policy_class_ref: row.get("policy_class_ref"),
            config: row.get::<Json<Value>, _>("config").0,
        }))
    }

    /// Deactivate previous records and insert the new active one.
    pub async fn activate_policy_config(
        &self,
        policy_class_ref: &str,
        config: &Value,
        enabled_by: &str,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE policy_config SET is_active = false WHERE is_active")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO policy_config (policy_class_ref, config, enabled_by, is_active)
             VALUES ($1, $2, $3, true)",
        )
        .bind(policy_class_ref)
        .bind(Json(config))
        .bind(enabled_by)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Append one HTTP exchange to `request_logs`.
    pub async fn record_request_log(&self, record: &RequestLogRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO request_logs
                 (transaction_id, direction, http_method, url,
                  request_headers, request_body, response_status, response_body)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&record.transaction_id)
        .bind(&record.direction)
        .bind(&record.http_method)
        .bind(&record.url)
        .bind(record.request_headers.as_ref().map(Json))
        .bind(record.request_body.as_ref().map(Json))
        .bind(record.response_status)
        .bind(record.response_body.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
