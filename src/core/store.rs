//! Durable session store.
//!
//! The core only knows the [`SessionStore`] trait; production wires in
//! [`PgStore`] when `DB_HOST` is configured and runs fully in-memory
//! otherwise. Every call from the core happens on a background task with
//! a short deadline via [`spawn_write`] — a slow or broken database never
//! stalls a request.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use crate::config::DbConfig;

use super::error::StoreError;

/// Deadline for a single background store call.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Row shape for the `sessions` table.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub workspace_path: String,
    pub status: String,
    pub encrypted_credentials: serde_json::Value,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Persistence operations the session manager relies on.
///
/// Implementations must be safe to call concurrently from many
/// background writers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session row keyed by `session_id`.
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn update_status(&self, session_id: &str, status: &str) -> Result<(), StoreError>;

    async fn update_last_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Append one output chunk to the session's log.
    async fn append_output(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
        data: &str,
    ) -> Result<(), StoreError>;

    /// Delete a session row; the output log cascades.
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Mark every row still `initializing` or `active` as `terminated`.
    /// Called once at startup: PTYs do not survive a restart, so any
    /// live-looking row is a leftover from the previous run.
    async fn mark_stale_terminated(&self) -> Result<u64, StoreError>;
}

/// Runs a store write in the background with [`WRITE_DEADLINE`] applied.
/// Failures are logged and dropped; the request path never sees them.
pub fn spawn_write<F>(what: &'static str, fut: F)
where
    F: Future<Output = Result<(), StoreError>> + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::time::timeout(WRITE_DEADLINE, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("store {what} failed: {e}"),
            Err(_) => log::warn!("store {what} timed out after {WRITE_DEADLINE:?}"),
        }
    });
}

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects, bounds the pool, and ensures the schema exists.
    pub async fn connect(cfg: &DbConfig) -> Result<Self, StoreError> {
        let ssl_mode = match cfg.sslmode.as_str() {
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            "disable" => PgSslMode::Disable,
            _ => PgSslMode::Prefer,
        };

        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.name)
            .ssl_mode(ssl_mode);

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id            TEXT PRIMARY KEY,
                user_id               TEXT NOT NULL,
                workspace_path        TEXT NOT NULL,
                status                TEXT NOT NULL,
                encrypted_credentials JSONB NOT NULL DEFAULT '{}'::jsonb,
                last_activity         TIMESTAMPTZ NOT NULL,
                created_at            TIMESTAMPTZ NOT NULL,
                updated_at            TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions (user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions (status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_output (
                id         BIGSERIAL PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions (session_id) ON DELETE CASCADE,
                timestamp  TIMESTAMPTZ NOT NULL,
                data       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_output_session_id \
             ON session_output (session_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions
                (session_id, user_id, workspace_path, status,
                 encrypted_credentials, last_activity, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (session_id) DO UPDATE SET
                status = EXCLUDED.status,
                encrypted_credentials = EXCLUDED.encrypted_credentials,
                last_activity = EXCLUDED.last_activity,
                updated_at = now()
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&record.workspace_path)
        .bind(&record.status)
        .bind(&record.encrypted_credentials)
        .bind(record.last_activity)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(&self, session_id: &str, status: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET status = $2, updated_at = now() WHERE session_id = $1")
            .bind(session_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_last_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET last_activity = $2, updated_at = now() WHERE session_id = $1",
        )
        .bind(session_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_output(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
        data: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO session_output (session_id, timestamp, data) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(at)
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_stale_terminated(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'terminated', updated_at = now() \
             WHERE status IN ('initializing', 'active')",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
