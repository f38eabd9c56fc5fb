use async_trait::async_trait;
use docverify_core::{QueryOutput, SqlSession, StatementError};
use futures_util::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgDatabaseError, PgPoolOptions, PgRow};
use sqlx::{Column, Connection, Either, Executor, Pool, Postgres, Row};
use std::time::Duration;

use crate::{Error, Result};

/// How long closing an abandoned connection may take before it is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A single PostgreSQL connection, held for the whole run.
///
/// Statements are sent as plain text over the simple query protocol, so every
/// value comes back in its text representation regardless of column type.
pub struct PgSession {
    pool: Pool<Postgres>,
    conn: Option<PoolConnection<Postgres>>,
    backend_pid: Option<i32>,
}

impl PgSession {
    /// Create new database session
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let mut session = Self {
            pool,
            conn: None,
            backend_pid: None,
        };
        session.open().await?;
        Ok(session)
    }

    async fn open(&mut self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await?;
        tracing::debug!("Opened database session (backend pid {})", pid);
        self.backend_pid = Some(pid);
        self.conn = Some(conn);
        Ok(())
    }

    /// Server version string, e.g. `16.2`.
    pub async fn server_version(&mut self) -> Result<String> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Connection("session is closed".to_string()))?;
        let version: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(&mut **conn)
            .await?;
        Ok(version)
    }

    /// Whether `name` is installed in the connected database.
    pub async fn has_extension(&mut self, name: &str) -> Result<bool> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Connection("session is closed".to_string()))?;
        let installed: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = $1)")
                .bind(name)
                .fetch_one(&mut **conn)
                .await?;
        Ok(installed)
    }

    pub async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            close_quietly(conn).await;
        }
        self.pool.close().await;
    }
}

#[async_trait]
impl SqlSession for PgSession {
    async fn execute(&mut self, sql: &str) -> std::result::Result<QueryOutput, StatementError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| StatementError::connection_lost("session is closed"))?;

        let mut output = QueryOutput::empty();
        let mut results = (&mut **conn).fetch_many(sql);
        while let Some(step) = results.try_next().await.map_err(statement_error)? {
            match step {
                Either::Left(done) => output.rows_affected += done.rows_affected(),
                Either::Right(row) => {
                    if output.columns.is_empty() {
                        output.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    output.rows.push(decode_row(&row).map_err(statement_error)?);
                }
            }
        }
        Ok(output)
    }

    async fn reconnect(&mut self) -> std::result::Result<(), StatementError> {
        if let Some(conn) = self.conn.take() {
            close_quietly(conn).await;
        }
        let stale_pid = self.backend_pid.take();

        self.open()
            .await
            .map_err(|e| StatementError::connection_lost(e.to_string()))?;

        // A statement abandoned client-side keeps running on the old backend.
        if let (Some(pid), Some(conn)) = (stale_pid, self.conn.as_mut()) {
            let terminated = sqlx::query("SELECT pg_terminate_backend($1)")
                .bind(pid)
                .execute(&mut **conn)
                .await;
            if let Err(e) = terminated {
                tracing::warn!("Could not terminate stale backend {}: {}", pid, e);
            }
        }
        tracing::info!("Reconnected to database");
        Ok(())
    }
}

async fn close_quietly(conn: PoolConnection<Postgres>) {
    let raw = conn.detach();
    match tokio::time::timeout(CLOSE_TIMEOUT, raw.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Error closing database connection: {}", e),
        Err(_) => tracing::warn!("Timed out closing database connection"),
    }
}

fn decode_row(row: &PgRow) -> std::result::Result<Vec<Option<String>>, sqlx::Error> {
    (0..row.len())
        .map(|i| row.try_get_unchecked::<Option<String>, _>(i))
        .collect()
}

fn statement_error(err: sqlx::Error) -> StatementError {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned());
            let mut message = db.message().to_string();
            if let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() {
                if let Some(detail) = pg.detail() {
                    message.push_str(&format!(" (detail: {})", detail));
                }
                if let Some(hint) = pg.hint() {
                    message.push_str(&format!(" (hint: {})", hint));
                }
            }
            StatementError::rejected(code, message)
        }
        err @ (sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed) => StatementError::connection_lost(err.to_string()),
        other => StatementError::rejected(None, other.to_string()),
    }
}
