use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expectation::Cell;

/// SQLSTATE Postgres reports when `statement_timeout` cancels a statement.
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Rows captured from one statement, every cell rendered as text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutput {
    /// Empty when the statement returned no rows.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub rows_affected: u64,
}

impl QueryOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    /// First column of the first row, if it is not null.
    pub fn first_cell(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementErrorKind {
    /// The database rejected the statement; the session is still usable.
    Rejected,
    /// The statement hit the server-side timeout.
    TimedOut,
    /// The connection is gone or in an unknown state.
    ConnectionLost,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StatementError {
    pub kind: StatementErrorKind,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl StatementError {
    pub fn rejected(sqlstate: Option<String>, message: impl Into<String>) -> Self {
        let kind = if sqlstate.as_deref() == Some(SQLSTATE_QUERY_CANCELED) {
            StatementErrorKind::TimedOut
        } else {
            StatementErrorKind::Rejected
        };
        Self {
            kind,
            sqlstate,
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self {
            kind: StatementErrorKind::ConnectionLost,
            sqlstate: None,
            message: message.into(),
        }
    }
}

/// The single database connection a run executes on.
#[async_trait]
pub trait SqlSession: Send {
    /// Executes one statement over the simple query protocol.
    async fn execute(&mut self, sql: &str) -> Result<QueryOutput, StatementError>;

    /// Replaces a connection left unusable by an interrupted statement.
    async fn reconnect(&mut self) -> Result<(), StatementError>;
}
