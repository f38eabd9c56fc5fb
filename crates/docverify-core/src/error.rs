use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors: none of these leave a plan that can be executed safely.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Dependency cycle detected between blocks {}", join_indices(.blocks))]
    DependencyCycle { blocks: Vec<usize> },

    #[error("Session error: {0}")]
    Session(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-block failures. These never abort a run on their own; the error policy decides.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockError {
    #[error("block {block} (line {line}): statement rejected{}: {message}", sqlstate_suffix(.sqlstate))]
    Execution {
        block: usize,
        line: usize,
        sqlstate: Option<String>,
        message: String,
        excerpt: String,
    },

    #[error("block {block} (line {line}): timed out after {timeout_ms}ms")]
    Timeout {
        block: usize,
        line: usize,
        timeout_ms: u64,
        excerpt: String,
    },

    #[error("block {block} (line {line}): output does not match expectation ({} difference(s))", .diff.len())]
    Mismatch {
        block: usize,
        line: usize,
        diff: Vec<String>,
    },

    #[error("block {block} (line {line}): cancelled while executing")]
    Cancelled { block: usize, line: usize },
}

impl BlockError {
    pub fn block(&self) -> usize {
        match self {
            Self::Execution { block, .. }
            | Self::Timeout { block, .. }
            | Self::Mismatch { block, .. }
            | Self::Cancelled { block, .. } => *block,
        }
    }
}

fn join_indices(blocks: &[usize]) -> String {
    blocks
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn sqlstate_suffix(sqlstate: &Option<String>) -> String {
    sqlstate
        .as_ref()
        .map(|code| format!(" [{}]", code))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_blocks() {
        let err = Error::DependencyCycle {
            blocks: vec![1, 4, 7],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected between blocks 1, 4, 7"
        );
    }

    #[test]
    fn test_execution_error_carries_sqlstate() {
        let err = BlockError::Execution {
            block: 3,
            line: 42,
            sqlstate: Some("42P01".to_string()),
            message: "relation \"mvw_precinct\" does not exist".to_string(),
            excerpt: "SELECT * FROM mvw_precinct".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "block 3 (line 42): statement rejected [42P01]: relation \"mvw_precinct\" does not exist"
        );
        assert_eq!(err.block(), 3);
    }
}
