use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::comparator::{compare, Verdict, DEFAULT_EPSILON};
use crate::objects::{DbObject, ObjectKind};
use crate::session::{QueryOutput, SqlSession, StatementError, StatementErrorKind};
use crate::{Block, BlockError, Error, ExecutionPlan, Result};

/// Client-side slack on top of the server-side statement timeout.
const CLIENT_GRACE: Duration = Duration::from_secs(5);
const SAVEPOINT: &str = "docverify_block";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop at the first failing block; everything after it is skipped.
    #[default]
    Halt,
    /// Record the failure and keep going.
    Continue,
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "continue" => Ok(Self::Continue),
            other => Err(format!("unknown error policy `{}` (expected halt or continue)", other)),
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Halt => "halt",
            Self::Continue => "continue",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownMode {
    /// Run inside one transaction and roll it back at the end.
    #[default]
    Rollback,
    /// Autocommit every block and drop the objects they created at the end.
    Drop,
}

impl FromStr for TeardownMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rollback" => Ok(Self::Rollback),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown teardown mode `{}` (expected rollback or drop)", other)),
        }
    }
}

impl fmt::Display for TeardownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rollback => "rollback",
            Self::Drop => "drop",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub policy: ErrorPolicy,
    /// Per-block bound; zero disables it.
    pub timeout: Duration,
    pub teardown: TeardownMode,
    /// Numeric tolerance for blocks without their own `-- epsilon:`.
    pub epsilon: f64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            policy: ErrorPolicy::Halt,
            timeout: Duration::from_secs(30),
            teardown: TeardownMode::Rollback,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub block: usize,
    pub status: ExecutionStatus,
    pub output: Option<QueryOutput>,
    /// Set once the block succeeded and its output was compared.
    pub verdict: Option<Verdict>,
    pub error: Option<BlockError>,
    pub skip_reason: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    /// Compares `output` with the block's expectation. A mismatch is recorded
    /// as the block's error.
    pub fn succeeded(block: &Block, output: QueryOutput, default_epsilon: f64, elapsed_ms: u64) -> Self {
        let verdict = compare(&output, block.expectation.as_ref(), default_epsilon);
        let error = match &verdict {
            Verdict::Mismatch { diff } => Some(BlockError::Mismatch {
                block: block.index,
                line: block.line,
                diff: diff.clone(),
            }),
            _ => None,
        };
        Self {
            block: block.index,
            status: ExecutionStatus::Succeeded,
            output: Some(output),
            verdict: Some(verdict),
            error,
            skip_reason: None,
            elapsed_ms,
        }
    }

    fn skipped(block: usize, reason: String) -> Self {
        Self {
            block,
            status: ExecutionStatus::Skipped,
            output: None,
            verdict: None,
            error: None,
            skip_reason: Some(reason),
            elapsed_ms: 0,
        }
    }

    /// Failed to execute, or executed and did not match.
    pub fn is_failure(&self) -> bool {
        self.status == ExecutionStatus::Failed
            || self.verdict.as_ref().is_some_and(Verdict::is_mismatch)
    }
}

/// Everything the engine observed during one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub options: RunOptions,
    /// One entry per block, in plan order.
    pub results: Vec<ExecutionResult>,
    /// Objects defined by blocks that succeeded, in creation order.
    pub created: Vec<DbObject>,
    pub teardown_errors: Vec<String>,
    pub cancelled: bool,
}

enum Step {
    Done(std::result::Result<QueryOutput, StatementError>),
    ClientTimeout,
    Cancelled,
}

#[derive(Default)]
struct RunState {
    statuses: HashMap<usize, ExecutionStatus>,
    halted_by: Option<usize>,
    cancelled: bool,
    session_lost: bool,
    created: Vec<DbObject>,
}

/// Executes a plan over one session and always tears down what it created.
pub struct Verifier<S> {
    session: S,
    options: RunOptions,
}

impl<S: SqlSession> Verifier<S> {
    pub fn new(session: S, options: RunOptions) -> Self {
        Self { session, options }
    }

    pub fn into_session(self) -> S {
        self.session
    }

    /// Runs every block of `plan`. `shutdown` resolving cancels the run; teardown still happens.
    pub async fn run<F>(
        &mut self,
        blocks: &[Block],
        plan: &ExecutionPlan,
        shutdown: F,
    ) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tokio::pin!(shutdown);

        let steps = plan
            .order
            .iter()
            .map(|&index| {
                blocks.get(index).ok_or_else(|| {
                    Error::Other(anyhow::anyhow!("plan references unknown block {}", index))
                })
            })
            .collect::<Result<Vec<&Block>>>()?;

        tracing::info!(
            "Starting run {}: {} blocks, on-error={}, teardown={}, timeout={}s",
            run_id,
            plan.order.len(),
            self.options.policy,
            self.options.teardown,
            self.options.timeout.as_secs()
        );

        self.prepare().await?;

        let mut state = RunState::default();
        let mut results = Vec::with_capacity(plan.order.len());

        for (&index, block) in plan.order.iter().zip(steps) {
            if !state.cancelled && poll_shutdown(shutdown.as_mut()).await {
                tracing::warn!("Run {} cancelled before block {}", run_id, index);
                state.cancelled = true;
            }

            let result = match self.skip_reason(block, plan, &state) {
                Some(reason) => {
                    tracing::info!("Skipping block {} (line {}): {}", index, block.line, reason);
                    ExecutionResult::skipped(index, reason)
                }
                None => self.execute_block(block, shutdown.as_mut(), &mut state).await,
            };

            if result.is_failure() && self.options.policy == ErrorPolicy::Halt {
                state.halted_by.get_or_insert(index);
            }
            state.statuses.insert(index, result.status);
            results.push(result);
        }

        let teardown_errors = self.teardown(&state).await;
        let finished_at = Utc::now();

        tracing::info!(
            "Run {} finished in {}ms",
            run_id,
            (finished_at - started_at).num_milliseconds()
        );

        Ok(RunOutcome {
            run_id,
            started_at,
            finished_at,
            options: self.options.clone(),
            results,
            created: state.created,
            teardown_errors,
            cancelled: state.cancelled,
        })
    }

    async fn prepare(&mut self) -> Result<()> {
        let timeout_ms = self.options.timeout.as_millis();
        self.session
            .execute(&format!("SET statement_timeout = {}", timeout_ms))
            .await
            .map_err(|e| Error::Session(format!("failed to set statement timeout: {}", e)))?;

        if self.options.teardown == TeardownMode::Rollback {
            self.session
                .execute("BEGIN")
                .await
                .map_err(|e| Error::Session(format!("failed to open run transaction: {}", e)))?;
        }
        Ok(())
    }

    fn skip_reason(&self, block: &Block, plan: &ExecutionPlan, state: &RunState) -> Option<String> {
        if state.cancelled {
            return Some("run cancelled".to_string());
        }
        if state.session_lost {
            return Some("database session lost".to_string());
        }
        if let Some(failed) = state.halted_by {
            return Some(format!("run halted after block {} failed", failed));
        }
        if let Some(reason) = &block.skip {
            return Some(reason.clone());
        }
        if self.options.teardown == TeardownMode::Rollback && block.requires_autocommit() {
            return Some(
                "cannot run inside the verification transaction (use drop teardown)".to_string(),
            );
        }
        plan.dependencies_of(block.index)
            .iter()
            .find(|dep| state.statuses.get(dep) != Some(&ExecutionStatus::Succeeded))
            .map(|dep| format!("depends on block {} which did not succeed", dep))
    }

    async fn execute_block<F>(
        &mut self,
        block: &Block,
        shutdown: Pin<&mut F>,
        state: &mut RunState,
    ) -> ExecutionResult
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let rollback = self.options.teardown == TeardownMode::Rollback;
        let excerpt = block.excerpt();

        tracing::debug!("Executing block {} (line {}): {}", block.index, block.line, excerpt);

        if rollback {
            if let Err(e) = self.session.execute(&format!("SAVEPOINT {}", SAVEPOINT)).await {
                state.session_lost = true;
                return failed(block, started, execution_error(block, &excerpt, e));
            }
        }

        let fresh = if rollback {
            Vec::new()
        } else {
            self.not_yet_created(block).await
        };

        let step = self.run_statement(&block.sql, shutdown).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let error = match step {
            Step::Done(Ok(output)) => {
                if rollback {
                    if let Err(e) = self.session.execute(&format!("RELEASE SAVEPOINT {}", SAVEPOINT)).await {
                        state.session_lost = true;
                        return failed(block, started, execution_error(block, &excerpt, e));
                    }
                }
                tracing::info!(
                    "Block {} (line {}) succeeded: {} row(s) in {}ms",
                    block.index,
                    block.line,
                    output.rows.len(),
                    elapsed_ms
                );
                state.created.extend(fresh);
                let result = ExecutionResult::succeeded(block, output, self.options.epsilon, elapsed_ms);
                if let Some(error) = &result.error {
                    tracing::warn!("{}", error);
                }
                return result;
            }
            Step::Done(Err(e)) => {
                let kind = e.kind;
                if kind == StatementErrorKind::ConnectionLost {
                    state.session_lost = true;
                } else if rollback {
                    let undo = format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT);
                    if let Err(undo_err) = self.session.execute(&undo).await {
                        tracing::error!("Could not roll back block {}: {}", block.index, undo_err);
                        state.session_lost = true;
                    }
                }
                match kind {
                    StatementErrorKind::TimedOut => BlockError::Timeout {
                        block: block.index,
                        line: block.line,
                        timeout_ms: self.options.timeout.as_millis() as u64,
                        excerpt,
                    },
                    _ => execution_error(block, &excerpt, e),
                }
            }
            Step::ClientTimeout => {
                // The statement may still be running; the connection cannot be reused.
                state.session_lost = true;
                BlockError::Timeout {
                    block: block.index,
                    line: block.line,
                    timeout_ms: self.options.timeout.as_millis() as u64,
                    excerpt,
                }
            }
            Step::Cancelled => {
                state.cancelled = true;
                state.session_lost = true;
                BlockError::Cancelled {
                    block: block.index,
                    line: block.line,
                }
            }
        };

        tracing::warn!("{}", error);
        failed(block, started, error)
    }

    /// Objects `block` defines that do not exist yet. Only these are dropped
    /// at teardown; anything that was already there is left alone.
    async fn not_yet_created(&mut self, block: &Block) -> Vec<DbObject> {
        let mut fresh = Vec::new();
        for object in &block.defines {
            let Some(query) = existence_query(object) else {
                continue;
            };
            match self.session.execute(&query).await {
                Ok(output) if output.first_cell() == Some("t") => {
                    tracing::debug!("{} already exists, teardown will keep it", object);
                }
                Ok(_) => fresh.push(object.clone()),
                Err(e) => {
                    tracing::warn!("Could not check whether {} exists, teardown will keep it: {}", object, e);
                }
            }
        }
        fresh
    }

    async fn run_statement<F>(&mut self, sql: &str, shutdown: Pin<&mut F>) -> Step
    where
        F: Future<Output = ()>,
    {
        let limit = (!self.options.timeout.is_zero()).then(|| self.options.timeout + CLIENT_GRACE);
        let session = &mut self.session;
        let execute = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, session.execute(sql))
                    .await
                    .map_err(|_| ()),
                None => Ok(session.execute(sql).await),
            }
        };

        tokio::select! {
            biased;
            _ = shutdown => Step::Cancelled,
            result = execute => match result {
                Ok(result) => Step::Done(result),
                Err(()) => Step::ClientTimeout,
            },
        }
    }

    async fn teardown(&mut self, state: &RunState) -> Vec<String> {
        let mut errors = Vec::new();

        if state.session_lost {
            tracing::warn!("Reconnecting to tear down after losing the session");
            if let Err(e) = self.session.reconnect().await {
                errors.push(format!("reconnect for teardown failed: {}", e));
                return errors;
            }
        }

        let statements = match self.options.teardown {
            // A lost session took its transaction with it.
            TeardownMode::Rollback if state.session_lost => Vec::new(),
            TeardownMode::Rollback => vec!["ROLLBACK".to_string()],
            TeardownMode::Drop => drop_statements(&state.created),
        };

        for statement in statements {
            tracing::debug!("Teardown: {}", statement);
            if let Err(e) = self.session.execute(&statement).await {
                tracing::error!("Teardown statement failed: {}: {}", statement, e);
                errors.push(format!("{}: {}", statement, e));
            }
        }

        if let Err(e) = self.session.execute("RESET statement_timeout").await {
            tracing::debug!("Could not reset statement_timeout: {}", e);
        }

        errors
    }
}

/// `DROP` statements for `created`, newest first, each object once.
pub fn drop_statements(created: &[DbObject]) -> Vec<String> {
    let mut seen = Vec::new();
    let mut statements = Vec::new();
    for object in created.iter().rev() {
        if seen.contains(&object) {
            continue;
        }
        seen.push(object);
        match object.kind.drop_keyword() {
            Some(keyword) => statements.push(format!(
                "DROP {} IF EXISTS {} CASCADE",
                keyword, object.name
            )),
            None => tracing::warn!(
                "Cannot drop `{}`: declared without a kind, leaving it in place",
                object.name
            ),
        }
    }
    statements
}

fn existence_query(object: &DbObject) -> Option<String> {
    let literal = object.name.replace('\'', "''");
    match object.kind {
        ObjectKind::Declared => None,
        ObjectKind::Function | ObjectKind::Procedure => {
            Some(format!("SELECT to_regproc('{}') IS NOT NULL", literal))
        }
        _ => Some(format!("SELECT to_regclass('{}') IS NOT NULL", literal)),
    }
}

async fn poll_shutdown<F: Future<Output = ()>>(shutdown: Pin<&mut F>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown => true,
        _ = std::future::ready(()) => false,
    }
}

fn execution_error(block: &Block, excerpt: &str, e: StatementError) -> BlockError {
    BlockError::Execution {
        block: block.index,
        line: block.line,
        sqlstate: e.sqlstate,
        message: e.message,
        excerpt: excerpt.to_string(),
    }
}

fn failed(block: &Block, started: Instant, error: BlockError) -> ExecutionResult {
    ExecutionResult {
        block: block.index,
        status: ExecutionStatus::Failed,
        output: None,
        verdict: None,
        error: Some(error),
        skip_reason: None,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
