use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

use crate::comparator::Verdict;
use crate::engine::{ErrorPolicy, ExecutionStatus, RunOutcome, TeardownMode};
use crate::{Block, BlockError, BlockKind, ExecutionPlan};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
/// Parse, link, configuration or connection failure: nothing was verified.
pub const EXIT_FATAL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOutcome {
    Matched,
    Unverified,
    Mismatch,
    Failed,
    Skipped,
}

impl BlockOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Matched => "MATCH",
            Self::Unverified => "UNVERIFIED",
            Self::Mismatch => "MISMATCH",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReport {
    pub index: usize,
    pub line: usize,
    pub fence: usize,
    pub kind: BlockKind,
    pub excerpt: String,
    pub outcome: BlockOutcome,
    pub status: ExecutionStatus,
    pub verdict: Option<Verdict>,
    pub error: Option<BlockError>,
    pub skip_reason: Option<String>,
    pub rows: Option<usize>,
    pub depends_on: Vec<usize>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    /// Matched plus unverified.
    pub passed: usize,
    pub matched: usize,
    pub unverified: usize,
    pub mismatched: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub document: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub policy: ErrorPolicy,
    pub teardown: TeardownMode,
    /// Block indices in execution order.
    pub order: Vec<usize>,
    pub reordered: bool,
    pub cancelled: bool,
    /// One entry per block, in document order.
    pub blocks: Vec<BlockReport>,
    pub teardown_errors: Vec<String>,
    pub summary: Summary,
}

impl Report {
    pub fn build(
        document: &str,
        blocks: &[Block],
        plan: &ExecutionPlan,
        outcome: &RunOutcome,
    ) -> Self {
        let mut reports: Vec<BlockReport> = outcome
            .results
            .iter()
            .filter_map(|result| {
                let block = blocks.get(result.block)?;
                let outcome = match (&result.status, &result.verdict) {
                    (ExecutionStatus::Failed, _) => BlockOutcome::Failed,
                    (ExecutionStatus::Skipped, _) => BlockOutcome::Skipped,
                    (ExecutionStatus::Succeeded, Some(Verdict::Mismatch { .. })) => BlockOutcome::Mismatch,
                    (ExecutionStatus::Succeeded, Some(Verdict::Match)) => BlockOutcome::Matched,
                    (ExecutionStatus::Succeeded, _) => BlockOutcome::Unverified,
                };

                Some(BlockReport {
                    index: block.index,
                    line: block.line,
                    fence: block.fence,
                    kind: block.kind,
                    excerpt: block.excerpt(),
                    outcome,
                    status: result.status,
                    verdict: result.verdict.clone(),
                    error: result.error.clone(),
                    skip_reason: result.skip_reason.clone(),
                    rows: result.output.as_ref().map(|o| o.rows.len()),
                    depends_on: plan.dependencies_of(block.index).to_vec(),
                    elapsed_ms: result.elapsed_ms,
                })
            })
            .collect();
        reports.sort_by_key(|r| r.index);

        let mut summary = Summary {
            total: reports.len(),
            ..Default::default()
        };
        for report in &reports {
            match report.outcome {
                BlockOutcome::Matched => summary.matched += 1,
                BlockOutcome::Unverified => summary.unverified += 1,
                BlockOutcome::Mismatch => summary.mismatched += 1,
                BlockOutcome::Failed => summary.failed += 1,
                BlockOutcome::Skipped => summary.skipped += 1,
            }
        }
        summary.passed = summary.matched + summary.unverified;

        Self {
            document: document.to_string(),
            run_id: outcome.run_id,
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            policy: outcome.options.policy,
            teardown: outcome.options.teardown,
            order: plan.order.clone(),
            reordered: plan.is_reordered(),
            cancelled: outcome.cancelled,
            blocks: reports,
            teardown_errors: outcome.teardown_errors.clone(),
            summary,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.summary.mismatched == 0
            && self.summary.failed == 0
            && self.teardown_errors.is_empty()
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            EXIT_OK
        } else {
            EXIT_FAILURE
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable report. Contains no timings or ids, so two runs over
    /// the same document and database render identically.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Verifying {}", self.document);
        let _ = writeln!(
            out,
            "Plan: {}{}",
            join(&self.order),
            if self.reordered { " (reordered)" } else { "" }
        );
        let _ = writeln!(out, "Policy: on-error={}, teardown={}", self.policy, self.teardown);
        out.push('\n');

        for block in &self.blocks {
            let _ = writeln!(
                out,
                "  {:<10} block {:>3}  line {:>4}  {:<7} {}",
                block.outcome.label(),
                block.index,
                block.line,
                block.kind.as_str(),
                block.excerpt
            );
            for detail in details(block) {
                let _ = writeln!(out, "             {}", detail);
            }
        }

        if !self.teardown_errors.is_empty() {
            out.push_str("\nTeardown errors:\n");
            for error in &self.teardown_errors {
                let _ = writeln!(out, "  {}", error);
            }
        }

        let s = &self.summary;
        let _ = writeln!(
            out,
            "\nSummary: {} blocks, {} passed ({} matched, {} unverified), {} mismatched, {} failed, {} skipped",
            s.total, s.passed, s.matched, s.unverified, s.mismatched, s.failed, s.skipped
        );
        let verdict = if self.cancelled {
            "CANCELLED"
        } else if self.is_success() {
            "PASSED"
        } else {
            "FAILED"
        };
        let _ = writeln!(out, "Result: {}", verdict);
        out
    }
}

fn details(block: &BlockReport) -> Vec<String> {
    match (&block.error, &block.skip_reason) {
        (Some(BlockError::Mismatch { diff, .. }), _) => diff.clone(),
        (Some(BlockError::Execution { sqlstate, message, .. }), _) => vec![match sqlstate {
            Some(code) => format!("[{}] {}", code, message),
            None => message.clone(),
        }],
        (Some(BlockError::Timeout { timeout_ms, .. }), _) => {
            vec![format!("timed out after {}ms", timeout_ms)]
        }
        (Some(BlockError::Cancelled { .. }), _) => vec!["cancelled while executing".to_string()],
        (None, Some(reason)) => vec![format!("skipped: {}", reason)],
        (None, None) => Vec::new(),
    }
}

fn join(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::DEFAULT_EPSILON;
    use crate::engine::{ExecutionResult, RunOptions};
    use crate::session::QueryOutput;

    fn block(index: usize, sql: &str) -> Block {
        Block::parse(index, index * 5 + 1, index, 0, sql).unwrap()
    }

    fn succeeded(block: &Block, rows: usize) -> ExecutionResult {
        let output = QueryOutput {
            columns: vec!["n".to_string()],
            rows: (0..rows).map(|i| vec![Some(i.to_string())]).collect(),
            rows_affected: rows as u64,
        };
        ExecutionResult::succeeded(block, output, DEFAULT_EPSILON, 3)
    }

    fn outcome(results: Vec<ExecutionResult>) -> RunOutcome {
        RunOutcome {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            options: RunOptions::default(),
            results,
            created: Vec::new(),
            teardown_errors: Vec::new(),
            cancelled: false,
        }
    }

    #[test]
    fn test_passing_run_exits_zero() {
        let blocks = vec![
            block(0, "-- expect: rows 2\nSELECT n FROM t;"),
            block(1, "SELECT 1;"),
        ];
        let plan = ExecutionPlan::document_order(&blocks);
        let report = Report::build(
            "README.md",
            &blocks,
            &plan,
            &outcome(vec![succeeded(&blocks[0], 2), succeeded(&blocks[1], 1)]),
        );
        assert_eq!(report.summary.matched, 1);
        assert_eq!(report.summary.unverified, 1);
        assert_eq!(report.summary.passed, 2);
        assert_eq!(report.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_mismatch_becomes_block_error() {
        let blocks = vec![block(0, "-- expect: rows 3\nSELECT n FROM t;")];
        let plan = ExecutionPlan::document_order(&blocks);
        let report = Report::build(
            "README.md",
            &blocks,
            &plan,
            &outcome(vec![succeeded(&blocks[0], 2)]),
        );
        assert_eq!(report.blocks[0].outcome, BlockOutcome::Mismatch);
        assert!(matches!(
            report.blocks[0].error,
            Some(BlockError::Mismatch { block: 0, line: 1, .. })
        ));
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        assert!(report.render_text().contains("expected exactly 3 row(s), got 2"));
    }

    #[test]
    fn test_text_is_deterministic_across_runs() {
        let blocks = vec![block(0, "SELECT 1;")];
        let plan = ExecutionPlan::document_order(&blocks);
        let first = Report::build("doc.md", &blocks, &plan, &outcome(vec![succeeded(&blocks[0], 1)]));
        let mut later = succeeded(&blocks[0], 1);
        later.elapsed_ms = 900;
        let second = Report::build("doc.md", &blocks, &plan, &outcome(vec![later]));
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.render_text(), second.render_text());
    }

    #[test]
    fn test_cancelled_run_fails() {
        let blocks = vec![block(0, "SELECT 1;")];
        let plan = ExecutionPlan::document_order(&blocks);
        let mut run = outcome(vec![ExecutionResult {
            block: 0,
            status: ExecutionStatus::Skipped,
            output: None,
            verdict: None,
            error: None,
            skip_reason: Some("run cancelled".to_string()),
            elapsed_ms: 0,
        }]);
        run.cancelled = true;
        let report = Report::build("doc.md", &blocks, &plan, &run);
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        assert!(report.render_text().contains("Result: CANCELLED"));
    }

    #[test]
    fn test_json_report_includes_timings() {
        let blocks = vec![block(0, "SELECT 1;")];
        let plan = ExecutionPlan::document_order(&blocks);
        let report = Report::build("doc.md", &blocks, &plan, &outcome(vec![succeeded(&blocks[0], 1)]));
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["blocks"][0]["elapsed_ms"], 3);
        assert_eq!(json["blocks"][0]["outcome"], "unverified");
        assert_eq!(json["summary"]["total"], 1);
    }
}
