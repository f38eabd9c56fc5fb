//! Expected-result annotations carried in SQL line comments.
//!
//! ```sql
//! -- expect: rows >= 1
//! -- expect: columns precinct, parcel_count
//! -- expect-row: 101 | 42
//! -- epsilon: 1e-4
//! SELECT precinct, parcel_count FROM mvw_precinct ORDER BY precinct LIMIT 1;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sql;

static ANNOTATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(expect-row|expect|epsilon|depends|defines|verify)\s*:\s*(.*?)\s*$")
        .expect("annotation pattern is valid")
});

static ROWS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^rows\s*(=|>=|<=)?\s*(\d+)$").expect("row count pattern is valid")
});

pub type Cell = Option<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountOp {
    Exactly,
    AtLeast,
    AtMost,
}

impl CountOp {
    pub fn holds(&self, actual: usize, expected: usize) -> bool {
        match self {
            Self::Exactly => actual == expected,
            Self::AtLeast => actual >= expected,
            Self::AtMost => actual <= expected,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Exactly => "exactly",
            Self::AtLeast => "at least",
            Self::AtMost => "at most",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    RowCount { op: CountOp, count: usize },
    NonEmpty,
    Empty,
    Columns { names: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub checks: Vec<Check>,
    /// Literal rows, compared in order.
    pub rows: Vec<Vec<Cell>>,
    pub epsilon: Option<f64>,
}

impl Expectation {
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.rows.is_empty()
    }
}

/// Everything a block declares about itself through comments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    pub expectation: Option<Expectation>,
    pub depends: Vec<String>,
    pub defines: Vec<String>,
    pub skip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationError {
    /// Byte offset of the offending comment within the block.
    pub offset: usize,
    pub message: String,
}

pub fn parse_annotations(block_sql: &str) -> Result<Annotations, AnnotationError> {
    let mut annotations = Annotations::default();
    let mut expectation = Expectation::default();

    for (offset, comment) in sql::line_comments(block_sql) {
        let Some(caps) = ANNOTATION_RE.captures(comment) else {
            continue;
        };
        let key = caps[1].to_ascii_lowercase();
        let value = caps[2].trim();
        let fail = |message: String| AnnotationError { offset, message };

        match key.as_str() {
            "expect" => expectation.checks.push(parse_check(value).map_err(fail)?),
            "expect-row" => expectation.rows.push(parse_row(value)),
            "epsilon" => {
                let epsilon: f64 = value
                    .parse()
                    .map_err(|_| fail(format!("invalid epsilon `{}`", value)))?;
                if !epsilon.is_finite() || epsilon < 0.0 {
                    return Err(fail(format!("epsilon must be a non-negative number, got `{}`", value)));
                }
                expectation.epsilon = Some(epsilon);
            }
            "depends" => annotations.depends.extend(parse_names(value)),
            "defines" => annotations.defines.extend(parse_names(value)),
            "verify" => {
                let mut words = value.splitn(2, char::is_whitespace);
                match words.next().map(|w| w.to_ascii_lowercase()).as_deref() {
                    Some("skip") => {
                        let reason = words.next().map(str::trim).unwrap_or("");
                        annotations.skip = Some(if reason.is_empty() {
                            "marked skip".to_string()
                        } else {
                            reason.to_string()
                        });
                    }
                    _ => return Err(fail(format!("unknown verify directive `{}`", value))),
                }
            }
            _ => unreachable!("pattern only captures known keys"),
        }
    }

    if !expectation.is_empty() || expectation.epsilon.is_some() {
        annotations.expectation = Some(expectation);
    }
    Ok(annotations)
}

fn parse_check(value: &str) -> Result<Check, String> {
    let lowered = value.to_ascii_lowercase();
    match lowered.as_str() {
        "non-empty" | "nonempty" | "rows > 0" => return Ok(Check::NonEmpty),
        "empty" | "no rows" => return Ok(Check::Empty),
        _ => {}
    }

    if let Some(caps) = ROWS_RE.captures(value) {
        let op = match caps.get(1).map(|m| m.as_str()) {
            None | Some("=") => CountOp::Exactly,
            Some(">=") => CountOp::AtLeast,
            Some(_) => CountOp::AtMost,
        };
        let count = caps[2]
            .parse()
            .map_err(|_| format!("row count out of range in `{}`", value))?;
        return Ok(Check::RowCount { op, count });
    }

    if let Some(rest) = lowered.strip_prefix("columns") {
        let names: Vec<String> = rest
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Err("`columns` needs at least one column name".to_string());
        }
        return Ok(Check::Columns { names });
    }

    Err(format!("unrecognised expectation `{}`", value))
}

fn parse_row(value: &str) -> Vec<Cell> {
    value
        .split('|')
        .map(|cell| {
            let cell = cell.trim();
            if cell.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(cell.to_string())
            }
        })
        .collect()
}

fn parse_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(crate::objects::normalize_name)
        .filter(|n| !n.is_empty())
        .collect()
}
