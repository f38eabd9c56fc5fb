use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::expectation::{Cell, Check, Expectation};
use crate::session::QueryOutput;

pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Differences beyond this many are summarised in one line.
const MAX_DIFF_LINES: usize = 20;

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?").expect("number pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch { diff: Vec<String> },
    /// Ran without error but declared no expectation.
    Unverified,
}

impl Verdict {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "matched",
            Self::Mismatch { .. } => "mismatch",
            Self::Unverified => "unverified",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Piece<'a> {
    Number { value: f64, integer: bool, text: &'a str },
    Text(&'a str),
}

/// Compares captured output against the block's expectation.
pub fn compare(output: &QueryOutput, expectation: Option<&Expectation>, default_epsilon: f64) -> Verdict {
    let Some(expectation) = expectation.filter(|e| !e.is_empty()) else {
        return Verdict::Unverified;
    };
    let epsilon = expectation.epsilon.unwrap_or(default_epsilon);
    let row_count = output.rows.len();
    let mut diff = Vec::new();

    for check in &expectation.checks {
        match check {
            Check::RowCount { op, count } => {
                if !op.holds(row_count, *count) {
                    diff.push(format!(
                        "expected {} {} row(s), got {}",
                        op.describe(),
                        count,
                        row_count
                    ));
                }
            }
            Check::NonEmpty => {
                if row_count == 0 {
                    diff.push("expected at least one row, got none".to_string());
                }
            }
            Check::Empty => {
                if row_count > 0 {
                    diff.push(format!("expected no rows, got {}", row_count));
                }
            }
            Check::Columns { names } => {
                let actual: Vec<String> = output.columns.iter().map(|c| c.to_lowercase()).collect();
                if &actual != names {
                    if actual.is_empty() && row_count == 0 {
                        diff.push(format!(
                            "expected columns [{}], but no rows were returned to read them from",
                            names.join(", ")
                        ));
                    } else {
                        diff.push(format!(
                            "expected columns [{}], got [{}]",
                            names.join(", "),
                            actual.join(", ")
                        ));
                    }
                }
            }
        }
    }

    if !expectation.rows.is_empty() {
        diff_rows(&expectation.rows, output, epsilon, &mut diff);
    }

    if diff.is_empty() {
        Verdict::Match
    } else {
        if diff.len() > MAX_DIFF_LINES {
            let hidden = diff.len() - MAX_DIFF_LINES;
            diff.truncate(MAX_DIFF_LINES);
            diff.push(format!("... {} more difference(s)", hidden));
        }
        Verdict::Mismatch { diff }
    }
}

fn diff_rows(expected: &[Vec<Cell>], output: &QueryOutput, epsilon: f64, diff: &mut Vec<String>) {
    let actual = &output.rows;
    if expected.len() != actual.len() {
        diff.push(format!(
            "expected {} literal row(s), got {}",
            expected.len(),
            actual.len()
        ));
    }

    for (i, (want, got)) in expected.iter().zip(actual).enumerate() {
        let row = i + 1;
        if want.len() != got.len() {
            diff.push(format!(
                "row {}: expected {} column(s), got {}",
                row,
                want.len(),
                got.len()
            ));
            continue;
        }
        for (j, (w, g)) in want.iter().zip(got).enumerate() {
            if !cells_match(w.as_deref(), g.as_deref(), epsilon) {
                let column = output
                    .columns
                    .get(j)
                    .map(|name| format!("{} ({})", j + 1, name))
                    .unwrap_or_else(|| (j + 1).to_string());
                diff.push(format!(
                    "row {}, column {}: expected `{}`, got `{}`",
                    row,
                    column,
                    render_cell(w),
                    render_cell(g)
                ));
            }
        }
    }

    for (i, row) in expected.iter().enumerate().skip(actual.len()) {
        diff.push(format!("row {}: missing, expected `{}`", i + 1, render_row(row)));
    }
    for (i, row) in actual.iter().enumerate().skip(expected.len()) {
        diff.push(format!("row {}: unexpected `{}`", i + 1, render_row(row)));
    }
}

/// Compares two cells, letting embedded numbers drift by `epsilon`
/// (relative to their magnitude once it exceeds 1). Integers compare exactly.
pub fn cells_match(expected: Option<&str>, actual: Option<&str>, epsilon: f64) -> bool {
    let (expected, actual) = match (expected, actual) {
        (None, None) => return true,
        (Some(e), Some(a)) => (e.trim(), a.trim()),
        _ => return false,
    };
    if expected == actual {
        return true;
    }

    let want = pieces(expected);
    let got = pieces(actual);
    want.len() == got.len()
        && want.iter().zip(&got).all(|(w, g)| match (w, g) {
            (Piece::Text(a), Piece::Text(b)) => a == b,
            (
                Piece::Number {
                    integer: true,
                    text: ta,
                    ..
                },
                Piece::Number {
                    integer: true,
                    text: tb,
                    ..
                },
            ) => integers_equal(ta, tb),
            (Piece::Number { value: a, .. }, Piece::Number { value: b, .. }) => {
                (a - b).abs() <= epsilon * 1f64.max(a.abs()).max(b.abs())
            }
            _ => false,
        })
}

/// Exact comparison; `f64` would conflate integers beyond 2^53.
fn integers_equal(a: &str, b: &str) -> bool {
    match (a.parse::<i128>(), b.parse::<i128>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => canonical_integer(a) == canonical_integer(b),
    }
}

fn canonical_integer(text: &str) -> (bool, &str) {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, text.trim_start_matches('+')),
    };
    let digits = digits.trim_start_matches('0');
    (negative && !digits.is_empty(), digits)
}

fn pieces(text: &str) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    let mut last = 0;
    for m in NUMBER_RE.find_iter(text) {
        if m.start() > last {
            out.push(Piece::Text(&text[last..m.start()]));
        }
        let raw = m.as_str();
        match raw.parse::<f64>() {
            Ok(value) => out.push(Piece::Number {
                value,
                integer: !raw.contains(&['.', 'e', 'E'][..]),
                text: raw,
            }),
            Err(_) => out.push(Piece::Text(raw)),
        }
        last = m.end();
    }
    if last < text.len() {
        out.push(Piece::Text(&text[last..]));
    }
    out
}

fn render_cell(cell: &Cell) -> &str {
    cell.as_deref().unwrap_or("NULL")
}

fn render_row(row: &[Cell]) -> String {
    row.iter().map(render_cell).collect::<Vec<_>>().join(" | ")
}
