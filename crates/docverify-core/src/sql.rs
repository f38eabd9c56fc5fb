//! Minimal PostgreSQL lexing: enough to find statement boundaries, comments and
//! literals without understanding the grammar.

use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Code,
    LineComment,
    BlockComment,
    StringLiteral,
    QuotedIdent,
    DollarQuoted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub kind: SpanKind,
    pub range: Range<usize>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unterminated {what} starting at byte {offset}")]
pub struct LexError {
    pub what: &'static str,
    pub offset: usize,
}

/// Splits `sql` into contiguous spans covering the whole input.
///
/// All delimiters are ASCII, so byte offsets always land on char boundaries.
pub fn tokenize(sql: &str) -> Result<Vec<Span>, LexError> {
    let bytes = sql.as_bytes();
    let mut spans = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let next = bytes.get(i + 1).copied();
        let special = match bytes[i] {
            b'-' if next == Some(b'-') => Some((SpanKind::LineComment, line_end(bytes, i))),
            b'/' if next == Some(b'*') => Some((SpanKind::BlockComment, block_comment_end(bytes, i)?)),
            b'\'' => Some((
                SpanKind::StringLiteral,
                quoted_end(bytes, i, b'\'', is_escape_string(bytes, i), "string literal")?,
            )),
            b'"' => Some((
                SpanKind::QuotedIdent,
                quoted_end(bytes, i, b'"', false, "quoted identifier")?,
            )),
            b'$' if i == 0 || !is_ident_byte(bytes[i - 1]) => match dollar_tag(bytes, i) {
                Some(tag_len) => {
                    let tag = &sql[i..i + tag_len];
                    let close = sql[i + tag_len..].find(tag).ok_or(LexError {
                        what: "dollar-quoted string",
                        offset: i,
                    })?;
                    Some((SpanKind::DollarQuoted, i + tag_len + close + tag_len))
                }
                None => None,
            },
            _ => None,
        };

        match special {
            Some((kind, end)) => {
                if code_start < i {
                    spans.push(Span {
                        kind: SpanKind::Code,
                        range: code_start..i,
                    });
                }
                spans.push(Span { kind, range: i..end });
                i = end;
                code_start = end;
            }
            None => i += 1,
        }
    }

    if code_start < bytes.len() {
        spans.push(Span {
            kind: SpanKind::Code,
            range: code_start..bytes.len(),
        });
    }

    Ok(spans)
}

/// Splits `sql` into statement slices whose concatenation is exactly `sql`.
///
/// A statement ends after its terminating `;` plus the rest of that line when
/// the rest is only blanks or a `--` comment. Slices without any code are
/// folded into a neighbour; input without code yields no slices.
pub fn split_statements(sql: &str) -> Result<Vec<Range<usize>>, LexError> {
    let spans = tokenize(sql)?;
    let bytes = sql.as_bytes();

    let mut cuts = Vec::new();
    for span in spans.iter().filter(|s| s.kind == SpanKind::Code) {
        for (offset, _) in sql[span.range.clone()].match_indices(';') {
            let cut = statement_tail_end(bytes, span.range.start + offset + 1);
            if cuts.last().map_or(true, |&last| cut > last) {
                cuts.push(cut);
            }
        }
    }

    let mut segments = Vec::new();
    let mut start = 0;
    for cut in cuts {
        segments.push(start..cut);
        start = cut;
    }
    if start < sql.len() {
        segments.push(start..sql.len());
    }

    let mut merged: Vec<Range<usize>> = Vec::new();
    let mut pending_start: Option<usize> = None;
    for segment in segments {
        if has_code(sql, &spans, &segment) {
            let start = pending_start.take().unwrap_or(segment.start);
            merged.push(start..segment.end);
        } else if let Some(last) = merged.last_mut() {
            last.end = segment.end;
        } else {
            pending_start.get_or_insert(segment.start);
        }
    }

    Ok(merged)
}

/// Returns the text with comments and literals blanked out, keeping quoted
/// identifiers and the bodies of dollar-quoted strings (function bodies are
/// scanned as code).
pub fn mask(sql: &str) -> String {
    let spans = match tokenize(sql) {
        Ok(spans) => spans,
        Err(_) => return sql.to_string(),
    };

    let mut out = String::with_capacity(sql.len());
    for span in spans {
        let text = &sql[span.range.clone()];
        match span.kind {
            SpanKind::Code | SpanKind::QuotedIdent => out.push_str(text),
            SpanKind::DollarQuoted => {
                let tag_len = dollar_tag(text.as_bytes(), 0).unwrap_or(0);
                out.push(' ');
                out.push_str(&text[tag_len..text.len() - tag_len]);
                out.push(' ');
            }
            SpanKind::LineComment | SpanKind::BlockComment | SpanKind::StringLiteral => {
                out.push(' ')
            }
        }
    }
    out
}

/// Yields `(byte offset, text after "--")` for every line comment.
pub fn line_comments(sql: &str) -> Vec<(usize, &str)> {
    match tokenize(sql) {
        Ok(spans) => spans
            .into_iter()
            .filter(|s| s.kind == SpanKind::LineComment)
            .map(|s| (s.range.start, &sql[s.range.start + 2..s.range.end]))
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn has_code(sql: &str, spans: &[Span], segment: &Range<usize>) -> bool {
    spans.iter().any(|span| {
        let start = span.range.start.max(segment.start);
        let end = span.range.end.min(segment.end);
        if start >= end {
            return false;
        }
        match span.kind {
            SpanKind::Code => !sql[start..end].trim().is_empty(),
            SpanKind::StringLiteral | SpanKind::QuotedIdent | SpanKind::DollarQuoted => true,
            SpanKind::LineComment | SpanKind::BlockComment => false,
        }
    })
}

fn statement_tail_end(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
        i += 1;
    }
    if bytes.get(i) == Some(&b'-') && bytes.get(i + 1) == Some(&b'-') {
        i = line_end(bytes, i);
    }
    if bytes.get(i) == Some(&b'\r') && bytes.get(i + 1) == Some(&b'\n') {
        return i + 2;
    }
    if bytes.get(i) == Some(&b'\n') {
        return i + 1;
    }
    i
}

fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| from + p)
}

fn block_comment_end(bytes: &[u8], from: usize) -> Result<usize, LexError> {
    // Postgres block comments nest.
    let mut depth = 1;
    let mut j = from + 2;
    while j + 1 < bytes.len() {
        match (bytes[j], bytes[j + 1]) {
            (b'/', b'*') => {
                depth += 1;
                j += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                j += 2;
                if depth == 0 {
                    return Ok(j);
                }
            }
            _ => j += 1,
        }
    }
    Err(LexError {
        what: "block comment",
        offset: from,
    })
}

fn quoted_end(
    bytes: &[u8],
    from: usize,
    quote: u8,
    backslash_escapes: bool,
    what: &'static str,
) -> Result<usize, LexError> {
    let mut j = from + 1;
    while j < bytes.len() {
        if backslash_escapes && bytes[j] == b'\\' {
            j += 2;
            continue;
        }
        if bytes[j] == quote {
            if bytes.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return Ok(j + 1);
        }
        j += 1;
    }
    Err(LexError { what, offset: from })
}

fn is_escape_string(bytes: &[u8], quote_at: usize) -> bool {
    quote_at > 0
        && matches!(bytes[quote_at - 1], b'e' | b'E')
        && (quote_at < 2 || !is_ident_byte(bytes[quote_at - 2]))
}

/// Length of a `$tag$` opener at `at`, if there is one. `$1` is a parameter.
fn dollar_tag(bytes: &[u8], at: usize) -> Option<usize> {
    let mut j = at + 1;
    match bytes.get(j) {
        Some(b'$') => return Some(2),
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' => {}
        _ => return None,
    }
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }
    (bytes.get(j) == Some(&b'$')).then_some(j + 1 - at)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pieces(sql: &str) -> Vec<&str> {
        split_statements(sql)
            .unwrap()
            .into_iter()
            .map(|r| &sql[r])
            .collect()
    }

    #[test]
    fn test_split_keeps_trailing_comment_with_statement() {
        let sql = "CREATE VIEW v AS SELECT 1;\nSELECT * FROM v; -- expect: rows 1\n";
        assert_eq!(
            pieces(sql),
            vec!["CREATE VIEW v AS SELECT 1;\n", "SELECT * FROM v; -- expect: rows 1\n"]
        );
    }

    #[test]
    fn test_split_ignores_semicolons_in_literals_and_bodies() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $body$ SELECT 1; $body$ LANGUAGE sql;\n\
                   SELECT 'a;b', \"odd;name\" FROM t;\n";
        let parts = pieces(sql);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with("LANGUAGE sql;\n"));
        assert_eq!(parts.concat(), sql);
    }

    #[test]
    fn test_leading_comments_attach_to_next_statement() {
        let sql = "-- expect: rows 2\nSELECT 1;\n-- expect: empty\nSELECT 2;\n-- trailing note\n";
        let parts = pieces(sql);
        assert_eq!(parts.len(), 2);
        assert!(parts[1].starts_with("-- expect: empty"));
        assert!(parts[1].ends_with("-- trailing note\n"));
        assert_eq!(parts.concat(), sql);
    }

    #[test]
    fn test_statement_without_terminator() {
        assert_eq!(pieces("SELECT 1\n"), vec!["SELECT 1\n"]);
        assert!(pieces("  \n-- only a comment\n").is_empty());
    }

    #[test]
    fn test_unterminated_literal_is_an_error() {
        let err = tokenize("SELECT 'oops").unwrap_err();
        assert_eq!(err.what, "string literal");
        assert!(tokenize("SELECT $$ body").is_err());
        assert!(tokenize("/* /* nested */").is_err());
    }

    #[test]
    fn test_escape_strings_and_parameters() {
        let spans = tokenize(r"SELECT E'it\'s', $1").unwrap();
        assert!(spans
            .iter()
            .any(|s| s.kind == SpanKind::StringLiteral && s.range == (8..15)));
        assert!(!spans.iter().any(|s| s.kind == SpanKind::DollarQuoted));
    }

    #[test]
    fn test_mask_blanks_comments_and_strings() {
        let masked = mask("SELECT 'from x' -- from y\nFROM parcels");
        assert!(!masked.contains("from x"));
        assert!(!masked.contains("from y"));
        assert!(masked.contains("FROM parcels"));

        let body = mask("AS $$ SELECT * FROM mvw_precinct $$");
        assert!(body.contains("FROM mvw_precinct"));
    }

    #[test]
    fn test_line_comments() {
        let comments = line_comments("SELECT 1; -- expect: rows 1\n-- note");
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].1, " expect: rows 1");
        assert_eq!(comments[1].1, " note");
    }
}
