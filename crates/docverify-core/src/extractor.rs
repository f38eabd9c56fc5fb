use markdown::mdast::{Code, Node};
use markdown::{to_mdast, ParseOptions};

use crate::{sql, Block, Error, Result};

/// Info-string words that mark a fence as SQL.
const SQL_LANGUAGES: &[&str] = &["sql", "pgsql", "postgres", "postgresql", "plpgsql", "psql"];

/// A fenced code block as it appears in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    /// 1-based line of the opening fence.
    pub open_line: usize,
    pub info: String,
    /// The content lines, with any blockquote or list indentation removed.
    pub body: String,
}

impl Fence {
    pub fn is_sql(&self) -> bool {
        self.info
            .split_whitespace()
            .next()
            .map(|lang| {
                let lang = lang.trim_start_matches('{').trim_start_matches('.');
                SQL_LANGUAGES.iter().any(|l| lang.eq_ignore_ascii_case(l))
            })
            .unwrap_or(false)
    }
}

/// Finds every fenced code block that names a language, including fences
/// nested in blockquotes and list items. Indented code blocks are prose
/// examples and never count.
pub fn scan_fences(doc: &str) -> Result<Vec<Fence>> {
    let root = to_mdast(doc, &ParseOptions::gfm()).map_err(|e| Error::Parse {
        line: 1,
        message: format!("invalid markdown: {}", e),
    })?;

    let mut fences = Vec::new();
    collect_fences(doc, &root, &mut fences)?;
    Ok(fences)
}

fn collect_fences(doc: &str, node: &Node, fences: &mut Vec<Fence>) -> Result<()> {
    if let Node::Code(code) = node {
        if let Some(fence) = fence_of(doc, code)? {
            fences.push(fence);
        }
        return Ok(());
    }
    for child in node.children().into_iter().flatten() {
        collect_fences(doc, child, fences)?;
    }
    Ok(())
}

fn fence_of(doc: &str, code: &Code) -> Result<Option<Fence>> {
    let (Some(lang), Some(position)) = (&code.lang, &code.position) else {
        return Ok(None);
    };
    let open_line = position.start.line;
    let source = doc
        .get(position.start.offset..position.end.offset)
        .unwrap_or_default();

    let Some((marker, len)) = fence_marker(source.lines().next().unwrap_or_default()) else {
        return Ok(None);
    };
    if !is_closed(source, marker, len) {
        return Err(Error::Parse {
            line: open_line,
            message: format!("unterminated code fence `{}`", marker.to_string().repeat(len)),
        });
    }

    let info = match &code.meta {
        Some(meta) => format!("{} {}", lang, meta),
        None => lang.clone(),
    };
    let body = if code.value.is_empty() {
        String::new()
    } else {
        format!("{}\n", code.value)
    };
    Ok(Some(Fence {
        open_line,
        info,
        body,
    }))
}

/// Marker character and run length of a fence line, after any container prefix.
fn fence_marker(line: &str) -> Option<(char, usize)> {
    let trimmed = strip_container(line);
    let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|&c| c == marker).count();
    (len >= 3).then_some((marker, len))
}

/// An unclosed fence runs to the end of its container, so its last source
/// line is content rather than a closing run of at least `len` markers.
fn is_closed(source: &str, marker: char, len: usize) -> bool {
    let Some((_, last)) = source.trim_end_matches(&['\n', '\r'][..]).rsplit_once('\n') else {
        return false;
    };
    let last = strip_container(last).trim_end();
    !last.is_empty() && last.chars().all(|c| c == marker) && last.chars().count() >= len
}

fn strip_container(line: &str) -> &str {
    line.trim_start_matches(|c: char| c == '>' || c.is_whitespace())
}

/// Extracts executable blocks from a Markdown document, in document order.
pub fn extract(doc: &str) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    let mut fence_index = 0;

    for fence in scan_fences(doc)?.into_iter().filter(Fence::is_sql) {
        let body = fence.body.as_str();
        let ranges = sql::split_statements(body).map_err(|e| Error::Parse {
            line: fence.open_line + 1 + body[..e.offset].matches('\n').count(),
            message: e.to_string(),
        })?;
        if ranges.is_empty() {
            continue;
        }

        for (part, range) in ranges.into_iter().enumerate() {
            let line = fence.open_line + 1 + body[..range.start].matches('\n').count();
            let block = Block::parse(blocks.len(), line, fence_index, part, &body[range])?;
            blocks.push(block);
        }
        fence_index += 1;
    }

    tracing::debug!("Extracted {} blocks from {} SQL fences", blocks.len(), fence_index);
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_only_sql_fences() {
        let doc = "# Intro\n\n```bash\npsql -d gis\n```\n\n```sql\nSELECT 1;\n```\n\n~~~SQL\nSELECT 2;\n~~~\n";
        let blocks = extract(doc).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].sql, "SELECT 1;\n");
        assert_eq!(blocks[0].line, 8);
        assert_eq!(blocks[1].sql, "SELECT 2;\n");
        assert_eq!(blocks[1].fence, 1);
    }

    #[test]
    fn test_nested_fences_stay_inside_outer_fence() {
        let doc = "````markdown\nUse:\n```sql\nSELECT 'not run';\n```\n````\n\n```sql\nSELECT 'run';\n```\n";
        let fences = scan_fences(doc).unwrap();
        assert_eq!(fences.len(), 2);
        assert_eq!(fences[0].info, "markdown");
        assert!(fences[0].body.contains("```sql"));

        let blocks = extract(doc).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].sql, "SELECT 'run';\n");
    }

    #[test]
    fn test_definition_and_usage_become_related_blocks() {
        let doc = "```sql\nCREATE VIEW v AS SELECT 1 AS x;\n\nSELECT x FROM v;\n```\n";
        let blocks = extract(doc).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].is_related(&blocks[1]));
        assert_eq!(blocks[1].line, 4);
        assert_eq!(blocks[1].part, 1);
    }

    #[test]
    fn test_blocks_round_trip_fence_bodies() {
        let doc = "Text\n\n```sql\n-- header\nCREATE TABLE t (id int);\nINSERT INTO t VALUES (1); -- expect: rows 0\n/* tail */\n```\n";
        let fences = scan_fences(doc).unwrap();
        let blocks = extract(doc).unwrap();
        let rebuilt: String = blocks.iter().map(|b| b.sql.as_str()).collect();
        assert_eq!(rebuilt, fences[0].body);
    }

    #[test]
    fn test_unterminated_fence_is_a_parse_error() {
        let err = extract("intro\n```sql\nSELECT 1;\n").unwrap_err();
        match err {
            Error::Parse { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("unterminated"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unterminated_literal_points_at_source_line() {
        let err = extract("```sql\nSELECT 1;\nSELECT 'open;\n```\n").unwrap_err();
        match err {
            Error::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fence_inside_blockquote_is_extracted() {
        let doc = "Note:\n\n> ```sql\n> SELECT 1;\n> SELECT 2;\n> ```\n";
        let blocks = extract(doc).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].sql, "SELECT 1;\n");
        assert_eq!(blocks[0].line, 4);
        assert_eq!(blocks[1].line, 5);
    }

    #[test]
    fn test_fence_inside_list_item_is_extracted() {
        let doc = "1. Count the parcels:\n\n   ```sql\n   SELECT count(*) FROM parcels;\n   ```\n";
        let blocks = extract(doc).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].sql, "SELECT count(*) FROM parcels;\n");
        assert_eq!(blocks[0].line, 4);
    }

    #[test]
    fn test_indented_code_block_is_not_a_fence() {
        let doc = "Example of markdown:\n\n    ```sql\n    SELECT 'inside indented code block';\n    ```\n";
        assert!(scan_fences(doc).unwrap().is_empty());
        assert!(extract(doc).unwrap().is_empty());
    }

    #[test]
    fn test_short_closing_run_leaves_fence_open() {
        let err = extract("````sql\nSELECT 1;\n```\n").unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn test_blank_fence_yields_nothing() {
        assert!(extract("```sql\n\n```\n").unwrap().is_empty());
    }
}
