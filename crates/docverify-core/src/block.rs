use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::expectation::{self, Expectation};
use crate::objects::{self, DbObject, ObjectKind};
use crate::{sql, Error, Result};

/// Statements Postgres refuses inside a transaction block, plus transaction
/// control that would end the run's transaction early.
static AUTOCOMMIT_ONLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)^\s*(
            vacuum\b
          | (create|drop)\s+(unique\s+)?index\s+concurrently\b
          | reindex\b.*\bconcurrently\b
          | (create|drop)\s+(database|tablespace)\b
          | alter\s+system\b
          | (begin|start\s+transaction|commit|end|rollback|abort)\b
        )",
    )
    .expect("autocommit pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Ddl,
    Dml,
    Query,
    Utility,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ddl => "ddl",
            Self::Dml => "dml",
            Self::Query => "query",
            Self::Utility => "utility",
        }
    }

    fn classify(masked: &str) -> Self {
        let first = masked
            .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        match first.as_str() {
            "create" | "alter" | "drop" | "comment" | "grant" | "revoke" | "truncate" => Self::Ddl,
            "insert" | "update" | "delete" | "merge" | "copy" | "refresh" => Self::Dml,
            "select" | "with" | "values" | "table" | "explain" | "show" => Self::Query,
            _ => Self::Utility,
        }
    }
}

/// One executable statement taken from a fenced SQL block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Position in document order; the block's identity.
    pub index: usize,
    /// 1-based document line of the first non-blank line of `sql`.
    pub line: usize,
    /// Blocks sharing a fence index are related.
    pub fence: usize,
    pub part: usize,
    /// Verbatim slice of the fence body.
    pub sql: String,
    pub kind: BlockKind,
    pub defines: Vec<DbObject>,
    pub requires: Vec<String>,
    /// Names required through `-- depends:`; a missing definer is worth a warning.
    pub explicit_requires: Vec<String>,
    pub expectation: Option<Expectation>,
    pub skip: Option<String>,
}

impl Block {
    /// `start_line` is the document line on which `sql` begins.
    pub fn parse(
        index: usize,
        start_line: usize,
        fence: usize,
        part: usize,
        sql: &str,
    ) -> Result<Self> {
        let line_of = |offset: usize| start_line + sql[..offset].matches('\n').count();

        let annotations = expectation::parse_annotations(sql).map_err(|e| Error::Parse {
            line: line_of(e.offset),
            message: e.message,
        })?;

        let masked = sql::mask(sql);
        let scan = objects::scan(&masked);

        let mut defines = scan.defines;
        for name in &annotations.defines {
            if !defines.iter().any(|d| &d.name == name) {
                defines.push(DbObject {
                    kind: ObjectKind::Declared,
                    name: name.clone(),
                });
            }
        }

        let mut requires = scan.references;
        for name in &annotations.depends {
            if !requires.contains(name) {
                requires.push(name.clone());
            }
        }

        let skip = annotations.skip.or_else(|| {
            masked
                .lines()
                .any(|l| l.trim_start().starts_with('\\'))
                .then(|| "contains a psql meta-command".to_string())
        });

        Ok(Self {
            index,
            line: line_of(sql.len() - sql.trim_start().len()),
            fence,
            part,
            sql: sql.to_string(),
            kind: BlockKind::classify(&masked),
            defines,
            requires,
            explicit_requires: annotations.depends,
            expectation: annotations.expectation,
            skip,
        })
    }

    pub fn is_related(&self, other: &Block) -> bool {
        self.fence == other.fence && self.index != other.index
    }

    /// Whether the statement cannot run inside a transaction block.
    pub fn requires_autocommit(&self) -> bool {
        AUTOCOMMIT_ONLY_RE.is_match(&sql::mask(&self.sql))
    }

    /// First line of actual SQL, for error messages.
    pub fn excerpt(&self) -> String {
        const MAX: usize = 80;
        let line = self
            .sql
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with("--"))
            .unwrap_or("");
        if line.chars().count() > MAX {
            let cut: String = line.chars().take(MAX - 3).collect();
            format!("{}...", cut)
        } else {
            line.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_classification() {
        let cases = [
            ("CREATE MATERIALIZED VIEW v AS SELECT 1;", BlockKind::Ddl),
            ("-- expect: rows 1\nSELECT 1;", BlockKind::Query),
            ("(SELECT 1) UNION (SELECT 2);", BlockKind::Query),
            ("WITH x AS (SELECT 1) SELECT * FROM x;", BlockKind::Query),
            ("UPDATE parcels SET zone = 'R1';", BlockKind::Dml),
            ("REFRESH MATERIALIZED VIEW mvw_precinct;", BlockKind::Dml),
            ("SET search_path = public;", BlockKind::Utility),
        ];
        for (sql, kind) in cases {
            assert_eq!(Block::parse(0, 1, 0, 0, sql).unwrap().kind, kind, "{}", sql);
        }
    }

    #[test]
    fn test_block_declarations_merge_explicit_markers() {
        let sql = "-- depends: precincts\n-- defines: parcel_summary\nSELECT load_parcels();";
        let block = Block::parse(2, 10, 1, 0, sql).unwrap();
        assert!(block.requires.contains(&"load_parcels".to_string()));
        assert!(block.requires.contains(&"precincts".to_string()));
        assert_eq!(block.explicit_requires, vec!["precincts"]);
        assert_eq!(
            block.defines,
            vec![DbObject {
                kind: ObjectKind::Declared,
                name: "parcel_summary".to_string()
            }]
        );
    }

    #[test]
    fn test_annotation_error_reports_document_line() {
        let err = Block::parse(0, 20, 0, 0, "SELECT 1;\n\n-- expect: maybe\n").unwrap_err();
        match err {
            Error::Parse { line, .. } => assert_eq!(line, 22),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_autocommit_detection() {
        let vacuum = Block::parse(0, 1, 0, 0, "VACUUM ANALYZE parcels;").unwrap();
        assert!(vacuum.requires_autocommit());
        let concurrent =
            Block::parse(0, 1, 0, 0, "CREATE INDEX CONCURRENTLY idx ON parcels (id);").unwrap();
        assert!(concurrent.requires_autocommit());
        let plain = Block::parse(0, 1, 0, 0, "CREATE INDEX idx ON parcels (id);").unwrap();
        assert!(!plain.requires_autocommit());
    }

    #[test]
    fn test_meta_commands_are_skipped() {
        let block = Block::parse(0, 1, 0, 0, "\\d+ parcels\n").unwrap();
        assert_eq!(block.skip.as_deref(), Some("contains a psql meta-command"));
    }

    #[test]
    fn test_excerpt_skips_comments() {
        let block = Block::parse(0, 1, 0, 0, "-- count parcels\n  SELECT count(*) FROM parcels;\n").unwrap();
        assert_eq!(block.excerpt(), "SELECT count(*) FROM parcels;");
    }
}
