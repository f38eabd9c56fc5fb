//! Detection of the database objects a statement creates or uses.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    View,
    MaterializedView,
    Function,
    Procedure,
    Index,
    /// Declared with `-- defines:`; the kind is not known.
    Declared,
}

impl ObjectKind {
    /// Keyword used in `DROP <keyword> IF EXISTS`.
    pub fn drop_keyword(&self) -> Option<&'static str> {
        match self {
            Self::Table => Some("TABLE"),
            Self::View => Some("VIEW"),
            Self::MaterializedView => Some("MATERIALIZED VIEW"),
            Self::Function => Some("FUNCTION"),
            Self::Procedure => Some("PROCEDURE"),
            Self::Index => Some("INDEX"),
            Self::Declared => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbObject {
    pub kind: ObjectKind,
    pub name: String,
}

impl fmt::Display for DbObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind.drop_keyword() {
            Some(keyword) => write!(f, "{} {}", keyword.to_lowercase(), self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Names a statement defines and references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectScan {
    pub defines: Vec<DbObject>,
    pub references: Vec<String>,
}

/// Words that can follow a reference keyword without being the object name.
const SKIP_WORDS: &[&str] = &[
    "if", "not", "exists", "only", "lateral", "concurrently", "table", "materialized", "view",
];

/// Words that look like names after a reference keyword but never are.
const NOT_NAMES: &[&str] = &[
    "select", "values", "with", "unnest", "generate_series", "rows", "row", "conflict",
];

const REFERENCE_KEYWORDS: &[&str] = &["from", "join", "into", "update", "table", "on", "view"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(String),
    Punct(char),
}

/// Lowercases, unquotes and strips a `public.` schema prefix.
pub fn normalize_name(raw: &str) -> String {
    let unquoted: String = raw.trim().chars().filter(|c| *c != '"').collect();
    let lowered = unquoted.to_lowercase();
    lowered
        .strip_prefix("public.")
        .map(str::to_string)
        .unwrap_or(lowered)
}

/// Scans masked SQL (comments and literals already blanked, see [`crate::sql::mask`]).
pub fn scan(masked: &str) -> ObjectScan {
    let toks = tokens(masked);
    let mut scan = ObjectScan::default();

    let leading = toks.iter().find_map(|t| match t {
        Tok::Word(w) => Some(w.as_str()),
        Tok::Punct(_) => None,
    });
    // DROP before CREATE is common in tutorials; it must not pull the CREATE ahead of it.
    let references_allowed = leading != Some("drop");

    let mut i = 0;
    while i < toks.len() {
        if let Tok::Word(word) = &toks[i] {
            if word == "create" {
                if let Some(object) = definition_at(&toks, i + 1) {
                    push_unique(&mut scan.defines, object);
                }
            }

            if references_allowed {
                if REFERENCE_KEYWORDS.contains(&word.as_str()) {
                    if let Some(name) = name_after(&toks, i + 1) {
                        push_unique(&mut scan.references, name);
                    }
                } else if toks.get(i + 1) == Some(&Tok::Punct('(')) && !is_keyword(word) {
                    push_unique(&mut scan.references, word.clone());
                }
            }
        }
        i += 1;
    }

    scan
}

fn definition_at(toks: &[Tok], mut i: usize) -> Option<DbObject> {
    let word_at = |i: usize| match toks.get(i) {
        Some(Tok::Word(w)) => Some(w.as_str()),
        _ => None,
    };

    if word_at(i) == Some("or") && word_at(i + 1) == Some("replace") {
        i += 2;
    }
    while matches!(
        word_at(i),
        Some("temp" | "temporary" | "unlogged" | "unique" | "recursive" | "global" | "local")
    ) {
        i += 1;
    }

    let kind = match word_at(i)? {
        "table" => ObjectKind::Table,
        "view" => ObjectKind::View,
        "materialized" if word_at(i + 1) == Some("view") => {
            i += 1;
            ObjectKind::MaterializedView
        }
        "function" => ObjectKind::Function,
        "procedure" => ObjectKind::Procedure,
        "index" => ObjectKind::Index,
        _ => return None,
    };
    i += 1;

    if kind == ObjectKind::Index && word_at(i) == Some("concurrently") {
        i += 1;
    }
    if word_at(i) == Some("if") && word_at(i + 1) == Some("not") && word_at(i + 2) == Some("exists") {
        i += 3;
    }

    let name = word_at(i)?;
    // `CREATE INDEX ON t (...)` has no name to track.
    if kind == ObjectKind::Index && name == "on" {
        return None;
    }
    Some(DbObject {
        kind,
        name: name.to_string(),
    })
}

fn name_after(toks: &[Tok], mut i: usize) -> Option<String> {
    while let Some(Tok::Word(w)) = toks.get(i) {
        if !SKIP_WORDS.contains(&w.as_str()) {
            break;
        }
        i += 1;
    }
    match toks.get(i) {
        Some(Tok::Word(w)) if !NOT_NAMES.contains(&w.as_str()) => Some(w.clone()),
        _ => None,
    }
}

fn is_keyword(word: &str) -> bool {
    matches!(
        word,
        "in" | "as" | "values" | "exists" | "any" | "all" | "and" | "or" | "not" | "over"
            | "filter" | "using" | "on" | "into" | "from" | "join" | "table" | "view"
            | "returns" | "with" | "select" | "where" | "when" | "then" | "else" | "cast"
            | "array" | "row" | "primary" | "key" | "references" | "unique" | "check"
            | "default" | "partition" | "by" | "window" | "distinct" | "lateral" | "if"
    )
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn tokens(text: &str) -> Vec<Tok> {
    let chars: Vec<char> = text.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_alphabetic() || c == '_' || c == '"' {
            let mut name = String::new();
            loop {
                i = read_identifier(&chars, i, &mut name);
                if chars.get(i) == Some(&'.')
                    && chars
                        .get(i + 1)
                        .is_some_and(|n| n.is_alphabetic() || *n == '_' || *n == '"')
                {
                    name.push('.');
                    i += 1;
                } else {
                    break;
                }
            }
            toks.push(Tok::Word(normalize_name(&name)));
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
        } else {
            toks.push(Tok::Punct(c));
            i += 1;
        }
    }

    toks
}

fn read_identifier(chars: &[char], mut i: usize, out: &mut String) -> usize {
    if chars.get(i) == Some(&'"') {
        i += 1;
        while i < chars.len() && chars[i] != '"' {
            out.push(chars[i]);
            i += 1;
        }
        return (i + 1).min(chars.len());
    }
    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
        out.push(chars[i]);
        i += 1;
    }
    i
}
