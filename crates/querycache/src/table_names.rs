use dashmap::DashMap;
use querycache_core::TableName;
use std::collections::BTreeSet;
use std::sync::Arc;

const TABLE_MARKERS: [&str; 4] = ["FROM", "JOIN", "INTO", "UPDATE"];
const MUTATING_PREFIXES: [&str; 4] = ["insert ", "update ", "delete ", "create "];
const DECORATIONS: [char; 5] = ['[', ']', '"', '\'', '`'];

/// Lexical scanner for the tables a command touches.
///
/// This is a heuristic over whitespace-separated tokens, not a parser: subqueries,
/// CTE names and aliases may show up as extra names. Callers intersect the result
/// with the known table list, so over-approximation is harmless.
#[derive(Debug, Default)]
pub struct TableNameExtractor {
    memo: DashMap<String, Arc<BTreeSet<TableName>>>,
}

impl TableNameExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names following `FROM`, `JOIN`, `INTO` or `UPDATE`, memoized per command text.
    pub fn extract_table_names(&self, command_text: &str) -> Arc<BTreeSet<TableName>> {
        if let Some(names) = self.memo.get(command_text) {
            return Arc::clone(names.value());
        }

        let names = Arc::new(scan_table_names(command_text));
        self.memo
            .entry(command_text.to_string())
            .or_insert(names)
            .value()
            .clone()
    }

    /// True when any line starts with `insert`, `update`, `delete` or `create`.
    pub fn is_mutating_command(&self, command_text: &str) -> bool {
        is_mutating_command(command_text)
    }

    pub fn memoized_len(&self) -> usize {
        self.memo.len()
    }

    pub fn clear(&self) {
        self.memo.clear();
    }
}

pub fn scan_table_names(command_text: &str) -> BTreeSet<TableName> {
    let words: Vec<&str> = command_text.split_whitespace().collect();
    let mut names = BTreeSet::new();

    for (i, word) in words.iter().enumerate() {
        if !TABLE_MARKERS.iter().any(|m| m.eq_ignore_ascii_case(word)) {
            continue;
        }
        let Some(next) = words.get(i + 1) else {
            continue;
        };
        if let Some(name) = clean_table_token(next) {
            names.insert(TableName::new(name));
        }
    }

    names
}

fn clean_table_token(token: &str) -> Option<String> {
    let token = token
        .trim_start_matches('(')
        .trim_end_matches(|c: char| c == ';' || c == ',' || c == ')');
    // schema.table and server.db.schema.table both reduce to the last segment
    let unqualified = token.rsplit('.').next().unwrap_or(token);
    let name: String = unqualified
        .chars()
        .filter(|c| !DECORATIONS.contains(c))
        .collect();

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

pub fn is_mutating_command(command_text: &str) -> bool {
    command_text.lines().any(|line| {
        let line = line.trim();
        MUTATING_PREFIXES.iter().any(|prefix| {
            line.len() >= prefix.len()
                && line.is_char_boundary(prefix.len())
                && line[..prefix.len()].eq_ignore_ascii_case(prefix)
        })
    })
}
