// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL fragments and dialects.
//!
//! Every compiler stage produces [`SqlFragment`]s: SQL text with `?`
//! placeholders plus the ordered parameter values. Fragments compose by
//! concatenation (params are appended in textual order), and are rendered to
//! the backend's placeholder style only at the very end.
//!
//! # SQL Generated per Dialect
//!
//! ```text
//! Postgres:  "brand" IN ($1, $2)        identifiers "..."   floats DOUBLE PRECISION
//! SQLite:    "brand" IN (?, ?)          identifiers "..."   floats REAL
//! MySQL:     `brand` IN (?, ?)          identifiers `...`   floats DOUBLE
//! ```
//!
//! User values never appear in SQL text. Identifiers only reach SQL after
//! allow-list validation and are always quoted with the quote character
//! doubled.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Target SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    /// PostgreSQL (`$n` placeholders)
    #[default]
    Postgres,
    /// SQLite (`?` placeholders)
    Sqlite,
    /// MySQL / MariaDB (`?` placeholders, backtick identifiers)
    #[serde(alias = "mariadb")]
    MySql,
}

impl SqlDialect {
    /// Detect the dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Some(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Some(Self::MySql)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::MySql => "mysql",
        }
    }

    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Self::Postgres | Self::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    /// Quote a string literal. Only used for configuration-sourced names
    /// (JSON object keys), never for request values.
    pub fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Type name for `CAST(x AS <text>)`
    pub fn text_type(&self) -> &'static str {
        match self {
            Self::Postgres | Self::Sqlite => "TEXT",
            Self::MySql => "CHAR",
        }
    }

    /// Type name for `CAST(x AS <float>)`
    pub fn float_type(&self) -> &'static str {
        match self {
            Self::Postgres => "DOUBLE PRECISION",
            Self::Sqlite => "REAL",
            Self::MySql => "DOUBLE",
        }
    }

    /// `ORDER BY` term honoring an explicit NULLS placement.
    ///
    /// MySQL has no `NULLS FIRST/LAST`, so it sorts on `x IS NULL` first.
    pub fn order_term(&self, column: &str, descending: bool, nulls_last: Option<bool>) -> String {
        let direction = if descending { "DESC" } else { "ASC" };
        match (self, nulls_last) {
            (_, None) => format!("{} {}", column, direction),
            (Self::MySql, Some(last)) => format!(
                "{} IS NULL {}, {} {}",
                column,
                if last { "ASC" } else { "DESC" },
                column,
                direction
            ),
            (_, Some(last)) => format!(
                "{} {} NULLS {}",
                column,
                direction,
                if last { "LAST" } else { "FIRST" }
            ),
        }
    }

    /// JSON object built from `(literal key, sql expression)` pairs.
    pub fn json_object(&self, pairs: &[(String, String)]) -> String {
        let args: Vec<String> = pairs
            .iter()
            .map(|(key, expr)| format!("{}, {}", self.quote_literal(key), expr))
            .collect();
        let func = match self {
            Self::Postgres => "json_build_object",
            Self::Sqlite => "json_object",
            Self::MySql => "JSON_OBJECT",
        };
        format!("{}({})", func, args.join(", "))
    }

    /// Aggregate `key -> value` rows of `source` into one JSON object
    /// (empty object when there are no rows).
    pub fn json_object_agg(&self, key: &str, value: &str, source: &str) -> String {
        match self {
            Self::Postgres => format!(
                "(SELECT COALESCE(json_object_agg({}, {}), '{{}}'::json) FROM {})",
                key, value, source
            ),
            // Subtypes do not survive subquery boundaries in SQLite; re-parse.
            Self::Sqlite => format!(
                "json((SELECT COALESCE(json_group_object({}, {}), '{{}}') FROM {}))",
                key, value, source
            ),
            Self::MySql => format!(
                "(SELECT COALESCE(JSON_OBJECTAGG({}, {}), JSON_OBJECT()) FROM {})",
                key, value, source
            ),
        }
    }

    /// Wrap a scalar JSON subquery so it nests as JSON, not as a string.
    pub fn json_subquery(&self, subquery: &str) -> String {
        match self {
            Self::Sqlite => format!("json(({}))", subquery),
            Self::Postgres | Self::MySql => format!("({})", subquery),
        }
    }

    /// Render the placeholder for the 1-based parameter position.
    fn placeholder(&self, position: usize) -> String {
        match self {
            Self::Postgres => format!("${}", position),
            Self::Sqlite | Self::MySql => "?".to_string(),
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQL parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Float(f64),
    Integer(i64),
    Boolean(bool),
}

impl SqlParam {
    fn to_inline(&self) -> String {
        match self {
            SqlParam::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlParam::Float(n) => n.to_string(),
            SqlParam::Integer(n) => n.to_string(),
            SqlParam::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        }
    }
}

/// What a fragment evaluates to. Hooks must preserve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentKind {
    /// Boolean expression usable in a WHERE clause
    Predicate,
    /// SELECT producing aggregate rows (facet counts, stats)
    Aggregation,
    /// Complete statement (hits, count, combined aggregates)
    Query,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FragmentKind::Predicate => "predicate",
            FragmentKind::Aggregation => "aggregation",
            FragmentKind::Query => "query",
        })
    }
}

/// SQL text with `?` placeholders and its parameters, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    pub kind: FragmentKind,
    pub sql: String,
    pub params: Vec<SqlParam>,
}

const ALWAYS_TRUE: &str = "1=1";
const ALWAYS_FALSE: &str = "1=0";

impl SqlFragment {
    pub fn new(kind: FragmentKind, sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            kind,
            sql: sql.into(),
            params,
        }
    }

    pub fn predicate(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self::new(FragmentKind::Predicate, sql, params)
    }

    pub fn aggregation(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self::new(FragmentKind::Aggregation, sql, params)
    }

    pub fn query(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self::new(FragmentKind::Query, sql, params)
    }

    pub fn always_true() -> Self {
        Self::predicate(ALWAYS_TRUE, Vec::new())
    }

    pub fn always_false() -> Self {
        Self::predicate(ALWAYS_FALSE, Vec::new())
    }

    pub fn is_always_true(&self) -> bool {
        self.kind == FragmentKind::Predicate && self.sql == ALWAYS_TRUE && self.params.is_empty()
    }

    /// Conjoin predicates. Trivially-true parts are dropped; each remaining
    /// part is parenthesized when there is more than one.
    pub fn conjoin<'a>(parts: impl IntoIterator<Item = &'a SqlFragment>) -> SqlFragment {
        let parts: Vec<&SqlFragment> = parts.into_iter().filter(|p| !p.is_always_true()).collect();
        match parts.len() {
            0 => Self::always_true(),
            1 => Self::predicate(parts[0].sql.clone(), parts[0].params.clone()),
            _ => {
                let sql = parts
                    .iter()
                    .map(|p| format!("({})", p.sql))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let params = parts.iter().flat_map(|p| p.params.iter().cloned()).collect();
                Self::predicate(sql, params)
            }
        }
    }

    /// Number of `?` placeholders outside quoted identifiers and literals.
    pub fn placeholder_count(&self) -> usize {
        let mut count = 0;
        scan_placeholders(&self.sql, |_| count += 1);
        count
    }

    /// Render the SQL with the dialect's placeholder style.
    pub fn render(&self, dialect: SqlDialect) -> String {
        let mut out = String::with_capacity(self.sql.len() + 8);
        let mut position = 0;
        let mut last = 0;
        scan_placeholders(&self.sql, |idx| {
            position += 1;
            out.push_str(&self.sql[last..idx]);
            out.push_str(&dialect.placeholder(position));
            last = idx + 1;
        });
        out.push_str(&self.sql[last..]);
        out
    }

    /// Render with values inlined.
    ///
    /// Warning: debugging output only, never execute it.
    pub fn inline(&self) -> String {
        let mut out = String::with_capacity(self.sql.len() + 16);
        let mut params = self.params.iter();
        let mut last = 0;
        scan_placeholders(&self.sql, |idx| {
            out.push_str(&self.sql[last..idx]);
            match params.next() {
                Some(param) => out.push_str(&param.to_inline()),
                None => out.push('?'),
            }
            last = idx + 1;
        });
        out.push_str(&self.sql[last..]);
        out
    }
}

/// Call `on_placeholder` with the byte offset of every `?` that is not
/// inside a `'...'` literal, `"..."` identifier or `` `...` `` identifier.
/// Doubled quotes toggle twice, so escaped quotes need no special case.
fn scan_placeholders(sql: &str, mut on_placeholder: impl FnMut(usize)) {
    let mut quote: Option<char> = None;
    for (idx, ch) in sql.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '?' => on_placeholder(idx),
                _ => {}
            },
        }
    }
}
