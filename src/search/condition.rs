// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Condition - boolean IR for compiled refinements
//!
//! Every predicate is built as a [`Condition`] tree first and then rendered
//! to a parameterized [`SqlFragment`] for a dialect. The same tree can be
//! evaluated against a JSON document with [`Condition::matches`].
//!
//! # SQL Syntax Generated
//!
//! ```sql
//! "brand" IN (?, ?)                                -- In
//! ("brand" IS NULL OR "brand" NOT IN (?))          -- In, negated
//! "price" >= ?                                     -- Compare
//! ("a" IN (?) AND "price" < ?)                     -- And
//! ("a" IN (?) OR "b" IN (?))                       -- Or
//! to_tsvector('simple', concat_ws(' ', "name")) @@ plainto_tsquery('simple', ?)   -- Text (Postgres)
//! (LOWER("name") LIKE ? ESCAPE '!' OR LOWER("description") LIKE ? ESCAPE '!')    -- Text (other)
//! ```
//!
//! Extended attributes (stored in a join table) render as a correlated
//! `EXISTS`, with the negation outside:
//!
//! ```sql
//! EXISTS (SELECT 1 FROM "product_tags" WHERE "product_tags"."product_id" = "products"."id"
//!         AND "product_tags"."tag" IN (?))
//! ```
//!
//! There is deliberately no general `NOT` node: negation only appears as a
//! negated `In`, which is rendered null-safe, so SQL three-valued logic and
//! in-memory evaluation agree.

use serde_json::Value;

use super::refinements::{Operator, RefinementValue};
use crate::config::ExtendedAttribute;
use crate::sql::{SqlDialect, SqlFragment, SqlParam};

/// Where attributes are stored: columns of `table`, or rows of a join table
/// for the `extended` ones
#[derive(Debug, Clone, Copy)]
pub struct TableLayout<'a> {
    pub dialect: SqlDialect,
    pub table: &'a str,
    /// Column of `table` that join tables reference
    pub key: &'a str,
    pub extended: &'a [ExtendedAttribute],
}

impl<'a> TableLayout<'a> {
    /// Every attribute is a column of `table`
    pub fn new(dialect: SqlDialect, table: &'a str) -> Self {
        Self {
            dialect,
            table,
            key: "id",
            extended: &[],
        }
    }

    pub fn with_extended(mut self, key: &'a str, extended: &'a [ExtendedAttribute]) -> Self {
        self.key = key;
        self.extended = extended;
        self
    }

    pub fn extended(&self, attribute: &str) -> Option<&'a ExtendedAttribute> {
        self.extended.iter().find(|e| e.name == attribute)
    }

    /// Expression holding the values of `attribute`
    pub fn value_column(&self, attribute: &str) -> String {
        match self.extended(attribute) {
            Some(extended) => self.qualified(&extended.join_table, extended.column()),
            None => self.dialect.quote_ident(attribute),
        }
    }

    /// `"join"."foreign_key" IN (SELECT "table"."key" FROM "table" WHERE rows)`
    pub fn rows_of(&self, extended: &ExtendedAttribute, rows: SqlFragment) -> SqlFragment {
        let mut sql = format!(
            "{} IN (SELECT {} FROM {}",
            self.qualified(&extended.join_table, &extended.foreign_key),
            self.qualified(self.table, self.key),
            self.dialect.quote_ident(self.table),
        );
        if !rows.is_always_true() {
            sql.push_str(" WHERE ");
            sql.push_str(&rows.sql);
        }
        sql.push(')');
        SqlFragment::predicate(sql, rows.params)
    }

    fn exists(&self, extended: &ExtendedAttribute, predicate: &str, negated: bool) -> String {
        format!(
            "{}EXISTS (SELECT 1 FROM {} WHERE {} = {} AND {})",
            if negated { "NOT " } else { "" },
            self.dialect.quote_ident(&extended.join_table),
            self.qualified(&extended.join_table, &extended.foreign_key),
            self.qualified(self.table, self.key),
            predicate,
        )
    }

    fn qualified(&self, table: &str, column: &str) -> String {
        format!("{}.{}", self.dialect.quote_ident(table), self.dialect.quote_ident(column))
    }
}

/// Boolean condition over attributes
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Attribute equals one of `values` (or none of them when `negated`;
    /// missing values satisfy a negation)
    In {
        attribute: String,
        values: Vec<RefinementValue>,
        negated: bool,
    },
    /// Numeric comparison
    Compare {
        attribute: String,
        operator: Operator,
        value: f64,
    },
    /// Free-text match: every term must occur in one of `attributes`
    Text {
        attributes: Vec<String>,
        query: String,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    /// Create a free-text condition; `None` when there is nothing to match.
    pub fn text(attributes: &[String], query: &str) -> Option<Self> {
        let query = query.trim();
        if query.is_empty() || attributes.is_empty() || text_terms(query).is_empty() {
            return None;
        }
        Some(Condition::Text {
            attributes: attributes.to_vec(),
            query: query.to_string(),
        })
    }

    pub fn equals(attribute: impl Into<String>, value: impl Into<RefinementValue>) -> Self {
        Condition::In {
            attribute: attribute.into(),
            values: vec![value.into()],
            negated: false,
        }
    }

    /// Flatten nested And/Or of the same kind and unwrap single children.
    pub fn simplify(self) -> Self {
        match self {
            Condition::And(parts) => {
                let mut flat = Vec::with_capacity(parts.len());
                for part in parts.into_iter().map(Condition::simplify) {
                    match part {
                        Condition::And(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    flat.pop().unwrap_or(Condition::And(Vec::new()))
                } else {
                    Condition::And(flat)
                }
            }
            Condition::Or(parts) => {
                let mut flat = Vec::with_capacity(parts.len());
                for part in parts.into_iter().map(Condition::simplify) {
                    match part {
                        Condition::Or(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    flat.pop().unwrap_or(Condition::Or(Vec::new()))
                } else {
                    Condition::Or(flat)
                }
            }
            leaf => leaf,
        }
    }

    /// Render to a parameterized predicate over plain columns
    pub fn to_sql(&self, dialect: SqlDialect) -> SqlFragment {
        self.to_sql_in(&TableLayout::new(dialect, ""))
    }

    /// Render to a parameterized predicate over `layout.table`
    pub fn to_sql_in(&self, layout: &TableLayout<'_>) -> SqlFragment {
        let mut params = Vec::new();
        let sql = self.render(layout, &mut params);
        SqlFragment::predicate(sql, params)
    }

    fn render(&self, layout: &TableLayout<'_>, params: &mut Vec<SqlParam>) -> String {
        let dialect = layout.dialect;
        match self {
            Condition::In {
                attribute,
                values,
                negated,
            } => {
                if values.is_empty() {
                    return if *negated { "1=1" } else { "1=0" }.to_string();
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                params.extend(values.iter().map(to_param));
                let column = layout.value_column(attribute);
                match layout.extended(attribute) {
                    Some(extended) => {
                        layout.exists(extended, &format!("{} IN ({})", column, placeholders), *negated)
                    }
                    None if *negated => format!("({} IS NULL OR {} NOT IN ({}))", column, column, placeholders),
                    None => format!("{} IN ({})", column, placeholders),
                }
            }
            Condition::Compare {
                attribute,
                operator,
                value,
            } => {
                params.push(SqlParam::Float(*value));
                let comparison = format!("{} {} ?", layout.value_column(attribute), operator.as_sql());
                match layout.extended(attribute) {
                    Some(extended) => layout.exists(extended, &comparison, false),
                    None => comparison,
                }
            }
            Condition::Text { attributes, query } => render_text(dialect, attributes, query, params),
            Condition::And(parts) => render_group(parts, " AND ", "1=1", layout, params),
            Condition::Or(parts) => render_group(parts, " OR ", "1=0", layout, params),
        }
    }

    /// Evaluate against a JSON object. Array-valued attributes match when any
    /// element matches. Postgres full-text search is approximated by a
    /// case-insensitive substring match per term.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Condition::In {
                attribute,
                values,
                negated,
            } => {
                let found = field_values(doc, attribute)
                    .iter()
                    .any(|field| values.iter().any(|v| value_eq(field, v)));
                found != *negated
            }
            Condition::Compare {
                attribute,
                operator,
                value,
            } => field_values(doc, attribute)
                .iter()
                .filter_map(|field| as_number(field))
                .any(|n| operator.compare(n, *value)),
            Condition::Text { attributes, query } => text_terms(query).iter().all(|term| {
                attributes.iter().any(|attr| {
                    field_values(doc, attr)
                        .iter()
                        .filter_map(|v| v.as_str())
                        .any(|s| s.to_lowercase().contains(term.as_str()))
                })
            }),
            Condition::And(parts) => parts.iter().all(|p| p.matches(doc)),
            Condition::Or(parts) => parts.iter().any(|p| p.matches(doc)),
        }
    }

    /// Attributes referenced anywhere in the tree
    pub fn attributes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_attributes(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::In { attribute, .. } | Condition::Compare { attribute, .. } => out.push(attribute),
            Condition::Text { attributes, .. } => out.extend(attributes.iter().map(String::as_str)),
            Condition::And(parts) | Condition::Or(parts) => {
                for part in parts {
                    part.collect_attributes(out);
                }
            }
        }
    }
}

fn render_group(
    parts: &[Condition],
    joiner: &str,
    empty: &str,
    layout: &TableLayout<'_>,
    params: &mut Vec<SqlParam>,
) -> String {
    match parts.len() {
        0 => empty.to_string(),
        1 => parts[0].render(layout, params),
        _ => {
            let rendered: Vec<String> = parts.iter().map(|p| p.render(layout, params)).collect();
            format!("({})", rendered.join(joiner))
        }
    }
}

fn render_text(dialect: SqlDialect, attributes: &[String], query: &str, params: &mut Vec<SqlParam>) -> String {
    match dialect {
        SqlDialect::Postgres => {
            let columns: Vec<String> = attributes.iter().map(|a| dialect.quote_ident(a)).collect();
            params.push(SqlParam::Text(query.to_string()));
            format!(
                "to_tsvector('simple', concat_ws(' ', {})) @@ plainto_tsquery('simple', ?)",
                columns.join(", ")
            )
        }
        SqlDialect::Sqlite | SqlDialect::MySql => {
            let terms = text_terms(query);
            let per_term: Vec<String> = terms
                .iter()
                .map(|term| {
                    let pattern = format!("%{}%", escape_like(term));
                    let alternatives: Vec<String> = attributes
                        .iter()
                        .map(|a| {
                            params.push(SqlParam::Text(pattern.clone()));
                            format!("LOWER({}) LIKE ? ESCAPE '!'", dialect.quote_ident(a))
                        })
                        .collect();
                    if alternatives.len() == 1 {
                        alternatives[0].clone()
                    } else {
                        format!("({})", alternatives.join(" OR "))
                    }
                })
                .collect();
            if per_term.len() == 1 {
                per_term[0].clone()
            } else {
                format!("({})", per_term.join(" AND "))
            }
        }
    }
}

/// Lowercased whitespace-separated terms
pub(crate) fn text_terms(query: &str) -> Vec<String> {
    query.split_whitespace().map(str::to_lowercase).collect()
}

/// Escape `LIKE` wildcards using `!` as the escape character
pub(crate) fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '!' | '%' | '_') {
            out.push('!');
        }
        out.push(ch);
    }
    out
}

fn to_param(value: &RefinementValue) -> SqlParam {
    match value {
        RefinementValue::Number(n) => SqlParam::Float(*n),
        RefinementValue::Text(s) => SqlParam::Text(s.clone()),
    }
}

fn field_values<'a>(doc: &'a Value, attribute: &str) -> Vec<&'a Value> {
    match doc.get(attribute) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
        Some(v) => vec![v],
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_eq(field: &Value, expected: &RefinementValue) -> bool {
    match (field, expected) {
        (Value::String(s), RefinementValue::Text(t)) => s == t,
        (Value::Bool(b), RefinementValue::Text(t)) => t == if *b { "true" } else { "false" },
        (Value::Number(n), RefinementValue::Text(t)) => {
            n.to_string() == *t || (t.parse::<f64>().ok() == n.as_f64() && n.as_f64().is_some())
        }
        (_, RefinementValue::Number(expected)) => as_number(field) == Some(*expected),
        _ => false,
    }
}
