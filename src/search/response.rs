//! Response envelope and row shaping.
//!
//! ```json
//! { "hits": [...], "nbHits": 4, "page": 0, "nbPages": 1, "hitsPerPage": 20,
//!   "facets": {"brand": {"X": 1, "Y": 1}},
//!   "facets_stats": {"price": {"min": 1, "max": 4, "avg": 2.5, "sum": 10}},
//!   "processingTimeMS": 3, ... }
//! ```

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::executor::Row;

/// `{min, max, avg, sum}` of one numeric attribute
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FacetStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub hits: Vec<Value>,
    pub nb_hits: u64,
    pub page: u32,
    pub nb_pages: u64,
    pub hits_per_page: u32,
    pub facets: BTreeMap<String, BTreeMap<String, u64>>,
    /// `null` per attribute when no row matched its scope
    #[serde(rename = "facets_stats")]
    pub facets_stats: BTreeMap<String, Option<FacetStats>>,
    #[serde(rename = "processingTimeMS")]
    pub processing_time_ms: u64,
    pub exhaustive_nb_hits: bool,
    pub exhaustive_facets_count: bool,
    pub query: String,
    pub params: String,
    pub index: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendering_content: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetHit {
    pub value: String,
    /// Value with the matched part wrapped in `<em>`
    pub highlighted: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetSearchResponse {
    pub facet_hits: Vec<FacetHit>,
    pub exhaustive_facets_count: bool,
    #[serde(rename = "processingTimeMS")]
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiSearchResponse {
    pub results: Vec<SearchResponse>,
}

pub(crate) const FACET_VALUE: &str = "facet_value";
pub(crate) const FACET_COUNT: &str = "facet_count";
pub(crate) const NB_HITS: &str = "nb_hits";
pub(crate) const NB_HITS_TOTAL: &str = "nb_hits_total";

/// `facet_value -> facet_count` from aggregation rows (empty when no rows).
pub fn facet_counts(rows: &[Row]) -> BTreeMap<String, u64> {
    rows.iter()
        .filter_map(|row| {
            let value = row.get(FACET_VALUE).and_then(value_to_string)?;
            let count = row.get(FACET_COUNT).and_then(value_to_u64)?;
            Some((value, count))
        })
        .collect()
}

/// Ordered facet hits with highlighting
pub fn facet_hits(rows: &[Row], facet_query: &str) -> Vec<FacetHit> {
    rows.iter()
        .filter_map(|row| {
            let value = row.get(FACET_VALUE).and_then(value_to_string)?;
            let count = row.get(FACET_COUNT).and_then(value_to_u64)?;
            Some(FacetHit {
                highlighted: highlight(&value, facet_query),
                value,
                count,
            })
        })
        .collect()
}

/// Stats from the single stats row; `None` when every aggregate is null.
pub fn stats_from_row(row: Option<&Row>) -> Option<FacetStats> {
    let row = row?;
    let get = |name: &str| row.get(name).and_then(value_to_f64);
    Some(FacetStats {
        min: get("stat_min")?,
        max: get("stat_max")?,
        avg: get("stat_avg")?,
        sum: get("stat_sum")?,
    })
}

/// Hit object with `objectID` filled in and bookkeeping columns removed.
pub fn shape_hit(mut row: Row, object_id_attribute: &str) -> Value {
    row.remove(NB_HITS_TOTAL);
    if !row.contains_key("objectID") {
        if let Some(id) = row.get(object_id_attribute).and_then(value_to_string) {
            row.insert("objectID".to_string(), Value::String(id));
        }
    }
    Value::Object(row)
}

/// `nb_hits` / `nb_hits_total` column of the first row
pub fn count_from_rows(rows: &[Row], column: &str) -> Option<u64> {
    rows.first().and_then(|row| row.get(column)).and_then(value_to_u64)
}

/// Wrap the first case-insensitive occurrence of `query` in `<em>`.
pub fn highlight(value: &str, query: &str) -> String {
    let query = query.trim();
    if query.is_empty() {
        return value.to_string();
    }
    let lower = value.to_lowercase();
    // Lowercasing can change byte lengths; only highlight when offsets line up.
    if lower.len() != value.len() {
        return value.to_string();
    }
    match lower.find(&query.to_lowercase()) {
        Some(start) => {
            let end = start + query.to_lowercase().len();
            if !value.is_char_boundary(start) || !value.is_char_boundary(end) {
                return value.to_string();
            }
            format!("{}<em>{}</em>{}", &value[..start], &value[start..end], &value[end..])
        }
        None => value.to_string(),
    }
}

/// A JSON column that may arrive as text
pub(crate) fn parse_json_column(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
