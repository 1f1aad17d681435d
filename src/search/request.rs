//! Wire request types (InstantSearch search parameters).
//!
//! Only presentation parameters can be set per request. Allow-lists, table
//! names and identifiers come from [`IndexSettings`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::facet_compiler::FacetOptions;
use crate::config::{IndexSettings, SortFacetValuesBy};
use crate::error::{SearchError, SearchResult};

/// Search parameters of one query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facet_filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_values_per_facet: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_facet_values_by: Option<SortFacetValuesBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_facet_hits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits_per_page: Option<i64>,
    /// Partial value for `searchForFacetValues`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facet_query: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Decode wire JSON
    pub fn from_value(value: Value) -> SearchResult<Self> {
        serde_json::from_value(value).map_err(|e| SearchError::InvalidRequest(e.to_string()))
    }

    pub fn facet_filters(mut self, filters: Value) -> Self {
        self.facet_filters = Some(filters);
        self
    }

    pub fn numeric_filters(mut self, filters: Value) -> Self {
        self.numeric_filters = Some(filters);
        self
    }

    pub fn facets(mut self, facets: Value) -> Self {
        self.facets = Some(facets);
        self
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn hits_per_page(mut self, hits_per_page: i64) -> Self {
        self.hits_per_page = Some(hits_per_page);
        self
    }

    /// Settings defaults overridden by the request
    pub fn facet_options(&self, settings: &IndexSettings) -> FacetOptions {
        let defaults = FacetOptions::from_settings(settings);
        FacetOptions {
            max_values_per_facet: self.max_values_per_facet.unwrap_or(defaults.max_values_per_facet),
            sort_facet_values_by: self.sort_facet_values_by.unwrap_or(defaults.sort_facet_values_by),
            max_facet_hits: self.max_facet_hits.unwrap_or(defaults.max_facet_hits),
        }
    }

    pub fn pagination(&self, settings: &IndexSettings) -> SearchResult<Pagination> {
        let page = self.page.unwrap_or(0);
        if page < 0 {
            return Err(SearchError::InvalidPagination(format!("page must be >= 0, got {}", page)));
        }
        let hits_per_page = self.hits_per_page.unwrap_or(i64::from(settings.hits_per_page));
        if hits_per_page < 1 || hits_per_page > i64::from(settings.max_hits_per_page) {
            return Err(SearchError::InvalidPagination(format!(
                "hitsPerPage must be in 1..={}, got {}",
                settings.max_hits_per_page, hits_per_page
            )));
        }
        let page = u32::try_from(page)
            .map_err(|_| SearchError::InvalidPagination(format!("page {} is too large", page)))?;
        Ok(Pagination {
            page,
            hits_per_page: hits_per_page as u32,
        })
    }

    /// URL-encoded query string for the response `params` field. Keys are
    /// sorted; strings are sent raw and every other value as compact JSON.
    pub fn to_params(&self) -> String {
        let Ok(Value::Object(fields)) = serde_json::to_value(self) else {
            return String::new();
        };
        let mut pairs: Vec<_> = fields.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
            .into_iter()
            .map(|(key, value)| {
                let raw = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                format!("{}={}", percent_encode(&key), percent_encode(&raw))
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Decode a URL-encoded `params` string as sent by the Algolia clients.
    /// Values that parse as JSON are taken as JSON; `query` and `facetQuery`
    /// are always text.
    pub fn from_params(params: &str) -> SearchResult<Self> {
        let mut fields = serde_json::Map::new();
        for pair in params.split('&').filter(|p| !p.is_empty()) {
            let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let key = percent_decode(key)?;
            let raw = percent_decode(raw)?;
            let value = match key.as_str() {
                "query" | "facetQuery" => Value::String(raw),
                _ => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            };
            fields.insert(key, value);
        }
        Self::from_value(Value::Object(fields))
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(input: &str) -> SearchResult<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let byte = input
                    .get(i + 1..i + 3)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| SearchError::InvalidRequest(format!("bad percent escape in params at byte {}", i)))?;
                out.push(byte);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| SearchError::InvalidRequest("params are not valid UTF-8".into()))
}

/// `params` arrives either as an object or as a URL-encoded string
fn deserialize_params<'de, D>(deserializer: D) -> Result<SearchRequest, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Params {
        Encoded(String),
        Object(SearchRequest),
    }

    match Params::deserialize(deserializer)? {
        Params::Encoded(params) => SearchRequest::from_params(&params).map_err(serde::de::Error::custom),
        Params::Object(request) => Ok(request),
    }
}

/// Validated 0-indexed pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub hits_per_page: u32,
}

impl Pagination {
    pub fn limit(&self) -> u64 {
        u64::from(self.hits_per_page)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.hits_per_page)
    }

    /// `ceil(nb_hits / hits_per_page)`
    pub fn nb_pages(&self, nb_hits: u64) -> u64 {
        nb_hits.div_ceil(u64::from(self.hits_per_page))
    }
}

/// InstantSearch multi-query body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MultiSearchRequest {
    pub requests: Vec<IndexedRequest>,
}

impl MultiSearchRequest {
    pub fn from_value(value: Value) -> SearchResult<Self> {
        serde_json::from_value(value).map_err(|e| SearchError::InvalidRequest(e.to_string()))
    }
}

/// One query of a multi-query, targeting an index or sort alias
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedRequest {
    pub index_name: String,
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: SearchRequest,
}
