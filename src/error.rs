//! Error taxonomy for compilation and execution.
//!
//! Every compile-stage error is raised during compilation and surfaced to
//! the caller as-is. No stage downgrades or swallows another stage's error.

use std::fmt;
use thiserror::Error;

use crate::hooks::HookError;

/// Result type for search operations
pub type SearchResult<T> = Result<T, SearchError>;

/// Where a rejected attribute or filter came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOrigin {
    FacetFilters,
    NumericFilters,
    Facets,
    FacetSearch,
}

impl FilterOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOrigin::FacetFilters => "facetFilters",
            FilterOrigin::NumericFilters => "numericFilters",
            FilterOrigin::Facets => "facets",
            FilterOrigin::FacetSearch => "searchForFacetValues",
        }
    }
}

impl fmt::Display for FilterOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Malformed {origin} filter '{filter}': {reason}")]
    MalformedFilter {
        origin: FilterOrigin,
        filter: String,
        reason: String,
    },

    #[error("Unknown attribute '{attribute}' in {origin}")]
    UnknownAttribute {
        attribute: String,
        origin: FilterOrigin,
    },

    #[error("Type mismatch on '{attribute}': {reason}")]
    TypeMismatch { attribute: String, reason: String },

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    #[error("Invalid sort '{alias}': {reason}")]
    InvalidSort { alias: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Execution failed: {0}")]
    Execution(String),
}

impl SearchError {
    pub(crate) fn malformed(origin: FilterOrigin, filter: impl Into<String>, reason: impl Into<String>) -> Self {
        SearchError::MalformedFilter {
            origin,
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown_attribute(attribute: impl Into<String>, origin: FilterOrigin) -> Self {
        SearchError::UnknownAttribute {
            attribute: attribute.into(),
            origin,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::MalformedFilter { .. } => "malformed_filter",
            SearchError::UnknownAttribute { .. } => "unknown_attribute",
            SearchError::TypeMismatch { .. } => "type_mismatch",
            SearchError::InvalidPagination(_) => "invalid_pagination",
            SearchError::Hook(_) => "hook",
            SearchError::UnknownIndex(_) => "unknown_index",
            SearchError::InvalidSort { .. } => "invalid_sort",
            SearchError::InvalidRequest(_) => "invalid_request",
            SearchError::Config(_) => "config",
            SearchError::Execution(_) => "execution",
        }
    }
}

impl From<sqlx::Error> for SearchError {
    fn from(err: sqlx::Error) -> Self {
        SearchError::Execution(err.to_string())
    }
}
