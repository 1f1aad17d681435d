//! # Searchbox
//!
//! An InstantSearch-compatible query compiler: search parameters in,
//! parameterized SQL out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Refinement Normalizer                   │
//! │  • facetFilters / numericFilters grammar → AllRefinements  │
//! │  • Allow-list validation (injection defense)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Filter Compiler                       │
//! │  • One predicate per attribute, one per OR group           │
//! │  • Global predicate for hits                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//! ┌───────────────────────────┐ ┌───────────────────────────────┐
//! │      Facet Compiler       │ │        Stats Compiler         │
//! │  • Disjunctive scope      │ │  • min / max / avg / sum      │
//! │  • Hierarchical levels    │ │  • null when nothing matches  │
//! └───────────────────────────┘ └───────────────────────────────┘
//!               └──────────────┬──────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Query Assembler                       │
//! │  • Hits (sort alias, pagination), count, aggregations      │
//! │  • Response shaping                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every stage passes its fragments through the [`HookRegistry`].
//!
//! ## Quick Start
//!
//! ```rust
//! use searchbox::{HookRegistry, IndexSettings, SearchConfig, SearchEngine, SearchRequest, SqlDialect};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let config = SearchConfig {
//!     dialect: SqlDialect::Postgres,
//!     indices: vec![IndexSettings::new("products")
//!         .facet("color")
//!         .facet("brand")
//!         .numeric("price")],
//! };
//! let engine = SearchEngine::new(config, Arc::new(HookRegistry::new())).unwrap();
//!
//! let request = SearchRequest::default()
//!     .facet_filters(json!([["color:red", "color:blue"], "brand:-X"]))
//!     .facets(json!(["*"]));
//! let compiled = engine.compile("products", &request).unwrap();
//!
//! assert_eq!(compiled.facets.len(), 2);
//! println!("{}", compiled.hits.render(SqlDialect::Postgres));
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`SearchEngine`] tying the stages together
//! - [`search`]: Normalizer, compilers, assembler, wire types
//! - [`hooks`]: Named extension points
//! - [`sql`]: Fragments, parameters and dialects
//! - [`executor`]: Execution collaborator trait and the SQLx implementation
//! - [`config`]: Index settings and allow-lists

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod metrics;
pub mod search;
pub mod sql;

pub use config::{CountStrategy, ExtendedAttribute, FacetAttribute, IndexSettings, SearchConfig, SortFacetValuesBy};
pub use engine::SearchEngine;
pub use error::{FilterOrigin, SearchError, SearchResult};
pub use executor::{RetryPolicy, Row, SearchExecutor, SqlxExecutor};
pub use hooks::{HookContext, HookError, HookName, HookRegistry};
pub use metrics::LatencyTimer;
pub use search::{
    AllRefinements, CompiledQuery, FacetSearchResponse, MultiSearchRequest, MultiSearchResponse, SearchRequest,
    SearchResponse,
};
pub use sql::{FragmentKind, SqlDialect, SqlFragment, SqlParam};
