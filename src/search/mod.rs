// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query compiler
//!
//! Translates InstantSearch search parameters into parameterized SQL.
//!
//! # Architecture
//!
//! ```text
//! facetFilters / numericFilters
//!     ↓
//! normalize ─→ AllRefinements (OR / AND / AND NOT / RANGES per attribute)
//!     ↓
//! FilterCompiler ─→ FilterSet (per attribute + global predicate)
//!     ├─→ FacetCompiler  (scope: every other attribute)
//!     └─→ StatsCompiler  (scope: every other attribute)
//!     ↓
//! QueryAssembler ─→ CompiledQuery ─→ executor ─→ SearchResponse
//! ```
//!
//! # Filter grammar
//!
//! ```text
//! ["color:red", "brand:-X"]          color = red AND brand <> X
//! [["color:red", "color:blue"]]      color IN (red, blue)
//! ["price>=10", "price<=50"]         RANGES on price
//! [["price=10", "price=20"]]         price IN (10, 20)
//! ["price:10 TO 50"]                 interval, same as >= 10 AND <= 50
//! ```

mod assembler;
mod condition;
mod facet_compiler;
mod filter_compiler;
mod normalizer;
mod refinements;
mod request;
mod response;
mod sort;
mod stats_compiler;

pub use assembler::{parse_aggregate_row, CompiledQuery, QueryAssembler, ResponseMeta};
pub use condition::{Condition, TableLayout};
pub use facet_compiler::{
    FacetAggregation, FacetCompiler, FacetDescriptor, FacetOptions, FacetSearchQuery, HierarchyLevel,
};
pub use filter_compiler::{CompiledPredicate, FilterCompiler, FilterSet};
pub use normalizer::{normalize, FilterClause};
pub use refinements::{
    AllRefinements, Disjunction, NumericValue, Operator, RangeBound, Refinement, RefinementValue, Refinements,
};
pub use request::{IndexedRequest, MultiSearchRequest, Pagination, SearchRequest};
pub use response::{
    facet_counts, facet_hits, highlight, stats_from_row, FacetHit, FacetSearchResponse, FacetStats,
    MultiSearchResponse, SearchResponse,
};
pub use sort::{SortAlias, SortKey};
pub use stats_compiler::{StatsAggregation, StatsCompiler};
