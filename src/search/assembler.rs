// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query Assembler
//!
//! Composes the hits query, the total-count query and the facet/stats
//! aggregations of one request into a [`CompiledQuery`], and shapes raw
//! result rows into a [`SearchResponse`].
//!
//! # Statements
//!
//! ```text
//! [0]      hits     SELECT * FROM "t" WHERE <global> ORDER BY <sort>, "id" ASC LIMIT ? OFFSET ?
//! [1]      count    SELECT COUNT(*) AS nb_hits FROM "t" WHERE <global>     (Exact only)
//! [..]     facets   one aggregation per facet
//! [..]     stats    one aggregation per numeric attribute
//! ```
//!
//! The same aggregations are also available as a single statement
//! ([`CompiledQuery::aggregate_statement`]), one CTE per aggregation:
//!
//! ```sql
//! WITH facet_0 AS (...), stats_0 AS (...)
//! SELECT CAST(json_object('brand', ...) AS TEXT) AS facets,
//!        CAST(json_object('price', ...) AS TEXT) AS facets_stats
//! ```
//!
//! Execution strategy is up to the executor; both forms shape into the same
//! response.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::facet_compiler::FacetAggregation;
use super::request::{Pagination, SearchRequest};
use super::response::{
    count_from_rows, facet_counts, parse_json_column, shape_hit, stats_from_row, value_to_f64, value_to_u64,
    FacetStats, SearchResponse, NB_HITS, NB_HITS_TOTAL,
};
use super::sort::SortAlias;
use super::stats_compiler::StatsAggregation;
use crate::config::{CountStrategy, IndexSettings};
use crate::error::{SearchError, SearchResult};
use crate::executor::Row;
use crate::hooks::{HookContext, HookName, HookRegistry};
use crate::metrics;
use crate::sql::{SqlDialect, SqlFragment, SqlParam};

/// Request-level metadata carried through to the response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    /// Index name as requested (sort alias included)
    pub index: String,
    pub query: String,
    pub params: String,
    pub pagination: Pagination,
    pub object_id_attribute: String,
    pub count_strategy: CountStrategy,
    pub rendering_content: Option<Value>,
}

impl ResponseMeta {
    pub fn new(settings: &IndexSettings, index: &str, request: &SearchRequest, pagination: Pagination) -> Self {
        Self {
            index: index.to_string(),
            query: request.query.clone(),
            params: request.to_params(),
            pagination,
            object_id_attribute: settings.object_id_attribute.clone(),
            count_strategy: settings.count_strategy,
            rendering_content: settings.rendering_content.clone(),
        }
    }
}

/// Everything needed to execute one search and shape its result.
///
/// Parameter bindings are request-specific; never reuse across requests.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub dialect: SqlDialect,
    pub hits: SqlFragment,
    /// Total count. Always compiled; executed up front only for
    /// [`CountStrategy::Exact`].
    pub count: SqlFragment,
    pub facets: Vec<FacetAggregation>,
    pub stats: Vec<StatsAggregation>,
    /// Facets and stats as one statement; `None` when there are neither
    pub aggregate: Option<SqlFragment>,
    pub meta: ResponseMeta,
}

impl CompiledQuery {
    /// Statements to execute, in order: hits, count (Exact), facets, stats.
    pub fn statements(&self) -> Vec<SqlFragment> {
        let mut statements = Vec::with_capacity(2 + self.facets.len() + self.stats.len());
        statements.push(self.hits.clone());
        if self.meta.count_strategy == CountStrategy::Exact {
            statements.push(self.count.clone());
        }
        statements.extend(self.facets.iter().map(|f| f.fragment.clone()));
        statements.extend(self.stats.iter().map(|s| s.fragment.clone()));
        statements
    }

    pub fn aggregate_statement(&self) -> Option<&SqlFragment> {
        self.aggregate.as_ref()
    }

    /// Count query to run when a windowed page came back empty: the
    /// window column cannot report totals without rows.
    pub fn count_fallback(&self, hit_rows: &[Row]) -> Option<&SqlFragment> {
        let windowed = self.meta.count_strategy == CountStrategy::Windowed;
        (windowed && hit_rows.is_empty() && self.meta.pagination.offset() > 0).then_some(&self.count)
    }

    /// Shape the results of [`CompiledQuery::statements`].
    ///
    /// `fallback_count` is the row set of [`CompiledQuery::count_fallback`]
    /// when it was executed.
    pub fn shape(
        &self,
        results: Vec<Vec<Row>>,
        fallback_count: Option<Vec<Row>>,
        processing_time_ms: u64,
    ) -> SearchResult<SearchResponse> {
        let expected = self.statements().len();
        if results.len() != expected {
            return Err(SearchError::Execution(format!(
                "expected {} result sets, got {}",
                expected,
                results.len()
            )));
        }

        let mut results = results.into_iter();
        let hit_rows = results.next().unwrap_or_default();
        let nb_hits = match self.meta.count_strategy {
            CountStrategy::Exact => {
                let count_rows = results.next().unwrap_or_default();
                count_from_rows(&count_rows, NB_HITS).unwrap_or(0)
            }
            CountStrategy::Windowed => count_from_rows(&hit_rows, NB_HITS_TOTAL)
                .or_else(|| fallback_count.and_then(|rows| count_from_rows(&rows, NB_HITS)))
                .unwrap_or(0),
        };

        let facets = self
            .facets
            .iter()
            .zip(results.by_ref())
            .map(|(facet, rows)| (facet.attribute.clone(), facet_counts(&rows)))
            .collect();
        let facets_stats = self
            .stats
            .iter()
            .zip(results)
            .map(|(stats, rows)| (stats.attribute.clone(), stats_from_row(rows.first())))
            .collect();

        Ok(self.response(hit_rows, nb_hits, facets, facets_stats, processing_time_ms))
    }

    /// Shape hits plus the single row of [`CompiledQuery::aggregate_statement`].
    pub fn shape_aggregated(
        &self,
        hit_rows: Vec<Row>,
        nb_hits: u64,
        aggregate_row: Option<&Row>,
        processing_time_ms: u64,
    ) -> SearchResponse {
        let (facets, facets_stats) = aggregate_row.map(parse_aggregate_row).unwrap_or_default();
        self.response(hit_rows, nb_hits, facets, facets_stats, processing_time_ms)
    }

    fn response(
        &self,
        hit_rows: Vec<Row>,
        nb_hits: u64,
        facets: BTreeMap<String, BTreeMap<String, u64>>,
        facets_stats: BTreeMap<String, Option<FacetStats>>,
        processing_time_ms: u64,
    ) -> SearchResponse {
        let pagination = self.meta.pagination;
        let hits: Vec<Value> = hit_rows
            .into_iter()
            .map(|row| shape_hit(row, &self.meta.object_id_attribute))
            .collect();
        metrics::record_hits(hits.len());

        SearchResponse {
            hits,
            nb_hits,
            page: pagination.page,
            nb_pages: pagination.nb_pages(nb_hits),
            hits_per_page: pagination.hits_per_page,
            facets,
            facets_stats,
            processing_time_ms,
            exhaustive_nb_hits: true,
            exhaustive_facets_count: true,
            query: self.meta.query.clone(),
            params: self.meta.params.clone(),
            index: self.meta.index.clone(),
            rendering_content: self.meta.rendering_content.clone(),
        }
    }
}

/// Decode the `facets` and `facets_stats` JSON columns of the aggregate row.
pub fn parse_aggregate_row(
    row: &Row,
) -> (BTreeMap<String, BTreeMap<String, u64>>, BTreeMap<String, Option<FacetStats>>) {
    let facets = match parse_json_column(row.get("facets")) {
        Value::Object(map) => map
            .into_iter()
            .map(|(attribute, values)| {
                let counts = match values {
                    Value::Object(values) => values
                        .into_iter()
                        .filter_map(|(value, count)| value_to_u64(&count).map(|c| (value, c)))
                        .collect(),
                    _ => BTreeMap::new(),
                };
                (attribute, counts)
            })
            .collect(),
        _ => BTreeMap::new(),
    };

    let facets_stats = match parse_json_column(row.get("facets_stats")) {
        Value::Object(map) => map
            .into_iter()
            .map(|(attribute, stats)| (attribute, stats_from_object(&stats)))
            .collect(),
        _ => BTreeMap::new(),
    };

    (facets, facets_stats)
}

fn stats_from_object(stats: &Value) -> Option<FacetStats> {
    let get = |name: &str| stats.get(name).and_then(value_to_f64);
    Some(FacetStats {
        min: get("min")?,
        max: get("max")?,
        avg: get("avg")?,
        sum: get("sum")?,
    })
}

/// Builds [`CompiledQuery`]s for one index table
pub struct QueryAssembler<'a> {
    dialect: SqlDialect,
    table: &'a str,
    hooks: &'a HookRegistry,
}

impl<'a> QueryAssembler<'a> {
    pub fn new(dialect: SqlDialect, table: &'a str, hooks: &'a HookRegistry) -> Self {
        Self { dialect, table, hooks }
    }

    /// Assemble the hits, count and aggregate statements. Each passes
    /// through the `query.assembled` hook.
    pub fn assemble(
        &self,
        hits_predicate: &SqlFragment,
        facets: Vec<FacetAggregation>,
        stats: Vec<StatsAggregation>,
        sort: &SortAlias,
        meta: ResponseMeta,
    ) -> SearchResult<CompiledQuery> {
        let table = self.dialect.quote_ident(self.table);
        let where_clause = if hits_predicate.is_always_true() {
            String::new()
        } else {
            format!(" WHERE {}", hits_predicate.sql)
        };

        let select = match meta.count_strategy {
            CountStrategy::Exact => "*".to_string(),
            CountStrategy::Windowed => format!("{}.*, COUNT(*) OVER () AS {}", table, NB_HITS_TOTAL),
        };
        let hits_sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
            select,
            table,
            where_clause,
            sort.order_by(self.dialect, &meta.object_id_attribute),
        );
        let mut hits_params = hits_predicate.params.clone();
        hits_params.push(SqlParam::Integer(to_i64(meta.pagination.limit())));
        hits_params.push(SqlParam::Integer(to_i64(meta.pagination.offset())));
        let hits = self.hook(SqlFragment::query(hits_sql, hits_params), "hits")?;

        let count_sql = format!("SELECT COUNT(*) AS {} FROM {}{}", NB_HITS, table, where_clause);
        let count = self.hook(SqlFragment::query(count_sql, hits_predicate.params.clone()), "count")?;

        let aggregate = match self.aggregate(&facets, &stats) {
            Some(fragment) => Some(self.hook(fragment, "aggregate")?),
            None => None,
        };

        metrics::record_facet_aggregations(facets.len());
        debug!(
            table = %self.table,
            facets = facets.len(),
            stats = stats.len(),
            page = meta.pagination.page,
            "Assembled query"
        );

        Ok(CompiledQuery {
            dialect: self.dialect,
            hits,
            count,
            facets,
            stats,
            aggregate,
            meta,
        })
    }

    fn hook(&self, fragment: SqlFragment, label: &'static str) -> SearchResult<SqlFragment> {
        let context = HookContext::new(HookName::AssembledQuery, self.table, label);
        Ok(self.hooks.invoke(fragment, &context)?)
    }

    /// One `WITH` statement JSON-aggregating every facet and stats CTE.
    fn aggregate(&self, facets: &[FacetAggregation], stats: &[StatsAggregation]) -> Option<SqlFragment> {
        if facets.is_empty() && stats.is_empty() {
            return None;
        }
        let dialect = self.dialect;
        let mut ctes = Vec::with_capacity(facets.len() + stats.len());
        let mut params = Vec::new();
        let mut facet_pairs = Vec::with_capacity(facets.len());
        let mut stats_pairs = Vec::with_capacity(stats.len());

        for (i, facet) in facets.iter().enumerate() {
            let name = format!("facet_{}", i);
            ctes.push(format!("{} AS ({})", name, facet.fragment.sql));
            params.extend(facet.fragment.params.iter().cloned());
            facet_pairs.push((
                facet.attribute.clone(),
                dialect.json_object_agg("facet_value", "facet_count", &name),
            ));
        }

        let stat_fields: Vec<(String, String)> = ["min", "max", "avg", "sum"]
            .iter()
            .map(|field| (field.to_string(), format!("stat_{}", field)))
            .collect();
        for (i, stat) in stats.iter().enumerate() {
            let name = format!("stats_{}", i);
            ctes.push(format!("{} AS ({})", name, stat.fragment.sql));
            params.extend(stat.fragment.params.iter().cloned());
            let object = format!(
                "SELECT CASE WHEN stat_min IS NULL THEN NULL ELSE {} END FROM {}",
                dialect.json_object(&stat_fields),
                name
            );
            stats_pairs.push((stat.attribute.clone(), dialect.json_subquery(&object)));
        }

        let sql = format!(
            "WITH {} SELECT CAST({} AS {text}) AS facets, CAST({} AS {text}) AS facets_stats",
            ctes.join(", "),
            dialect.json_object(&facet_pairs),
            dialect.json_object(&stats_pairs),
            text = dialect.text_type(),
        );
        Some(SqlFragment::query(sql, params))
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::facet_compiler::{FacetCompiler, FacetDescriptor, FacetOptions};
    use crate::search::filter_compiler::FilterCompiler;
    use crate::search::normalizer::normalize;
    use crate::search::stats_compiler::StatsCompiler;
    use serde_json::json;

    fn settings() -> IndexSettings {
        IndexSettings::new("products")
            .facet("color")
            .facet("brand")
            .numeric("price")
            .sortable("price")
    }

    fn compile(settings: &IndexSettings, request: &SearchRequest, alias: &str) -> CompiledQuery {
        let dialect = SqlDialect::Sqlite;
        let hooks = HookRegistry::new();
        let facets: Vec<String> = settings.facet_names().collect();
        let refinements = normalize(
            request.facet_filters.as_ref(),
            request.numeric_filters.as_ref(),
            &facets,
            &settings.numeric_attributes_for_filtering,
        )
        .unwrap();
        let allowed = settings.filterable_attributes();
        let filters = FilterCompiler::new(dialect, "products", &allowed, &hooks)
            .compile(&refinements, None)
            .unwrap();
        let options = FacetOptions::from_settings(settings);
        let facets = FacetDescriptor::resolve(request.facets.as_ref(), settings, options)
            .unwrap()
            .iter()
            .filter_map(|d| {
                FacetCompiler::new(dialect, "products", &hooks)
                    .compile_facet(d, &filters, &refinements)
                    .unwrap()
            })
            .collect();
        let stats = StatsCompiler::new(dialect, "products", &hooks)
            .compile_all(&settings.numeric_attributes_for_filtering, &filters)
            .unwrap();
        let sort = SortAlias::parse(alias, &settings.effective_sortable()).unwrap();
        let pagination = request.pagination(settings).unwrap();
        let meta = ResponseMeta::new(settings, alias, request, pagination);
        QueryAssembler::new(dialect, "products", &hooks)
            .assemble(&filters.global.fragment, facets, stats, &sort, meta)
            .unwrap()
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row fixtures are objects"),
        }
    }

    #[test]
    fn test_hits_and_count_queries() {
        let request = SearchRequest::default()
            .facet_filters(json!(["color:red"]))
            .page(2)
            .hits_per_page(10);
        let compiled = compile(&settings(), &request, "products?sort=price+desc");

        assert_eq!(
            compiled.hits.sql,
            "SELECT * FROM \"products\" WHERE \"color\" IN (?) ORDER BY \"price\" DESC, \"id\" ASC LIMIT ? OFFSET ?"
        );
        assert_eq!(
            compiled.hits.params,
            vec![
                SqlParam::Text("red".into()),
                SqlParam::Integer(10),
                SqlParam::Integer(20)
            ]
        );
        assert_eq!(
            compiled.count.sql,
            "SELECT COUNT(*) AS nb_hits FROM \"products\" WHERE \"color\" IN (?)"
        );
        assert!(compiled.aggregate.is_some());
    }

    #[test]
    fn test_statement_order() {
        let request = SearchRequest::default().facets(json!(["color", "brand"]));
        let compiled = compile(&settings(), &request, "products");
        let statements = compiled.statements();
        assert_eq!(statements.len(), 5);
        assert_eq!(statements[0], compiled.hits);
        assert_eq!(statements[1], compiled.count);
        assert_eq!(statements[2], compiled.facets[0].fragment);
        assert_eq!(statements[4], compiled.stats[0].fragment);
        for statement in &statements {
            assert_eq!(statement.placeholder_count(), statement.params.len());
        }
    }

    #[test]
    fn test_shape_response() {
        let request = SearchRequest::default().facets(json!(["color"])).hits_per_page(1);
        let compiled = compile(&settings(), &request, "products");
        let results = vec![
            vec![row(json!({"id": 1, "color": "red"}))],
            vec![row(json!({"nb_hits": 3}))],
            vec![
                row(json!({"facet_value": "red", "facet_count": 2})),
                row(json!({"facet_value": "blue", "facet_count": 1})),
            ],
            vec![row(json!({"stat_min": null, "stat_max": null, "stat_avg": null, "stat_sum": null}))],
        ];
        let response = compiled.shape(results, None, 4).unwrap();
        assert_eq!(response.nb_hits, 3);
        assert_eq!(response.nb_pages, 3);
        assert_eq!(response.hits[0]["objectID"], json!("1"));
        assert_eq!(response.facets["color"]["blue"], 1);
        assert_eq!(response.facets_stats["price"], None);
        assert_eq!(response.processing_time_ms, 4);

        let err = compiled.shape(Vec::new(), None, 0).unwrap_err();
        assert!(matches!(err, SearchError::Execution(_)));
    }

    #[test]
    fn test_windowed_count() {
        let settings = settings().count_strategy(CountStrategy::Windowed);
        let request = SearchRequest::default().page(3);
        let compiled = compile(&settings, &request, "products");
        assert!(compiled
            .hits
            .sql
            .starts_with("SELECT \"products\".*, COUNT(*) OVER () AS nb_hits_total FROM \"products\""));
        assert_eq!(compiled.statements().len(), 2);

        assert!(compiled.count_fallback(&[row(json!({"id": 1}))]).is_none());
        assert_eq!(compiled.count_fallback(&[]), Some(&compiled.count));

        let response = compiled
            .shape(vec![Vec::new(), Vec::new()], Some(vec![row(json!({"nb_hits": 45}))]), 0)
            .unwrap();
        assert!(response.hits.is_empty());
        assert_eq!(response.nb_hits, 45);
        assert_eq!(response.nb_pages, 3);
    }

    #[test]
    fn test_aggregate_statement_shape() {
        let request = SearchRequest::default().facets(json!(["color"]));
        let compiled = compile(&settings(), &request, "products");
        let aggregate = compiled.aggregate_statement().unwrap();
        assert!(aggregate.sql.starts_with("WITH facet_0 AS (SELECT CAST(\"color\" AS TEXT)"));
        assert!(aggregate.sql.contains("stats_0 AS (SELECT CAST(MIN(\"price\")"));
        assert!(aggregate.sql.contains("json_group_object(facet_value, facet_count)"));
        assert!(aggregate.sql.ends_with("AS facets_stats"));
        assert_eq!(aggregate.placeholder_count(), aggregate.params.len());

        let empty = compile(&IndexSettings::new("products"), &SearchRequest::default(), "products");
        assert!(empty.aggregate_statement().is_none());
    }

    #[test]
    fn test_parse_aggregate_row() {
        let aggregate = row(json!({
            "facets": "{\"color\":{\"red\":2,\"blue\":1}}",
            "facets_stats": "{\"price\":{\"min\":1,\"max\":4,\"avg\":2.5,\"sum\":10},\"rating\":null}"
        }));
        let (facets, stats) = parse_aggregate_row(&aggregate);
        assert_eq!(facets["color"]["red"], 2);
        assert_eq!(stats["price"].map(|s| s.sum), Some(10.0));
        assert_eq!(stats["rating"], None);
    }

    #[test]
    fn test_assembled_hook_sees_every_statement() {
        let hooks = HookRegistry::new();
        hooks.register(HookName::AssembledQuery, "tenant", |mut fragment, context| {
            if context.label == "hits" {
                fragment.sql.push_str(" /* tenant */");
            }
            Ok(fragment)
        });
        let settings = settings();
        let request = SearchRequest::default();
        let meta = ResponseMeta::new(&settings, "products", &request, request.pagination(&settings).unwrap());
        let compiled = QueryAssembler::new(SqlDialect::Postgres, "products", &hooks)
            .assemble(
                &SqlFragment::always_true(),
                Vec::new(),
                Vec::new(),
                &SortAlias::parse("products", &[]).unwrap(),
                meta,
            )
            .unwrap();
        assert_eq!(
            compiled.hits.sql,
            "SELECT * FROM \"products\" ORDER BY \"id\" ASC LIMIT ? OFFSET ? /* tenant */"
        );
        assert_eq!(compiled.count.sql, "SELECT COUNT(*) AS nb_hits FROM \"products\"");
    }
}
