//! Search engine.
//!
//! The [`SearchEngine`] ties the compiler stages together for every
//! configured index and runs compiled queries through a [`SearchExecutor`].
//!
//! # Pipeline
//!
//! ```text
//! index name ─→ SortAlias ─┐
//! request ─→ normalize ─→ FilterCompiler ─┬─→ FacetCompiler ─┬─→ QueryAssembler ─→ CompiledQuery
//!                                         └─→ StatsCompiler ─┘
//! ```
//!
//! Compilation is synchronous and touches no shared mutable state apart
//! from reading the hook registry. Only [`SearchEngine::search`] and friends
//! await the executor.
//!
//! # Example
//!
//! ```rust,no_run
//! use searchbox::{HookRegistry, IndexSettings, SearchConfig, SearchEngine, SearchRequest, SqlDialect};
//! use searchbox::executor::SqlxExecutor;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), searchbox::SearchError> {
//! let config = SearchConfig {
//!     dialect: SqlDialect::Sqlite,
//!     indices: vec![IndexSettings::new("products").facet("brand").numeric("price")],
//! };
//! let engine = SearchEngine::new(config, Arc::new(HookRegistry::new()))?;
//! let executor = SqlxExecutor::connect("sqlite://products.db").await?;
//!
//! let request = SearchRequest::new("shoe").facets(json!(["brand"]));
//! let response = engine.search(&executor, "products?sort=price+asc", &request).await?;
//! println!("{} hits", response.nb_hits);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{IndexSettings, SearchConfig};
use crate::error::{FilterOrigin, SearchError, SearchResult};
use crate::executor::SearchExecutor;
use crate::hooks::{HookName, HookRegistry};
use crate::metrics::{self, LatencyTimer};
use crate::search::{
    facet_hits, AllRefinements, CompiledQuery, Condition, FacetCompiler, FacetDescriptor, FacetSearchQuery,
    FacetSearchResponse, FilterCompiler, FilterSet, MultiSearchRequest, MultiSearchResponse, QueryAssembler,
    ResponseMeta, SearchRequest, SearchResponse, SortAlias, StatsCompiler,
};

pub struct SearchEngine {
    config: SearchConfig,
    hooks: Arc<HookRegistry>,
}

impl SearchEngine {
    /// Create an engine. Fails if the configuration does not validate.
    pub fn new(config: SearchConfig, hooks: Arc<HookRegistry>) -> SearchResult<Self> {
        config.validate()?;
        let registered: usize = HookName::ALL.iter().map(|hook| hooks.len(*hook)).sum();
        metrics::set_registered_hooks(registered);
        debug!(
            dialect = %config.dialect,
            indices = config.indices.len(),
            hooks = registered,
            "Created search engine"
        );
        Ok(Self { config, hooks })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Compile a request against `index_name` (optionally a sort alias).
    #[tracing::instrument(skip(self, request), fields(query = %request.query))]
    pub fn compile(&self, index_name: &str, request: &SearchRequest) -> SearchResult<CompiledQuery> {
        let _timer = LatencyTimer::new("compile");
        let result = self.compile_query(index_name, request);
        observe_compile(index_name, &result);
        result
    }

    /// Compile a facet value search over the `searchable()` facet `facet_name`.
    #[tracing::instrument(skip(self, request))]
    pub fn compile_facet_search(
        &self,
        index_name: &str,
        facet_name: &str,
        request: &SearchRequest,
    ) -> SearchResult<FacetSearchQuery> {
        let _timer = LatencyTimer::new("facet_search");
        let result = self.compile_facet_search_query(index_name, facet_name, request);
        observe_compile(index_name, &result);
        result
    }

    /// Compile, execute and shape one search.
    pub async fn search<E>(&self, executor: &E, index_name: &str, request: &SearchRequest) -> SearchResult<SearchResponse>
    where
        E: SearchExecutor + ?Sized,
    {
        let result = self.run_search(executor, index_name, request).await;
        observe_search(index_name, &result);
        result
    }

    /// InstantSearch `searchForFacetValues`.
    pub async fn search_for_facet_values<E>(
        &self,
        executor: &E,
        index_name: &str,
        facet_name: &str,
        request: &SearchRequest,
    ) -> SearchResult<FacetSearchResponse>
    where
        E: SearchExecutor + ?Sized,
    {
        let result = self.run_facet_search(executor, index_name, facet_name, request).await;
        observe_search(index_name, &result);
        result
    }

    /// InstantSearch multi-query. Queries run in order; the first failure
    /// fails the whole batch.
    pub async fn multi_search<E>(&self, executor: &E, body: &MultiSearchRequest) -> SearchResult<MultiSearchResponse>
    where
        E: SearchExecutor + ?Sized,
    {
        let mut results = Vec::with_capacity(body.requests.len());
        for request in &body.requests {
            results.push(self.search(executor, &request.index_name, &request.params).await?);
        }
        Ok(MultiSearchResponse { results })
    }

    fn settings(&self, index_name: &str) -> SearchResult<&IndexSettings> {
        let base = index_name.split_once('?').map_or(index_name, |(base, _)| base);
        self.config
            .index(base)
            .ok_or_else(|| SearchError::UnknownIndex(base.to_string()))
    }

    fn compile_query(&self, index_name: &str, request: &SearchRequest) -> SearchResult<CompiledQuery> {
        let settings = self.settings(index_name)?;
        let dialect = self.config.dialect;
        let sort = SortAlias::parse(index_name, &settings.effective_sortable())?;
        let pagination = request.pagination(settings)?;
        let (refinements, filters) = self.compile_filters(settings, request)?;

        let descriptors = FacetDescriptor::resolve(request.facets.as_ref(), settings, request.facet_options(settings))?;
        let facet_compiler = FacetCompiler::new(dialect, &settings.name, &self.hooks)
            .extended_attributes(&settings.object_id_attribute, &settings.extended_attributes);
        let mut facets = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            if let Some(aggregation) = facet_compiler.compile_facet(descriptor, &filters, &refinements)? {
                facets.push(aggregation);
            }
        }

        let stats = StatsCompiler::new(dialect, &settings.name, &self.hooks)
            .extended_attributes(&settings.object_id_attribute, &settings.extended_attributes)
            .compile_all(&settings.numeric_attributes_for_filtering, &filters)?;

        let meta = ResponseMeta::new(settings, index_name, request, pagination);
        QueryAssembler::new(dialect, &settings.name, &self.hooks).assemble(
            &filters.global.fragment,
            facets,
            stats,
            &sort,
            meta,
        )
    }

    fn compile_facet_search_query(
        &self,
        index_name: &str,
        facet_name: &str,
        request: &SearchRequest,
    ) -> SearchResult<FacetSearchQuery> {
        let settings = self.settings(index_name)?;
        if settings.facet_attribute(facet_name).is_none() {
            return Err(SearchError::unknown_attribute(facet_name, FilterOrigin::FacetSearch));
        }
        let descriptor = FacetDescriptor::for_attribute(settings, facet_name, request.facet_options(settings))?;
        let (refinements, filters) = self.compile_filters(settings, request)?;
        FacetCompiler::new(self.config.dialect, &settings.name, &self.hooks)
            .extended_attributes(&settings.object_id_attribute, &settings.extended_attributes)
            .compile_facet_search(
                &descriptor,
                &filters,
                &refinements,
                request.facet_query.as_deref().unwrap_or_default(),
            )
    }

    fn compile_filters(
        &self,
        settings: &IndexSettings,
        request: &SearchRequest,
    ) -> SearchResult<(AllRefinements, FilterSet)> {
        let facet_names: Vec<String> = settings.facet_names().collect();
        let refinements = crate::search::normalize(
            request.facet_filters.as_ref(),
            request.numeric_filters.as_ref(),
            &facet_names,
            &settings.numeric_attributes_for_filtering,
        )?;
        let text = Condition::text(&settings.searchable_attributes, &request.query);
        let allowed = settings.filterable_attributes();
        let filters = FilterCompiler::new(self.config.dialect, &settings.name, &allowed, &self.hooks)
            .extended_attributes(&settings.object_id_attribute, &settings.extended_attributes)
            .compile(&refinements, text)?;
        Ok((refinements, filters))
    }

    fn check_dialect<E: SearchExecutor + ?Sized>(&self, executor: &E) -> SearchResult<()> {
        if executor.dialect() != self.config.dialect {
            return Err(SearchError::Config(format!(
                "executor dialect {} does not match configured dialect {}",
                executor.dialect(),
                self.config.dialect
            )));
        }
        Ok(())
    }

    async fn run_search<E>(&self, executor: &E, index_name: &str, request: &SearchRequest) -> SearchResult<SearchResponse>
    where
        E: SearchExecutor + ?Sized,
    {
        self.check_dialect(executor)?;
        let compiled = self.compile(index_name, request)?;

        let start = Instant::now();
        let results = executor.execute_batch(&compiled.statements()).await?;
        let fallback = match compiled.count_fallback(results.first().map_or(&[][..], Vec::as_slice)) {
            Some(count) => executor.execute_batch(std::slice::from_ref(count)).await?.pop(),
            None => None,
        };
        let processing_time_ms = elapsed_ms(start);

        let response = compiled.shape(results, fallback, processing_time_ms)?;
        debug!(
            index = %index_name,
            nb_hits = response.nb_hits,
            hits = response.hits.len(),
            processing_time_ms,
            "Search complete"
        );
        Ok(response)
    }

    async fn run_facet_search<E>(
        &self,
        executor: &E,
        index_name: &str,
        facet_name: &str,
        request: &SearchRequest,
    ) -> SearchResult<FacetSearchResponse>
    where
        E: SearchExecutor + ?Sized,
    {
        self.check_dialect(executor)?;
        let compiled = self.compile_facet_search(index_name, facet_name, request)?;

        let start = Instant::now();
        let mut results = executor.execute_batch(std::slice::from_ref(&compiled.fragment)).await?;
        let rows = results.pop().unwrap_or_default();
        Ok(FacetSearchResponse {
            facet_hits: facet_hits(&rows, &compiled.facet_query),
            exhaustive_facets_count: true,
            processing_time_ms: elapsed_ms(start),
        })
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn observe_compile<T>(index_name: &str, result: &SearchResult<T>) {
    match result {
        Ok(_) => metrics::record_compile(index_name, "success"),
        Err(err) => {
            metrics::record_compile(index_name, "error");
            metrics::record_error(err.kind());
            warn!(index = %index_name, error = %err, "Compilation failed");
        }
    }
}

fn observe_search<T>(index_name: &str, result: &SearchResult<T>) {
    match result {
        Ok(_) => metrics::record_search(index_name, "success"),
        Err(err) => {
            metrics::record_search(index_name, "error");
            if matches!(err, SearchError::Execution(_)) {
                metrics::record_error(err.kind());
                warn!(index = %index_name, error = %err, "Search execution failed");
            }
        }
    }
}
