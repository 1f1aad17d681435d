//! Configuration for the search engine.
//!
//! # Example
//!
//! ```
//! use searchbox::{IndexSettings, SearchConfig, SqlDialect};
//!
//! // Minimal config (uses defaults)
//! let config = SearchConfig::default();
//! assert_eq!(config.dialect, SqlDialect::Postgres);
//!
//! // One index, built like a schema
//! let config = SearchConfig {
//!     dialect: SqlDialect::Sqlite,
//!     indices: vec![IndexSettings::new("products")
//!         .facet("color")
//!         .searchable_facet("brand")
//!         .numeric("price")
//!         .text("name")],
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! Allow-lists (`attributes_for_faceting`, `numeric_attributes_for_filtering`)
//! only come from here. Requests may tune presentation parameters but never
//! widen what can be filtered on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{SearchError, SearchResult};
use crate::sql::SqlDialect;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// SQL dialect of the backing store
    #[serde(default)]
    pub dialect: SqlDialect,

    /// One entry per searchable table
    #[serde(default)]
    pub indices: Vec<IndexSettings>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dialect: SqlDialect::default(),
            indices: Vec::new(),
        }
    }
}

impl SearchConfig {
    pub fn index(&self, name: &str) -> Option<&IndexSettings> {
        self.indices.iter().find(|i| i.name == name)
    }

    /// Check every index and reject duplicate names.
    pub fn validate(&self) -> SearchResult<()> {
        let mut seen = HashSet::new();
        for index in &self.indices {
            index.validate()?;
            if !seen.insert(index.name.as_str()) {
                return Err(SearchError::Config(format!("duplicate index '{}'", index.name)));
            }
        }
        Ok(())
    }
}

/// How facet values are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortFacetValuesBy {
    /// Count descending, then value ascending
    #[default]
    Count,
    /// Value ascending
    Alpha,
}

/// How `nbHits` is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountStrategy {
    /// Separate `COUNT(*)` query
    #[default]
    Exact,
    /// `COUNT(*) OVER ()` column on the hits query
    Windowed,
}

/// One `attributesForFaceting` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetAttribute {
    pub name: String,
    /// `searchable(attr)`: facet values can be searched
    pub searchable: bool,
    /// `filterOnly(attr)`: filterable, never aggregated
    pub filter_only: bool,
}

impl FacetAttribute {
    /// Parse `attr`, `searchable(attr)` or `filterOnly(attr)`.
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        let modifier = |prefix: &str| {
            entry
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('('))
                .and_then(|rest| rest.strip_suffix(')'))
                .map(str::trim)
        };
        if let Some(name) = modifier("searchable") {
            Self {
                name: name.to_string(),
                searchable: true,
                filter_only: false,
            }
        } else if let Some(name) = modifier("filterOnly") {
            Self {
                name: name.to_string(),
                searchable: false,
                filter_only: true,
            }
        } else {
            Self {
                name: entry.to_string(),
                searchable: false,
                filter_only: false,
            }
        }
    }
}

/// A filterable attribute stored in a join table, one row per value:
/// `join_table(foreign_key -> index.objectID, column)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtendedAttribute {
    pub name: String,
    pub join_table: String,
    pub foreign_key: String,
    /// Value column (defaults to `name`)
    #[serde(default)]
    pub column: Option<String>,
}

impl ExtendedAttribute {
    pub fn new(name: impl Into<String>, join_table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            join_table: join_table.into(),
            foreign_key: foreign_key.into(),
            column: None,
        }
    }

    pub fn column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

/// Settings of one index (table)
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    /// Table name
    pub name: String,

    /// Column returned as `objectID` and used as the final sort key
    #[serde(default = "default_object_id_attribute")]
    pub object_id_attribute: String,

    /// Facet allow-list, with optional `searchable()` / `filterOnly()` modifiers
    #[serde(default)]
    pub attributes_for_faceting: Vec<String>,

    /// Numeric allow-list
    #[serde(default)]
    pub numeric_attributes_for_filtering: Vec<String>,

    /// Columns matched by the free-text `query`
    #[serde(default)]
    pub searchable_attributes: Vec<String>,

    /// Columns usable in sort aliases (empty = faceting + numeric attributes)
    #[serde(default)]
    pub sortable_attributes: Vec<String>,

    /// Level chains, e.g. `[["cat.lvl0", "cat.lvl1", "cat.lvl2"]]`
    #[serde(default)]
    pub hierarchical_facets: Vec<Vec<String>>,

    #[serde(default = "default_hierarchical_separator")]
    pub hierarchical_separator: String,

    #[serde(default = "default_max_values_per_facet")]
    pub max_values_per_facet: u32,

    #[serde(default)]
    pub sort_facet_values_by: SortFacetValuesBy,

    #[serde(default = "default_max_facet_hits")]
    pub max_facet_hits: u32,

    #[serde(default = "default_hits_per_page")]
    pub hits_per_page: u32,

    #[serde(default = "default_max_hits_per_page")]
    pub max_hits_per_page: u32,

    /// Passed through to responses untouched
    #[serde(default)]
    pub rendering_content: Option<Value>,

    #[serde(default)]
    pub count_strategy: CountStrategy,

    /// Facet or numeric attributes that live in join tables
    #[serde(default)]
    pub extended_attributes: Vec<ExtendedAttribute>,
}

fn default_object_id_attribute() -> String { "id".to_string() }
fn default_hierarchical_separator() -> String { " > ".to_string() }
fn default_max_values_per_facet() -> u32 { 100 }
fn default_max_facet_hits() -> u32 { 10 }
fn default_hits_per_page() -> u32 { 20 }
fn default_max_hits_per_page() -> u32 { 1000 }

impl IndexSettings {
    /// Create settings for a table with defaults and empty allow-lists
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            object_id_attribute: default_object_id_attribute(),
            attributes_for_faceting: Vec::new(),
            numeric_attributes_for_filtering: Vec::new(),
            searchable_attributes: Vec::new(),
            sortable_attributes: Vec::new(),
            hierarchical_facets: Vec::new(),
            hierarchical_separator: default_hierarchical_separator(),
            max_values_per_facet: default_max_values_per_facet(),
            sort_facet_values_by: SortFacetValuesBy::default(),
            max_facet_hits: default_max_facet_hits(),
            hits_per_page: default_hits_per_page(),
            max_hits_per_page: default_max_hits_per_page(),
            rendering_content: None,
            count_strategy: CountStrategy::default(),
            extended_attributes: Vec::new(),
        }
    }

    /// Add a facet attribute
    pub fn facet(mut self, name: impl Into<String>) -> Self {
        self.attributes_for_faceting.push(name.into());
        self
    }

    /// Add a facet attribute whose values can be searched
    pub fn searchable_facet(mut self, name: impl Into<String>) -> Self {
        self.attributes_for_faceting.push(format!("searchable({})", name.into()));
        self
    }

    /// Add a filter-only attribute (never aggregated)
    pub fn filter_only(mut self, name: impl Into<String>) -> Self {
        self.attributes_for_faceting.push(format!("filterOnly({})", name.into()));
        self
    }

    /// Add a numeric attribute
    pub fn numeric(mut self, name: impl Into<String>) -> Self {
        self.numeric_attributes_for_filtering.push(name.into());
        self
    }

    /// Add a free-text attribute
    pub fn text(mut self, name: impl Into<String>) -> Self {
        self.searchable_attributes.push(name.into());
        self
    }

    /// Add a sortable attribute
    pub fn sortable(mut self, name: impl Into<String>) -> Self {
        self.sortable_attributes.push(name.into());
        self
    }

    /// Add a hierarchical chain; every level also becomes a facet attribute
    pub fn hierarchy<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let levels: Vec<String> = levels.into_iter().map(Into::into).collect();
        for level in &levels {
            if !self.facet_names().any(|name| name == *level) {
                self.attributes_for_faceting.push(level.clone());
            }
        }
        self.hierarchical_facets.push(levels);
        self
    }

    pub fn object_id(mut self, attribute: impl Into<String>) -> Self {
        self.object_id_attribute = attribute.into();
        self
    }

    pub fn count_strategy(mut self, strategy: CountStrategy) -> Self {
        self.count_strategy = strategy;
        self
    }

    /// Store `name` in `join_table`, keyed by `foreign_key` to the objectID.
    /// The attribute must also be added with [`facet`](Self::facet) or
    /// [`numeric`](Self::numeric).
    pub fn extended_attribute(
        mut self,
        name: impl Into<String>,
        join_table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.extended_attributes
            .push(ExtendedAttribute::new(name, join_table, foreign_key));
        self
    }

    pub fn extended(&self, attribute: &str) -> Option<&ExtendedAttribute> {
        self.extended_attributes.iter().find(|e| e.name == attribute)
    }

    /// Parsed `attributes_for_faceting`
    pub fn facet_attributes(&self) -> Vec<FacetAttribute> {
        self.attributes_for_faceting.iter().map(|a| FacetAttribute::parse(a)).collect()
    }

    /// Every facet attribute name, modifiers stripped
    pub fn facet_names(&self) -> impl Iterator<Item = String> + '_ {
        self.attributes_for_faceting.iter().map(|a| FacetAttribute::parse(a).name)
    }

    pub fn facet_attribute(&self, name: &str) -> Option<FacetAttribute> {
        self.facet_attributes().into_iter().find(|a| a.name == name)
    }

    /// Union of facet and numeric allow-lists
    pub fn filterable_attributes(&self) -> Vec<String> {
        let mut all: Vec<String> = self.facet_names().collect();
        for name in &self.numeric_attributes_for_filtering {
            if !all.contains(name) {
                all.push(name.clone());
            }
        }
        all
    }

    /// Explicit sortable attributes, or faceting + numeric columns when none
    /// are set
    pub fn effective_sortable(&self) -> Vec<String> {
        if self.sortable_attributes.is_empty() {
            self.filterable_attributes()
                .into_iter()
                .filter(|name| self.extended(name).is_none())
                .collect()
        } else {
            self.sortable_attributes.clone()
        }
    }

    /// The chain containing `attribute`, if it is a hierarchical level
    pub fn hierarchy_of(&self, attribute: &str) -> Option<&[String]> {
        self.hierarchical_facets
            .iter()
            .find(|chain| chain.iter().any(|level| level == attribute))
            .map(Vec::as_slice)
    }

    pub fn validate(&self) -> SearchResult<()> {
        check_identifier("index name", &self.name)?;
        check_identifier("objectID attribute", &self.object_id_attribute)?;

        let facets = self.facet_names().collect::<Vec<_>>();
        for name in facets
            .iter()
            .chain(&self.numeric_attributes_for_filtering)
            .chain(&self.searchable_attributes)
            .chain(&self.sortable_attributes)
        {
            check_identifier("attribute", name)?;
        }

        for chain in &self.hierarchical_facets {
            if chain.is_empty() {
                return Err(SearchError::Config(format!(
                    "index '{}' has an empty hierarchical facet",
                    self.name
                )));
            }
            if let Some(level) = chain.iter().find(|level| !facets.contains(level)) {
                return Err(SearchError::Config(format!(
                    "hierarchical level '{}' of index '{}' is not in attributes_for_faceting",
                    level, self.name
                )));
            }
        }
        let filterable = self.filterable_attributes();
        let mut seen = HashSet::new();
        for extended in &self.extended_attributes {
            check_identifier("extended attribute", &extended.name)?;
            check_identifier("join table", &extended.join_table)?;
            check_identifier("foreign key", &extended.foreign_key)?;
            check_identifier("join column", extended.column())?;
            let problem = if !seen.insert(extended.name.as_str()) {
                Some("is declared twice")
            } else if !filterable.contains(&extended.name) {
                Some("is not a facet or numeric attribute")
            } else if self.searchable_attributes.contains(&extended.name)
                || self.sortable_attributes.contains(&extended.name)
            {
                Some("cannot be searched or sorted on")
            } else if self.hierarchy_of(&extended.name).is_some() {
                Some("cannot be a hierarchical level")
            } else {
                None
            };
            if let Some(problem) = problem {
                return Err(SearchError::Config(format!(
                    "extended attribute '{}' of index '{}' {}",
                    extended.name, self.name, problem
                )));
            }
        }

        if self.hierarchical_separator.is_empty() {
            return Err(SearchError::Config("hierarchical_separator is empty".into()));
        }

        if self.max_hits_per_page == 0 || self.hits_per_page == 0 || self.hits_per_page > self.max_hits_per_page {
            return Err(SearchError::Config(format!(
                "index '{}': hits_per_page must be in 1..={}",
                self.name, self.max_hits_per_page
            )));
        }
        Ok(())
    }
}

fn check_identifier(what: &str, name: &str) -> SearchResult<()> {
    if name.trim().is_empty() {
        return Err(SearchError::Config(format!("{} is empty", what)));
    }
    if name.contains('\0') || name.contains('\\') {
        return Err(SearchError::Config(format!("{} '{}' contains a forbidden character", what, name.escape_default())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_json() {
        let config: SearchConfig = serde_json::from_value(json!({
            "dialect": "sqlite",
            "indices": [{"name": "products", "attributes_for_faceting": ["color"]}]
        }))
        .unwrap();
        let index = config.index("products").unwrap();
        assert_eq!(config.dialect, SqlDialect::Sqlite);
        assert_eq!(index.object_id_attribute, "id");
        assert_eq!(index.hierarchical_separator, " > ");
        assert_eq!(index.max_values_per_facet, 100);
        assert_eq!(index.max_facet_hits, 10);
        assert_eq!(index.hits_per_page, 20);
        assert_eq!(index.sort_facet_values_by, SortFacetValuesBy::Count);
        assert_eq!(index.count_strategy, CountStrategy::Exact);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_facet_modifiers() {
        assert_eq!(
            FacetAttribute::parse("searchable(brand)"),
            FacetAttribute {
                name: "brand".into(),
                searchable: true,
                filter_only: false
            }
        );
        assert!(FacetAttribute::parse("filterOnly( sku )").filter_only);
        assert_eq!(FacetAttribute::parse("filterOnly( sku )").name, "sku");
        assert_eq!(FacetAttribute::parse("searchable").name, "searchable");
    }

    #[test]
    fn test_builder_and_derived_lists() {
        let index = IndexSettings::new("products")
            .facet("color")
            .searchable_facet("brand")
            .filter_only("sku")
            .numeric("price")
            .numeric("color")
            .hierarchy(["cat.lvl0", "cat.lvl1"]);
        assert_eq!(
            index.filterable_attributes(),
            vec!["color", "brand", "sku", "cat.lvl0", "cat.lvl1", "price"]
        );
        assert_eq!(index.effective_sortable(), index.filterable_attributes());
        assert!(index.facet_attribute("brand").unwrap().searchable);
        assert_eq!(index.hierarchy_of("cat.lvl1").map(|c| c.len()), Some(2));
        assert!(index.hierarchy_of("color").is_none());
        assert!(index.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        assert!(IndexSettings::new("").validate().is_err());
        assert!(IndexSettings::new("products").facet("bad\0name").validate().is_err());

        let mut index = IndexSettings::new("products");
        index.hierarchical_facets.push(vec!["missing".into()]);
        assert!(matches!(index.validate(), Err(SearchError::Config(_))));

        let mut index = IndexSettings::new("products");
        index.hits_per_page = 2000;
        assert!(index.validate().is_err());

        let config = SearchConfig {
            dialect: SqlDialect::Postgres,
            indices: vec![IndexSettings::new("a"), IndexSettings::new("a")],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extended_attributes() {
        let index = IndexSettings::new("products")
            .facet("tag")
            .numeric("price")
            .numeric("stock")
            .extended_attribute("tag", "product_tags", "product_id")
            .extended_attribute("stock", "inventory", "product_id");
        assert!(index.validate().is_ok());
        assert_eq!(index.extended("tag").map(|e| e.column()), Some("tag"));
        assert!(index.extended("price").is_none());
        assert_eq!(index.effective_sortable(), vec!["price"]);

        let config: SearchConfig = serde_json::from_value(json!({
            "indices": [{
                "name": "products",
                "numeric_attributes_for_filtering": ["stock"],
                "extended_attributes": [
                    {"name": "stock", "join_table": "inventory", "foreign_key": "product_id", "column": "qty"}
                ]
            }]
        }))
        .unwrap();
        assert_eq!(config.indices[0].extended("stock").map(|e| e.column()), Some("qty"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_extended_attribute_validation() {
        let unlisted = IndexSettings::new("products").extended_attribute("tag", "product_tags", "product_id");
        let twice = IndexSettings::new("products")
            .facet("tag")
            .extended_attribute("tag", "product_tags", "product_id")
            .extended_attribute("tag", "other_tags", "product_id");
        let sorted = IndexSettings::new("products")
            .facet("tag")
            .sortable("tag")
            .extended_attribute("tag", "product_tags", "product_id");
        let bad_table = IndexSettings::new("products")
            .facet("tag")
            .extended_attribute("tag", "", "product_id");
        for index in [unlisted, twice, sorted, bad_table] {
            assert!(matches!(index.validate(), Err(SearchError::Config(_))));
        }
    }
}
