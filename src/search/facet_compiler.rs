// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Facet Compiler
//!
//! Builds one value-count aggregation per requested facet, scoped by every
//! *other* attribute's predicate (disjunctive faceting).
//!
//! # SQL Generated
//!
//! ```sql
//! SELECT CAST("brand" AS TEXT) AS facet_value, COUNT(*) AS facet_count
//! FROM "products"
//! WHERE ("color" IN (?)) AND ("brand" IS NOT NULL)
//! GROUP BY "brand"
//! ORDER BY facet_count DESC, facet_value ASC
//! LIMIT ?
//! ```
//!
//! # Hierarchical facets
//!
//! ```text
//! chain:     cat.lvl0       cat.lvl1              cat.lvl2
//! selected:  "A"            "A > B"               -
//! counted:   yes            yes (lvl0 = "A")      yes (lvl1 = "A > B")
//! ```
//!
//! Level `k > 0` is only counted when the selected path reaches level
//! `k - 1`, and is constrained to that parent value. The whole chain is
//! excluded from each level's scope.
//!
//! # Extended attributes
//!
//! Values stored in a join table are counted once per object:
//!
//! ```sql
//! SELECT CAST("product_tags"."tag" AS TEXT) AS facet_value,
//!        COUNT(DISTINCT "product_tags"."product_id") AS facet_count
//! FROM "product_tags"
//! WHERE ("product_tags"."product_id" IN (SELECT "products"."id" FROM "products" WHERE ...))
//!   AND ("product_tags"."tag" IS NOT NULL)
//! GROUP BY "product_tags"."tag" ...
//! ```

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use super::condition::{escape_like, Condition, TableLayout};
use super::filter_compiler::FilterSet;
use super::refinements::AllRefinements;
use crate::config::{ExtendedAttribute, IndexSettings, SortFacetValuesBy};
use crate::error::{FilterOrigin, SearchError, SearchResult};
use crate::hooks::{HookContext, HookName, HookRegistry};
use crate::sql::{SqlDialect, SqlFragment, SqlParam};

/// Presentation options shared by every facet of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacetOptions {
    pub max_values_per_facet: u32,
    pub sort_facet_values_by: SortFacetValuesBy,
    pub max_facet_hits: u32,
}

impl FacetOptions {
    pub fn from_settings(settings: &IndexSettings) -> Self {
        Self {
            max_values_per_facet: settings.max_values_per_facet,
            sort_facet_values_by: settings.sort_facet_values_by,
            max_facet_hits: settings.max_facet_hits,
        }
    }
}

/// Position of a facet inside a hierarchical chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyLevel {
    pub chain: Vec<String>,
    pub level: usize,
    pub separator: String,
}

/// A requested facet and its options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetDescriptor {
    pub attribute: String,
    pub options: FacetOptions,
    /// Declared `searchable(attr)`
    pub searchable: bool,
    pub hierarchy: Option<HierarchyLevel>,
}

impl FacetDescriptor {
    /// Descriptor for one configured facet attribute.
    pub fn for_attribute(settings: &IndexSettings, attribute: &str, options: FacetOptions) -> SearchResult<Self> {
        let declared = settings
            .facet_attribute(attribute)
            .ok_or_else(|| SearchError::unknown_attribute(attribute, FilterOrigin::Facets))?;
        let hierarchy = settings.hierarchy_of(attribute).map(|chain| HierarchyLevel {
            chain: chain.to_vec(),
            level: chain.iter().position(|level| level == attribute).unwrap_or(0),
            separator: settings.hierarchical_separator.clone(),
        });
        Ok(Self {
            attribute: declared.name,
            options,
            searchable: declared.searchable,
            hierarchy,
        })
    }

    /// Resolve the request's `facets` (`"*"`, a name, or a list of names).
    ///
    /// `filterOnly` attributes are skipped; duplicates are dropped.
    pub fn resolve(requested: Option<&Value>, settings: &IndexSettings, options: FacetOptions) -> SearchResult<Vec<Self>> {
        let names: Vec<String> = match requested {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        SearchError::InvalidRequest(format!("facets entry {} is not a string", item))
                    })
                })
                .collect::<SearchResult<_>>()?,
            Some(other) => {
                return Err(SearchError::InvalidRequest(format!(
                    "facets must be a string or an array, got {}",
                    other
                )))
            }
        };

        let mut seen = BTreeSet::new();
        let mut descriptors = Vec::new();
        for name in names {
            let expanded: Vec<String> = if name == "*" {
                settings.facet_names().collect()
            } else {
                vec![name]
            };
            for attribute in expanded {
                let descriptor = Self::for_attribute(settings, &attribute, options)?;
                if settings.facet_attribute(&attribute).is_some_and(|a| a.filter_only) {
                    debug!(attribute = %attribute, "Skipping filterOnly facet");
                    continue;
                }
                if seen.insert(descriptor.attribute.clone()) {
                    descriptors.push(descriptor);
                }
            }
        }
        Ok(descriptors)
    }
}

/// Compiled value-count aggregation of one facet
#[derive(Debug, Clone, PartialEq)]
pub struct FacetAggregation {
    pub attribute: String,
    pub fragment: SqlFragment,
}

/// Compiled facet value search
#[derive(Debug, Clone, PartialEq)]
pub struct FacetSearchQuery {
    pub attribute: String,
    pub facet_query: String,
    pub fragment: SqlFragment,
}

/// Compiles facet aggregations for one index table
pub struct FacetCompiler<'a> {
    dialect: SqlDialect,
    layout: TableLayout<'a>,
    index: &'a str,
    hooks: &'a HookRegistry,
}

impl<'a> FacetCompiler<'a> {
    pub fn new(dialect: SqlDialect, index: &'a str, hooks: &'a HookRegistry) -> Self {
        Self {
            dialect,
            layout: TableLayout::new(dialect, index),
            index,
            hooks,
        }
    }

    /// Attributes stored in join tables that reference `key`
    pub fn extended_attributes(mut self, key: &'a str, extended: &'a [ExtendedAttribute]) -> Self {
        self.layout = self.layout.with_extended(key, extended);
        self
    }

    /// Compile one facet. `None` for a hierarchical level whose parent has
    /// no selected value.
    pub fn compile_facet(
        &self,
        descriptor: &FacetDescriptor,
        filters: &FilterSet,
        refinements: &AllRefinements,
    ) -> SearchResult<Option<FacetAggregation>> {
        let Some(where_clause) = self.facet_scope(descriptor, filters, refinements) else {
            debug!(attribute = %descriptor.attribute, "Hierarchical level has no selected parent");
            return Ok(None);
        };

        let fragment = self.aggregation(
            &descriptor.attribute,
            where_clause,
            descriptor.options.sort_facet_values_by,
            descriptor.options.max_values_per_facet,
        );
        let context = HookContext::new(HookName::FacetAggregation, self.index, "facet")
            .with_attributes([descriptor.attribute.as_str()]);
        let fragment = self.hooks.invoke(fragment, &context)?;

        debug!(attribute = %descriptor.attribute, params = fragment.params.len(), "Compiled facet aggregation");
        Ok(Some(FacetAggregation {
            attribute: descriptor.attribute.clone(),
            fragment,
        }))
    }

    /// Compile a search over the values of a `searchable()` facet.
    pub fn compile_facet_search(
        &self,
        descriptor: &FacetDescriptor,
        filters: &FilterSet,
        refinements: &AllRefinements,
        facet_query: &str,
    ) -> SearchResult<FacetSearchQuery> {
        if !descriptor.searchable {
            return Err(SearchError::unknown_attribute(
                descriptor.attribute.as_str(),
                FilterOrigin::FacetSearch,
            ));
        }

        let column = self.layout.value_column(&descriptor.attribute);
        let scope = self
            .facet_scope(descriptor, filters, refinements)
            .unwrap_or_else(SqlFragment::always_false);
        let needle = facet_query.trim().to_lowercase();
        let matching = SqlFragment::predicate(
            format!("LOWER(CAST({} AS {})) LIKE ? ESCAPE '!'", column, self.dialect.text_type()),
            vec![SqlParam::Text(format!("%{}%", escape_like(&needle)))],
        );
        let where_clause = if needle.is_empty() {
            scope
        } else {
            SqlFragment::conjoin([&scope, &matching])
        };

        let fragment = self.aggregation(
            &descriptor.attribute,
            where_clause,
            SortFacetValuesBy::Count,
            descriptor.options.max_facet_hits,
        );
        let context = HookContext::new(HookName::FacetAggregation, self.index, "facet_search")
            .with_attributes([descriptor.attribute.as_str()]);
        let fragment = self.hooks.invoke(fragment, &context)?;

        Ok(FacetSearchQuery {
            attribute: descriptor.attribute.clone(),
            facet_query: facet_query.to_string(),
            fragment,
        })
    }

    /// Disjunctive scope plus `attr IS NOT NULL` and the hierarchical parent
    /// constraint. For an extended attribute the scope selects the objects
    /// whose join rows are counted.
    fn facet_scope(
        &self,
        descriptor: &FacetDescriptor,
        filters: &FilterSet,
        refinements: &AllRefinements,
    ) -> Option<SqlFragment> {
        let mut excluded = BTreeSet::from([descriptor.attribute.clone()]);
        let mut parent = None;

        if let Some(hierarchy) = &descriptor.hierarchy {
            excluded.extend(hierarchy.chain.iter().cloned());
            if hierarchy.level > 0 {
                let path = selected_path(hierarchy, refinements)?;
                if path.len() < hierarchy.level {
                    return None;
                }
                let prefix = path[..hierarchy.level].join(&hierarchy.separator);
                parent = Some(
                    Condition::equals(hierarchy.chain[hierarchy.level - 1].as_str(), prefix.as_str())
                        .to_sql_in(&self.layout),
                );
            }
        }

        let scope = filters.scope_excluding(&excluded);
        let not_null = SqlFragment::predicate(
            format!("{} IS NOT NULL", self.layout.value_column(&descriptor.attribute)),
            Vec::new(),
        );
        match self.layout.extended(&descriptor.attribute) {
            Some(extended) => {
                let rows = SqlFragment::conjoin([Some(&scope), parent.as_ref()].into_iter().flatten());
                Some(SqlFragment::conjoin([&self.layout.rows_of(extended, rows), &not_null]))
            }
            None => Some(SqlFragment::conjoin(
                [Some(&scope), Some(&not_null), parent.as_ref()].into_iter().flatten(),
            )),
        }
    }

    fn aggregation(&self, attribute: &str, where_clause: SqlFragment, sort: SortFacetValuesBy, limit: u32) -> SqlFragment {
        let column = self.layout.value_column(attribute);
        let (table, count) = match self.layout.extended(attribute) {
            Some(extended) => (
                extended.join_table.as_str(),
                format!(
                    "COUNT(DISTINCT {}.{})",
                    self.dialect.quote_ident(&extended.join_table),
                    self.dialect.quote_ident(&extended.foreign_key)
                ),
            ),
            None => (self.index, "COUNT(*)".to_string()),
        };
        let order = match sort {
            SortFacetValuesBy::Count => "facet_count DESC, facet_value ASC",
            SortFacetValuesBy::Alpha => "facet_value ASC",
        };
        let sql = format!(
            "SELECT CAST({column} AS {text}) AS facet_value, {count} AS facet_count FROM {table} WHERE {predicate} \
             GROUP BY {column} ORDER BY {order} LIMIT ?",
            column = column,
            text = self.dialect.text_type(),
            count = count,
            table = self.dialect.quote_ident(table),
            predicate = where_clause.sql,
            order = order,
        );
        let mut params = where_clause.params;
        params.push(SqlParam::Integer(i64::from(limit)));
        SqlFragment::aggregation(sql, params)
    }
}

/// Segments of the deepest positively selected value in a chain.
fn selected_path(hierarchy: &HierarchyLevel, refinements: &AllRefinements) -> Option<Vec<String>> {
    hierarchy.chain.iter().rev().find_map(|level| {
        refinements
            .get(level)
            .and_then(|r| r.selected_values().next())
            .map(|value| {
                value
                    .to_string()
                    .split(hierarchy.separator.as_str())
                    .map(str::to_string)
                    .collect()
            })
    })
}
