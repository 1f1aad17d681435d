//! Stats Compiler
//!
//! One `MIN/MAX/AVG/SUM` aggregation per numeric attribute, scoped by every
//! other attribute's predicate like a facet.
//!
//! ```sql
//! SELECT CAST(MIN("price") AS REAL) AS stat_min, CAST(MAX("price") AS REAL) AS stat_max,
//!        CAST(AVG("price") AS REAL) AS stat_avg, CAST(SUM("price") AS REAL) AS stat_sum
//! FROM "products" WHERE "color" IN (?)
//! ```
//!
//! With no matching rows every aggregate is `NULL`, which is reported as
//! `null` stats rather than zeros.
//!
//! An extended attribute aggregates the join rows of the scoped objects:
//!
//! ```sql
//! SELECT CAST(MIN("inventory"."stock") AS REAL) AS stat_min, ...
//! FROM "inventory" WHERE "inventory"."product_id" IN (SELECT "products"."id" FROM "products" WHERE ...)
//! ```

use std::collections::BTreeSet;
use tracing::debug;

use super::condition::TableLayout;
use super::filter_compiler::FilterSet;
use crate::config::ExtendedAttribute;
use crate::error::SearchResult;
use crate::hooks::{HookContext, HookName, HookRegistry};
use crate::sql::{SqlDialect, SqlFragment};

/// Compiled stats aggregation of one numeric attribute
#[derive(Debug, Clone, PartialEq)]
pub struct StatsAggregation {
    pub attribute: String,
    pub fragment: SqlFragment,
}

pub struct StatsCompiler<'a> {
    dialect: SqlDialect,
    layout: TableLayout<'a>,
    index: &'a str,
    hooks: &'a HookRegistry,
}

impl<'a> StatsCompiler<'a> {
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

    pub fn compile_stats(&self, attribute: &str, filters: &FilterSet) -> SearchResult<StatsAggregation> {
        let column = self.layout.value_column(attribute);
        let float = self.dialect.float_type();
        let selects: Vec<String> = [("MIN", "stat_min"), ("MAX", "stat_max"), ("AVG", "stat_avg"), ("SUM", "stat_sum")]
            .iter()
            .map(|(func, alias)| format!("CAST({}({}) AS {}) AS {}", func, column, float, alias))
            .collect();

        let scope = filters.scope_excluding(&BTreeSet::from([attribute.to_string()]));
        let (table, scope) = match self.layout.extended(attribute) {
            Some(extended) => (extended.join_table.as_str(), self.layout.rows_of(extended, scope)),
            None => (self.index, scope),
        };
        let mut sql = format!("SELECT {} FROM {}", selects.join(", "), self.dialect.quote_ident(table));
        if !scope.is_always_true() {
            sql.push_str(" WHERE ");
            sql.push_str(&scope.sql);
        }

        let context = HookContext::new(HookName::StatsAggregation, self.index, "stats").with_attributes([attribute]);
        let fragment = self.hooks.invoke(SqlFragment::aggregation(sql, scope.params), &context)?;
        debug!(attribute, params = fragment.params.len(), "Compiled stats aggregation");

        Ok(StatsAggregation {
            attribute: attribute.to_string(),
            fragment,
        })
    }

    /// Stats for every attribute, in order
    pub fn compile_all(&self, attributes: &[String], filters: &FilterSet) -> SearchResult<Vec<StatsAggregation>> {
        attributes.iter().map(|a| self.compile_stats(a, filters)).collect()
    }
}
