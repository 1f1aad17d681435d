// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter Compiler
//!
//! Compiles [`AllRefinements`] into parameterized predicates: one per
//! attribute, one per cross-attribute OR group, and the global conjunction
//! applied to hits.
//!
//! ```text
//! AllRefinements ─→ per attribute ─→ hook filter.attribute ─┐
//!                ─→ OR groups     ─→ hook filter.attribute ─┼─→ AND (+ text) ─→ hook filter.global
//! free text      ──────────────────────────────────────────┘
//! ```
//!
//! An OR group that touches a single attribute is folded into that
//! attribute's predicate, so excluding the attribute also excludes the group.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::condition::{Condition, TableLayout};
use super::refinements::{AllRefinements, Refinement};
use crate::config::ExtendedAttribute;
use crate::error::{FilterOrigin, SearchError, SearchResult};
use crate::hooks::{HookContext, HookName, HookRegistry};
use crate::sql::{SqlDialect, SqlFragment};

/// A compiled, immutable predicate and the attributes it constrains
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPredicate {
    /// SQL after hooks
    pub fragment: SqlFragment,
    /// Boolean tree the fragment was rendered from (before hooks)
    pub condition: Condition,
    pub attributes: BTreeSet<String>,
}

/// Output of [`FilterCompiler::compile`]
#[derive(Debug, Clone)]
pub struct FilterSet {
    /// Everything conjoined, for the hits query
    pub global: CompiledPredicate,
    pub per_attribute: BTreeMap<String, CompiledPredicate>,
    /// OR groups spanning more than one attribute
    pub disjunctions: Vec<CompiledPredicate>,
    /// Free-text condition, if a query was given
    pub text: Option<CompiledPredicate>,
}

impl FilterSet {
    /// True when `attribute` has its own predicate or takes part in an OR group.
    pub fn is_refined(&self, attribute: &str) -> bool {
        self.per_attribute.contains_key(attribute)
            || self.disjunctions.iter().any(|d| d.attributes.contains(attribute))
    }

    /// Conjunction of every predicate that does not touch `excluded`, plus
    /// the free-text condition. This is the scope of a disjunctive facet.
    pub fn scope_excluding(&self, excluded: &BTreeSet<String>) -> SqlFragment {
        SqlFragment::conjoin(self.scoped(excluded).map(|p| &p.fragment))
    }

    /// In-memory counterpart of [`FilterSet::scope_excluding`]
    pub fn scope_condition_excluding(&self, excluded: &BTreeSet<String>) -> Condition {
        Condition::And(self.scoped(excluded).map(|p| p.condition.clone()).collect())
    }

    fn scoped<'a>(&'a self, excluded: &'a BTreeSet<String>) -> impl Iterator<Item = &'a CompiledPredicate> + 'a {
        self.per_attribute
            .iter()
            .filter(move |(attribute, _)| !excluded.contains(*attribute))
            .map(|(_, predicate)| predicate)
            .chain(
                self.disjunctions
                    .iter()
                    .filter(move |d| d.attributes.is_disjoint(excluded)),
            )
            .chain(self.text.iter())
    }
}

/// Compiles refinements for one index
pub struct FilterCompiler<'a> {
    layout: TableLayout<'a>,
    index: &'a str,
    allowed: &'a [String],
    hooks: &'a HookRegistry,
}

impl<'a> FilterCompiler<'a> {
    /// `allowed` is every attribute that may be filtered on.
    pub fn new(dialect: SqlDialect, index: &'a str, allowed: &'a [String], hooks: &'a HookRegistry) -> Self {
        Self {
            layout: TableLayout::new(dialect, index),
            index,
            allowed,
            hooks,
        }
    }

    /// Attributes stored in join tables that reference `key`
    pub fn extended_attributes(mut self, key: &'a str, extended: &'a [ExtendedAttribute]) -> Self {
        self.layout = self.layout.with_extended(key, extended);
        self
    }

    pub fn compile(&self, refinements: &AllRefinements, text: Option<Condition>) -> SearchResult<FilterSet> {
        let mut per_attribute_conditions: BTreeMap<&str, Vec<Condition>> = BTreeMap::new();
        for (attribute, refinements) in &refinements.attributes {
            let parts = refinements.to_conditions(attribute);
            if parts.is_empty() {
                continue;
            }
            self.check_allowed(attribute, origin_of_refinements(!refinements.ranges.is_empty()))?;
            per_attribute_conditions.entry(attribute).or_default().extend(parts);
        }

        let mut cross_attribute = Vec::new();
        for group in &refinements.disjunctions {
            for term in &group.terms {
                self.check_allowed(term.attribute(), origin_of(term))?;
            }
            let attributes = group.attributes();
            match attributes.iter().next() {
                Some(only) if attributes.len() == 1 => {
                    per_attribute_conditions
                        .entry(group.terms[0].attribute())
                        .or_default()
                        .push(group.to_condition());
                    debug!(attribute = %only, "Folded single-attribute OR group");
                }
                Some(_) => cross_attribute.push((attributes, group.to_condition())),
                None => {}
            }
        }

        let mut per_attribute = BTreeMap::new();
        for (attribute, parts) in per_attribute_conditions {
            let condition = Condition::And(parts).simplify();
            let predicate = self.compile_predicate(condition, BTreeSet::from([attribute.to_string()]), "attribute")?;
            per_attribute.insert(attribute.to_string(), predicate);
        }

        let mut disjunctions = Vec::with_capacity(cross_attribute.len());
        for (attributes, condition) in cross_attribute {
            disjunctions.push(self.compile_predicate(condition.simplify(), attributes, "disjunction")?);
        }

        let text = text.map(|condition| {
            let attributes = condition.attributes().into_iter().map(String::from).collect();
            CompiledPredicate {
                fragment: condition.to_sql_in(&self.layout),
                condition,
                attributes,
            }
        });

        let global = self.compile_global(&per_attribute, &disjunctions, text.as_ref())?;

        debug!(
            index = %self.index,
            attributes = per_attribute.len(),
            disjunctions = disjunctions.len(),
            params = global.fragment.params.len(),
            "Compiled filters"
        );

        Ok(FilterSet {
            global,
            per_attribute,
            disjunctions,
            text,
        })
    }

    fn compile_predicate(
        &self,
        condition: Condition,
        attributes: BTreeSet<String>,
        label: &'static str,
    ) -> SearchResult<CompiledPredicate> {
        let context = HookContext::new(HookName::FilterAttribute, self.index, label)
            .with_attributes(attributes.iter().cloned());
        let fragment = self.hooks.invoke(condition.to_sql_in(&self.layout), &context)?;
        debug!(
            attributes = ?context.attributes,
            params = fragment.params.len(),
            "Compiled predicate"
        );
        Ok(CompiledPredicate {
            fragment,
            condition,
            attributes,
        })
    }

    fn compile_global(
        &self,
        per_attribute: &BTreeMap<String, CompiledPredicate>,
        disjunctions: &[CompiledPredicate],
        text: Option<&CompiledPredicate>,
    ) -> SearchResult<CompiledPredicate> {
        let parts: Vec<&CompiledPredicate> = per_attribute.values().chain(disjunctions).chain(text).collect();

        let conjunction = SqlFragment::conjoin(parts.iter().map(|p| &p.fragment));
        let context = HookContext::new(HookName::FilterGlobal, self.index, "global");
        let fragment = self.hooks.invoke(conjunction, &context)?;

        Ok(CompiledPredicate {
            fragment,
            condition: Condition::And(parts.iter().map(|p| p.condition.clone()).collect()).simplify(),
            attributes: parts.iter().flat_map(|p| p.attributes.iter().cloned()).collect(),
        })
    }

    fn check_allowed(&self, attribute: &str, origin: FilterOrigin) -> SearchResult<()> {
        if self.allowed.iter().any(|a| a == attribute) {
            Ok(())
        } else {
            Err(SearchError::unknown_attribute(attribute, origin))
        }
    }
}

fn origin_of(refinement: &Refinement) -> FilterOrigin {
    match refinement {
        Refinement::Facet { .. } => FilterOrigin::FacetFilters,
        Refinement::Numeric { .. } | Refinement::Interval { .. } => FilterOrigin::NumericFilters,
    }
}

fn origin_of_refinements(has_ranges: bool) -> FilterOrigin {
    if has_ranges {
        FilterOrigin::NumericFilters
    } else {
        FilterOrigin::FacetFilters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::normalizer::normalize;
    use crate::sql::SqlParam;
    use serde_json::{json, Value};

    fn allowed() -> Vec<String> {
        vec!["color".into(), "brand".into(), "price".into()]
    }

    fn compile_with(hooks: &HookRegistry, facet_filters: Value, numeric_filters: Value) -> SearchResult<FilterSet> {
        let refinements = normalize(
            Some(&facet_filters),
            Some(&numeric_filters),
            &["color".to_string(), "brand".to_string()],
            &["price".to_string()],
        )?;
        let allowed = allowed();
        FilterCompiler::new(SqlDialect::Postgres, "products", &allowed, hooks).compile(&refinements, None)
    }

    fn compile(facet_filters: Value, numeric_filters: Value) -> FilterSet {
        compile_with(&HookRegistry::new(), facet_filters, numeric_filters).unwrap()
    }

    fn excluded(attrs: &[&str]) -> BTreeSet<String> {
        attrs.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_no_refinements_is_always_true() {
        let set = compile(Value::Null, Value::Null);
        assert!(set.global.fragment.is_always_true());
        assert!(set.per_attribute.is_empty());
    }

    #[test]
    fn test_per_attribute_predicates() {
        let set = compile(json!(["color:red", "brand:-X"]), json!(["price>=10"]));
        assert_eq!(set.per_attribute["color"].fragment.sql, "\"color\" IN (?)");
        assert_eq!(
            set.per_attribute["brand"].fragment.sql,
            "(\"brand\" IS NULL OR \"brand\" NOT IN (?))"
        );
        assert_eq!(set.per_attribute["price"].fragment.sql, "\"price\" >= ?");
        assert_eq!(
            set.global.fragment.sql,
            "((\"brand\" IS NULL OR \"brand\" NOT IN (?))) AND (\"color\" IN (?)) AND (\"price\" >= ?)"
        );
        assert_eq!(
            set.global.fragment.params,
            vec![
                SqlParam::Text("X".into()),
                SqlParam::Text("red".into()),
                SqlParam::Float(10.0)
            ]
        );
    }

    #[test]
    fn test_scope_excludes_own_attribute() {
        let set = compile(json!(["color:red", "brand:X"]), Value::Null);
        let scope = set.scope_excluding(&excluded(&["color"]));
        assert_eq!(scope.sql, "\"brand\" IN (?)");
        assert_eq!(scope.params, vec![SqlParam::Text("X".into())]);
        assert!(set.scope_excluding(&excluded(&["color", "brand"])).is_always_true());
    }

    #[test]
    fn test_single_attribute_mixed_group_folds() {
        let set = compile(json!([["brand:X", "brand:-Y"]]), Value::Null);
        assert!(set.disjunctions.is_empty());
        assert_eq!(
            set.per_attribute["brand"].fragment.sql,
            "(\"brand\" IN (?) OR (\"brand\" IS NULL OR \"brand\" NOT IN (?)))"
        );
        assert!(set.scope_excluding(&excluded(&["brand"])).is_always_true());
    }

    #[test]
    fn test_cross_attribute_group_stays_whole() {
        let set = compile(json!([["brand:X", "color:red"]]), Value::Null);
        assert!(set.per_attribute.is_empty());
        assert_eq!(set.disjunctions.len(), 1);
        assert_eq!(set.global.fragment.sql, "(\"brand\" IN (?) OR \"color\" IN (?))");
        assert!(set.is_refined("brand"));
        assert!(set.is_refined("color"));
        assert!(set.scope_excluding(&excluded(&["brand"])).is_always_true());
        assert!(!set.scope_excluding(&excluded(&["price"])).is_always_true());
    }

    #[test]
    fn test_text_is_part_of_every_scope() {
        let refinements = normalize(Some(&json!(["color:red"])), None, &["color".to_string()], &[]).unwrap();
        let allowed = allowed();
        let hooks = HookRegistry::new();
        let text = Condition::text(&["name".to_string()], "shoe");
        let set = FilterCompiler::new(SqlDialect::Sqlite, "products", &allowed, &hooks)
            .compile(&refinements, text)
            .unwrap();
        let scope = set.scope_excluding(&excluded(&["color"]));
        assert_eq!(scope.sql, "LOWER(\"name\") LIKE ? ESCAPE '!'");
        assert_eq!(set.global.fragment.params.len(), 2);
    }

    #[test]
    fn test_hooks_rewrite_attribute_and_global() {
        let hooks = HookRegistry::new();
        hooks.register(HookName::FilterAttribute, "archive-guard", |fragment, context| {
            if context.attributes == ["brand"] {
                Ok(SqlFragment::predicate(format!("{} AND \"archived\" = ?", fragment.sql), {
                    let mut params = fragment.params;
                    params.push(SqlParam::Boolean(false));
                    params
                }))
            } else {
                Ok(fragment)
            }
        });
        hooks.register(HookName::FilterGlobal, "tenant", |fragment, _| {
            let mut params = fragment.params;
            params.push(SqlParam::Integer(7));
            Ok(SqlFragment::predicate(format!("({}) AND \"tenant\" = ?", fragment.sql), params))
        });

        let set = compile_with(&hooks, json!(["brand:X", "color:red"]), Value::Null).unwrap();
        assert_eq!(set.per_attribute["brand"].fragment.params.len(), 2);
        assert!(set.global.fragment.sql.ends_with("AND \"tenant\" = ?"));
        assert_eq!(set.global.fragment.params.len(), 4);
        assert_eq!(set.global.fragment.placeholder_count(), 4);
    }

    #[test]
    fn test_hook_changing_kind_is_rejected() {
        let hooks = HookRegistry::new();
        hooks.register(HookName::FilterAttribute, "broken", |fragment, _| {
            Ok(SqlFragment::query(format!("SELECT {}", fragment.sql), fragment.params))
        });
        let err = compile_with(&hooks, json!(["brand:X"]), Value::Null).unwrap_err();
        assert!(matches!(err, SearchError::Hook(_)));
    }

    #[test]
    fn test_unlisted_attribute_never_reaches_sql() {
        let mut refinements = AllRefinements::default();
        refinements.entry("secret").and.push("x".into());
        let allowed = allowed();
        let hooks = HookRegistry::new();
        let err = FilterCompiler::new(SqlDialect::Postgres, "products", &allowed, &hooks)
            .compile(&refinements, None)
            .unwrap_err();
        assert!(matches!(err, SearchError::UnknownAttribute { .. }));
    }

    #[test]
    fn test_extended_attribute_predicates() {
        let refinements = normalize(
            Some(&json!(["tag:-clearance", "color:red"])),
            None,
            &["color".to_string(), "tag".to_string()],
            &[],
        )
        .unwrap();
        let allowed = vec!["color".to_string(), "tag".to_string()];
        let extended = [ExtendedAttribute::new("tag", "product_tags", "product_id")];
        let hooks = HookRegistry::new();
        let set = FilterCompiler::new(SqlDialect::Sqlite, "products", &allowed, &hooks)
            .extended_attributes("sku", &extended)
            .compile(&refinements, None)
            .unwrap();

        assert_eq!(
            set.per_attribute["tag"].fragment.sql,
            "NOT EXISTS (SELECT 1 FROM \"product_tags\" WHERE \"product_tags\".\"product_id\" = \"products\".\"sku\" \
             AND \"product_tags\".\"tag\" IN (?))"
        );
        assert_eq!(set.per_attribute["color"].fragment.sql, "\"color\" IN (?)");
        assert_eq!(set.scope_excluding(&excluded(&["tag"])).sql, "\"color\" IN (?)");
        assert_eq!(set.global.fragment.placeholder_count(), 2);
    }

    #[test]
    fn test_global_condition_evaluates_like_sql() {
        let set = compile(json!([["brand:X", "color:red"], "brand:-Y"]), json!(["price<5"]));
        assert!(set.global.condition.matches(&json!({"brand": "X", "color": "blue", "price": 3})));
        assert!(!set.global.condition.matches(&json!({"brand": "Y", "color": "red", "price": 3})));
        assert!(!set.global.condition.matches(&json!({"brand": "X", "price": 9})));
        assert!(set
            .scope_condition_excluding(&excluded(&["price"]))
            .matches(&json!({"brand": "X", "price": 9})));
    }
}
