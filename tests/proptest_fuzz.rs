//! Property-based tests (fuzzing) for the query compiler.
//!
//! - Grouping fidelity: normalized refinements evaluate exactly like the
//!   nested-array grammar read directly (flat = AND, nested = OR).
//! - Disjunctive scope: a facet's scope equals the grammar with every
//!   position that mentions the facet removed.
//! - Executed SQL: the global predicate and every facet scope, run against
//!   SQLite, select exactly the documents the grammar accepts. `size` is
//!   multi-valued and lives in a join table.
//! - Arbitrary input never panics and every fragment binds one parameter
//!   per placeholder.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

use searchbox::search::{normalize, FilterCompiler, SortAlias};
use searchbox::{
    ExtendedAttribute, HookRegistry, SearchError, SearchExecutor, SqlDialect, SqlFragment, SqlxExecutor,
};

const ATTRIBUTES: [&str; 3] = ["color", "brand", "size"];
const VALUES: [&str; 3] = ["a", "b", "c"];

// =============================================================================
// Reference model of the grammar
// =============================================================================

#[derive(Debug, Clone)]
struct Token {
    attribute: &'static str,
    value: &'static str,
    negated: bool,
}

impl Token {
    fn render(&self) -> String {
        format!("{}:{}{}", self.attribute, if self.negated { "-" } else { "" }, self.value)
    }

    /// Arrays match when any element does. Missing attributes satisfy a
    /// negation only.
    fn eval(&self, doc: &Value) -> bool {
        let equal = match doc.get(self.attribute) {
            Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some(self.value)),
            Some(v) => v.as_str() == Some(self.value),
            None => false,
        };
        equal != self.negated
    }
}

#[derive(Debug, Clone)]
enum Position {
    Literal(Token),
    Group(Vec<Token>),
}

impl Position {
    fn to_json(&self) -> Value {
        match self {
            Position::Literal(token) => Value::String(token.render()),
            Position::Group(tokens) => Value::Array(tokens.iter().map(|t| Value::String(t.render())).collect()),
        }
    }

    fn eval(&self, doc: &Value) -> bool {
        match self {
            Position::Literal(token) => token.eval(doc),
            Position::Group(tokens) => tokens.iter().any(|t| t.eval(doc)),
        }
    }

    fn mentions(&self, attribute: &str) -> bool {
        match self {
            Position::Literal(token) => token.attribute == attribute,
            Position::Group(tokens) => tokens.iter().any(|t| t.attribute == attribute),
        }
    }
}

fn eval_all(positions: &[Position], doc: &Value) -> bool {
    positions.iter().all(|p| p.eval(doc))
}

fn allowed() -> Vec<String> {
    ATTRIBUTES.iter().map(|a| a.to_string()).collect()
}

// =============================================================================
// Strategies
// =============================================================================

fn token_strategy() -> impl Strategy<Value = Token> {
    (0..ATTRIBUTES.len(), 0..VALUES.len(), any::<bool>()).prop_map(|(a, v, negated)| Token {
        attribute: ATTRIBUTES[a],
        value: VALUES[v],
        negated,
    })
}

fn position_strategy() -> impl Strategy<Value = Position> {
    prop_oneof![
        token_strategy().prop_map(Position::Literal),
        prop::collection::vec(token_strategy(), 1..4).prop_map(Position::Group),
    ]
}

fn filters_strategy() -> impl Strategy<Value = Vec<Position>> {
    prop::collection::vec(position_strategy(), 0..6)
}

/// Documents with `color` and `brand` set to one value or missing, and
/// `size` holding zero to three values (duplicates allowed)
fn doc_strategy() -> impl Strategy<Value = Value> {
    (
        prop::collection::vec(prop::option::of(0..VALUES.len()), 2),
        prop::collection::vec(0..VALUES.len(), 0..4),
    )
        .prop_map(|(slots, sizes)| {
            let mut doc = Map::new();
            for (attribute, slot) in ATTRIBUTES.iter().zip(slots) {
                if let Some(v) = slot {
                    doc.insert(attribute.to_string(), json!(VALUES[v]));
                }
            }
            if !sizes.is_empty() {
                doc.insert("size".into(), sizes.iter().map(|&v| json!(VALUES[v])).collect());
            }
            Value::Object(doc)
        })
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
        "(color|brand|price|size)(:|<|<=|>|>=|=|!=)-?[a-z0-9. ]{0,6}".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        3,  // depth
        32, // max nodes
        6,  // items per collection
        |inner| prop::collection::vec(inner, 0..6).prop_map(Value::Array),
    )
}

// =============================================================================
// Grouping fidelity
// =============================================================================

proptest! {
    #[test]
    fn prop_normalized_refinements_match_grammar(
        positions in filters_strategy(),
        docs in prop::collection::vec(doc_strategy(), 1..16),
    ) {
        let input = Value::Array(positions.iter().map(Position::to_json).collect());
        let refinements = normalize(Some(&input), None, &allowed(), &[]).unwrap();
        let condition = refinements.to_condition();

        for doc in &docs {
            prop_assert_eq!(condition.matches(doc), eval_all(&positions, doc), "doc {} filters {}", doc, input);
        }
    }

    #[test]
    fn prop_compiled_global_and_scopes_match_grammar(
        positions in filters_strategy(),
        docs in prop::collection::vec(doc_strategy(), 1..16),
    ) {
        let input = Value::Array(positions.iter().map(Position::to_json).collect());
        let allowed = allowed();
        let refinements = normalize(Some(&input), None, &allowed, &[]).unwrap();
        let hooks = HookRegistry::new();
        let filters = FilterCompiler::new(SqlDialect::Sqlite, "products", &allowed, &hooks)
            .compile(&refinements, None)
            .unwrap();

        let global = &filters.global.fragment;
        prop_assert_eq!(global.placeholder_count(), global.params.len());

        for doc in &docs {
            prop_assert_eq!(filters.global.condition.matches(doc), eval_all(&positions, doc));

            for attribute in ATTRIBUTES {
                let others: Vec<Position> = positions.iter().filter(|p| !p.mentions(attribute)).cloned().collect();
                let scope = filters.scope_condition_excluding(&BTreeSet::from([attribute.to_string()]));
                prop_assert_eq!(scope.matches(doc), eval_all(&others, doc), "scope of {}", attribute);
            }
        }
    }

    /// Attributes outside the allow-list are rejected before any SQL exists
    #[test]
    fn prop_unknown_attributes_are_rejected(attribute in "[a-z_]{1,12}", value in "[a-z]{1,6}") {
        prop_assume!(!ATTRIBUTES.contains(&attribute.as_str()));
        let input = json!([format!("{}:{}", attribute, value)]);
        let err = normalize(Some(&input), None, &allowed(), &[]).unwrap_err();
        let is_unknown = matches!(err, SearchError::UnknownAttribute { .. });
        prop_assert!(is_unknown);
    }
}

// =============================================================================
// Executed SQL
// =============================================================================

/// `docs(id, color, brand)` plus `doc_sizes(doc_id, size)`, one row per size.
/// Values come from `VALUES`, so literals are safe to inline.
fn seed_statements(docs: &[Value]) -> Vec<SqlFragment> {
    let literal = |doc: &Value, attribute: &str| {
        doc.get(attribute)
            .and_then(Value::as_str)
            .map_or_else(|| "NULL".to_string(), |v| format!("'{}'", v))
    };
    let mut statements = vec![
        SqlFragment::query(r#"CREATE TABLE "docs" ("id" INTEGER PRIMARY KEY, "color" TEXT, "brand" TEXT)"#, Vec::new()),
        SqlFragment::query(r#"CREATE TABLE "doc_sizes" ("doc_id" INTEGER, "size" TEXT)"#, Vec::new()),
    ];
    for (i, doc) in docs.iter().enumerate() {
        let id = i + 1;
        statements.push(SqlFragment::query(
            format!(
                r#"INSERT INTO "docs" VALUES ({}, {}, {})"#,
                id,
                literal(doc, "color"),
                literal(doc, "brand")
            ),
            Vec::new(),
        ));
        for size in doc.get("size").and_then(Value::as_array).into_iter().flatten().filter_map(Value::as_str) {
            statements.push(SqlFragment::query(
                format!(r#"INSERT INTO "doc_sizes" VALUES ({}, '{}')"#, id, size),
                Vec::new(),
            ));
        }
    }
    statements
}

fn select_ids(predicate: &SqlFragment) -> SqlFragment {
    let where_clause = if predicate.is_always_true() {
        String::new()
    } else {
        format!(" WHERE {}", predicate.sql)
    };
    SqlFragment::query(
        format!(r#"SELECT "id" FROM "docs"{} ORDER BY "id""#, where_clause),
        predicate.params.clone(),
    )
}

fn expected_ids(positions: &[Position], docs: &[Value]) -> Vec<i64> {
    (1..)
        .zip(docs)
        .filter(|(_, doc)| eval_all(positions, doc))
        .map(|(id, _)| id)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_executed_global_and_scopes_match_grammar(
        positions in filters_strategy(),
        docs in prop::collection::vec(doc_strategy(), 1..10),
    ) {
        let input = Value::Array(positions.iter().map(Position::to_json).collect());
        let allowed = allowed();
        let extended = [ExtendedAttribute::new("size", "doc_sizes", "doc_id")];
        let refinements = normalize(Some(&input), None, &allowed, &[]).unwrap();
        let hooks = HookRegistry::new();
        let filters = FilterCompiler::new(SqlDialect::Sqlite, "docs", &allowed, &hooks)
            .extended_attributes("id", &extended)
            .compile(&refinements, None)
            .unwrap();

        let mut statements = vec![select_ids(&filters.global.fragment)];
        for attribute in ATTRIBUTES {
            statements.push(select_ids(&filters.scope_excluding(&BTreeSet::from([attribute.to_string()]))));
        }

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let results = runtime.block_on(async {
            let executor = SqlxExecutor::connect("sqlite::memory:").await.unwrap();
            executor.execute_batch(&seed_statements(&docs)).await.unwrap();
            executor.execute_batch(&statements).await.unwrap()
        });
        let ids: Vec<Vec<i64>> = results
            .iter()
            .map(|rows| rows.iter().filter_map(|row| row["id"].as_i64()).collect())
            .collect();

        prop_assert_eq!(&ids[0], &expected_ids(&positions, &docs), "global of {} over {:?}", input, docs);
        for (attribute, scoped) in ATTRIBUTES.iter().zip(&ids[1..]) {
            let others: Vec<Position> = positions.iter().filter(|p| !p.mentions(attribute)).cloned().collect();
            prop_assert_eq!(scoped, &expected_ids(&others, &docs), "scope of {} for {}", attribute, input);
        }
    }
}

// =============================================================================
// No-panic fuzzing
// =============================================================================

proptest! {
    #[test]
    fn fuzz_filters_never_panic(facet_filters in arbitrary_json_strategy(), numeric_filters in arbitrary_json_strategy()) {
        let facets = vec!["color".to_string(), "brand".to_string()];
        let numeric = vec!["price".to_string()];
        let allowed = vec!["color".to_string(), "brand".to_string(), "price".to_string()];

        if let Ok(refinements) = normalize(Some(&facet_filters), Some(&numeric_filters), &facets, &numeric) {
            let hooks = HookRegistry::new();
            for dialect in [SqlDialect::Postgres, SqlDialect::Sqlite, SqlDialect::MySql] {
                let filters = FilterCompiler::new(dialect, "products", &allowed, &hooks)
                    .compile(&refinements, None)
                    .unwrap();
                let global = &filters.global.fragment;
                prop_assert_eq!(global.placeholder_count(), global.params.len());
                for predicate in filters.per_attribute.values().chain(&filters.disjunctions) {
                    prop_assert_eq!(predicate.fragment.placeholder_count(), predicate.fragment.params.len());
                }
            }
        }
    }

    #[test]
    fn fuzz_filter_strings_never_panic(token in ".*") {
        let facets = vec!["color".to_string()];
        let numeric = vec!["price".to_string()];
        let _ = normalize(Some(&json!([token.clone()])), None, &facets, &numeric);
        let _ = normalize(None, Some(&json!([token])), &facets, &numeric);
    }

    /// Sort aliases only ever order by sortable attributes
    #[test]
    fn fuzz_sort_alias(spec in ".*") {
        let sortable = vec!["price".to_string(), "name".to_string()];
        if let Ok(alias) = SortAlias::parse(&format!("products?sort={}", spec), &sortable) {
            for key in &alias.keys {
                prop_assert!(sortable.contains(&key.attribute));
            }
            prop_assert_eq!(alias.index, "products");
        }
    }
}
