//! Refinement normalizer
//!
//! Parses the wire filter grammars into [`AllRefinements`].
//!
//! ```text
//! facetFilters:   "color:red"                         one clause
//!                 ["color:red", "brand:-X"]           AND across positions
//!                 [["brand:X", "brand:Y"], "size:M"]  nested array = OR group
//!                 "(brand:X,brand:Y),size:M"          legacy comma form of the above
//! numericFilters: "price>=10", "price=[10,20]", "price:10 TO 20"
//! ```
//!
//! Nested arrays go exactly one level deep. Every attribute is checked
//! against the allow-lists before anything else is built from it.

use serde_json::Value;
use tracing::debug;

use super::refinements::{
    AllRefinements, Disjunction, NumericValue, Operator, RangeBound, Refinement, RefinementValue,
};
use crate::error::{FilterOrigin, SearchError, SearchResult};

/// One position of a filter array
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterClause {
    /// A single filter string, conjoined with its siblings
    Literal(String),
    /// A nested array whose members are disjoined
    OrGroup(Vec<String>),
}

impl FilterClause {
    /// Parse a `facetFilters` / `numericFilters` value into clauses.
    ///
    /// A string holding a JSON array (as URL-encoded clients send it) is
    /// decoded first. Any other string may use the legacy comma form.
    pub fn parse_all(input: &Value, origin: FilterOrigin) -> SearchResult<Vec<FilterClause>> {
        match input {
            Value::Null => Ok(Vec::new()),
            Value::String(s) if s.trim_start().starts_with('[') => {
                let decoded: Value = serde_json::from_str(s)
                    .map_err(|e| SearchError::malformed(origin, s.as_str(), e.to_string()))?;
                Self::parse_all(&decoded, origin)
            }
            Value::String(s) if s.contains(',') || s.trim_start().starts_with('(') => Self::parse_legacy(s, origin),
            Value::String(s) => Ok(vec![FilterClause::Literal(s.clone())]),
            Value::Array(items) => items.iter().map(|item| Self::parse_one(item, origin)).collect(),
            other => Err(SearchError::malformed(
                origin,
                other.to_string(),
                "expected a string or an array",
            )),
        }
    }

    /// `"a:1,(b:2,b:3)"`: top-level commas separate positions, a
    /// parenthesized position is an OR group.
    fn parse_legacy(input: &str, origin: FilterOrigin) -> SearchResult<Vec<FilterClause>> {
        split_top_level(input, origin)?
            .into_iter()
            .map(|segment| {
                let segment = segment.trim();
                if segment.is_empty() {
                    return Err(SearchError::malformed(origin, input, "empty filter in comma-separated list"));
                }
                match segment.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
                    Some(inner) => {
                        let members = split_top_level(inner, origin)?;
                        if members.iter().any(|m| m.trim_start().starts_with('(')) {
                            return Err(SearchError::malformed(origin, input, "filters nest at most one level deep"));
                        }
                        Ok(FilterClause::OrGroup(
                            members
                                .into_iter()
                                .map(|m| m.trim().to_string())
                                .filter(|m| !m.is_empty())
                                .collect(),
                        ))
                    }
                    None => Ok(FilterClause::Literal(segment.to_string())),
                }
            })
            .collect()
    }

    fn parse_one(item: &Value, origin: FilterOrigin) -> SearchResult<FilterClause> {
        match item {
            Value::String(s) => Ok(FilterClause::Literal(s.clone())),
            Value::Array(members) => members
                .iter()
                .map(|member| match member {
                    Value::String(s) => Ok(s.clone()),
                    Value::Array(_) => Err(SearchError::malformed(
                        origin,
                        member.to_string(),
                        "filters nest at most one level deep",
                    )),
                    other => Err(SearchError::malformed(origin, other.to_string(), "expected a string")),
                })
                .collect::<SearchResult<Vec<_>>>()
                .map(FilterClause::OrGroup),
            other => Err(SearchError::malformed(
                origin,
                other.to_string(),
                "expected a string or an array of strings",
            )),
        }
    }
}

/// Parse and validate both filter inputs into the canonical model.
pub fn normalize(
    facet_filters: Option<&Value>,
    numeric_filters: Option<&Value>,
    allowed_facets: &[String],
    allowed_numeric: &[String],
) -> SearchResult<AllRefinements> {
    let validator = Validator {
        facets: allowed_facets,
        numeric: allowed_numeric,
    };
    let mut all = AllRefinements::default();

    if let Some(input) = facet_filters {
        for clause in FilterClause::parse_all(input, FilterOrigin::FacetFilters)? {
            apply_clause(&mut all, clause, |token| validator.facet(token))?;
        }
    }
    if let Some(input) = numeric_filters {
        for clause in FilterClause::parse_all(input, FilterOrigin::NumericFilters)? {
            apply_clause(&mut all, clause, |token| validator.numeric(token))?;
        }
    }

    debug!(
        attributes = all.attributes.len(),
        disjunctions = all.disjunctions.len(),
        "Normalized refinements"
    );
    Ok(all)
}

fn apply_clause(
    all: &mut AllRefinements,
    clause: FilterClause,
    parse: impl Fn(&str) -> SearchResult<Refinement>,
) -> SearchResult<()> {
    match clause {
        FilterClause::Literal(token) => {
            let refinement = parse(&token)?;
            add_conjunct(all, refinement);
        }
        FilterClause::OrGroup(tokens) => {
            let terms = tokens.iter().map(|t| parse(t)).collect::<SearchResult<Vec<_>>>()?;
            add_group(all, terms);
        }
    }
    Ok(())
}

fn add_conjunct(all: &mut AllRefinements, refinement: Refinement) {
    match refinement {
        Refinement::Facet {
            attribute,
            value,
            negated,
        } => {
            let entry = all.entry(&attribute);
            if negated {
                entry.and_not.push(value);
            } else {
                entry.and.push(value);
            }
        }
        Refinement::Numeric {
            attribute,
            operator,
            value: NumericValue::Scalar(n),
        } => {
            let entry = all.entry(&attribute);
            match operator {
                Operator::Eq => entry.and.push(RefinementValue::Number(n)),
                Operator::Ne => entry.and_not.push(RefinementValue::Number(n)),
                _ => entry.ranges.push(RangeBound { operator, bound: n }),
            }
        }
        Refinement::Numeric {
            attribute,
            operator: Operator::Eq,
            value: NumericValue::Vector(ns),
        } => {
            all.entry(&attribute)
                .or
                .push(ns.into_iter().map(RefinementValue::Number).collect());
        }
        vector @ Refinement::Numeric { .. } => all.disjunctions.push(Disjunction { terms: vec![vector] }),
        Refinement::Interval {
            attribute,
            lower,
            upper,
        } => {
            let entry = all.entry(&attribute);
            entry.ranges.push(RangeBound {
                operator: Operator::Gte,
                bound: lower,
            });
            entry.ranges.push(RangeBound {
                operator: Operator::Lte,
                bound: upper,
            });
        }
    }
}

fn add_group(all: &mut AllRefinements, mut terms: Vec<Refinement>) {
    if terms.len() <= 1 {
        if let Some(term) = terms.pop() {
            add_conjunct(all, term);
        }
        return;
    }

    let attribute = terms[0].attribute().to_string();
    let same_attribute = terms.iter().all(|t| t.attribute() == attribute);
    let values: Option<Vec<Vec<RefinementValue>>> = terms.iter().map(Refinement::positive_values).collect();

    match values {
        Some(values) if same_attribute => {
            all.entry(&attribute).or.push(values.into_iter().flatten().collect());
        }
        _ => all.disjunctions.push(Disjunction { terms }),
    }
}

struct Validator<'a> {
    facets: &'a [String],
    numeric: &'a [String],
}

impl Validator<'_> {
    fn is_facet(&self, attribute: &str) -> bool {
        self.facets.iter().any(|a| a == attribute)
    }

    fn is_numeric(&self, attribute: &str) -> bool {
        self.numeric.iter().any(|a| a == attribute)
    }

    fn facet(&self, token: &str) -> SearchResult<Refinement> {
        let origin = FilterOrigin::FacetFilters;
        let (attribute, raw) = token
            .split_once(':')
            .ok_or_else(|| SearchError::malformed(origin, token, "expected attribute:value"))?;
        let attribute = unquote(attribute.trim());
        if attribute.is_empty() {
            return Err(SearchError::malformed(origin, token, "empty attribute"));
        }
        if !self.is_facet(attribute) {
            return Err(SearchError::unknown_attribute(attribute, origin));
        }

        let raw = raw.trim();
        let (negated, raw) = if let Some(rest) = raw.strip_prefix("\\-") {
            (false, format!("-{}", rest))
        } else if let Some(rest) = raw.strip_prefix('-') {
            (true, rest.to_string())
        } else {
            (false, raw.to_string())
        };
        let text = unquote(raw.trim());

        let value = if self.is_numeric(attribute) {
            let n = parse_number(text).ok_or_else(|| SearchError::TypeMismatch {
                attribute: attribute.to_string(),
                reason: format!("'{}' is not a number", text),
            })?;
            RefinementValue::Number(n)
        } else {
            RefinementValue::Text(text.to_string())
        };

        Ok(Refinement::Facet {
            attribute: attribute.to_string(),
            value,
            negated,
        })
    }

    fn numeric(&self, token: &str) -> SearchResult<Refinement> {
        let origin = FilterOrigin::NumericFilters;
        let parsed = parse_numeric(token)?;
        let attribute = parsed.attribute();
        if !self.is_numeric(attribute) {
            return Err(if self.is_facet(attribute) {
                SearchError::TypeMismatch {
                    attribute: attribute.to_string(),
                    reason: "numeric filter on a non-numeric attribute".to_string(),
                }
            } else {
                SearchError::unknown_attribute(attribute, origin)
            });
        }
        Ok(parsed)
    }
}

/// Parse `attr<op>value`, `attr<op>[v1,v2]` or `attr:lower TO upper`.
fn parse_numeric(token: &str) -> SearchResult<Refinement> {
    let origin = FilterOrigin::NumericFilters;
    let malformed = |reason: &str| SearchError::malformed(origin, token, reason);

    let Some(op_start) = token.find(['<', '>', '=', '!']) else {
        return parse_interval(token);
    };
    let attribute = unquote(token[..op_start].trim());
    if attribute.is_empty() {
        return Err(malformed("empty attribute"));
    }

    let rest = &token[op_start..];
    let (operator, value) = ["<=", ">=", "!=", "<", ">", "="]
        .iter()
        .find_map(|op| rest.strip_prefix(op).map(|v| (*op, v)))
        .and_then(|(op, v)| Operator::parse(op).map(|op| (op, v)))
        .ok_or_else(|| malformed("unknown operator"))?;

    let value = value.trim();
    let value = if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        let numbers = inner
            .split(',')
            .map(|v| parse_number(v.trim()))
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| malformed("vector members must be numbers"))?;
        if numbers.is_empty() {
            return Err(malformed("empty vector"));
        }
        NumericValue::Vector(numbers)
    } else {
        NumericValue::Scalar(parse_number(value).ok_or_else(|| malformed("value is not a number"))?)
    };

    Ok(Refinement::Numeric {
        attribute: attribute.to_string(),
        operator,
        value,
    })
}

fn parse_interval(token: &str) -> SearchResult<Refinement> {
    let origin = FilterOrigin::NumericFilters;
    let malformed = |reason: &str| SearchError::malformed(origin, token, reason);

    let (attribute, range) = token.split_once(':').ok_or_else(|| malformed("missing operator"))?;
    let attribute = unquote(attribute.trim());
    if attribute.is_empty() {
        return Err(malformed("empty attribute"));
    }
    let (lower, upper) = range
        .split_once(" TO ")
        .ok_or_else(|| malformed("expected 'lower TO upper'"))?;
    let lower = parse_number(lower.trim()).ok_or_else(|| malformed("lower bound is not a number"))?;
    let upper = parse_number(upper.trim()).ok_or_else(|| malformed("upper bound is not a number"))?;

    Ok(Refinement::Interval {
        attribute: attribute.to_string(),
        lower,
        upper,
    })
}

fn parse_number(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Split on commas outside quotes, parentheses and interval brackets
fn split_top_level(input: &str, origin: FilterOrigin) -> SearchResult<Vec<&str>> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '(' | '[' if !quoted => depth += 1,
            ')' | ']' if !quoted => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SearchError::malformed(origin, input, "unbalanced brackets"))?;
            }
            ',' if !quoted && depth == 0 => {
                segments.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted || depth != 0 {
        return Err(SearchError::malformed(origin, input, "unbalanced brackets or quotes"));
    }
    segments.push(&input[start..]);
    Ok(segments)
}

fn unquote(text: &str) -> &str {
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn facets() -> Vec<String> {
        vec!["color".into(), "brand".into(), "size".into(), "rating".into()]
    }

    fn numeric() -> Vec<String> {
        vec!["price".into(), "rating".into()]
    }

    fn run(facet_filters: Value, numeric_filters: Value) -> SearchResult<AllRefinements> {
        normalize(Some(&facet_filters), Some(&numeric_filters), &facets(), &numeric())
    }

    #[test]
    fn test_clause_shapes() {
        let clauses = FilterClause::parse_all(&json!(["a:1", ["b:2", "b:3"]]), FilterOrigin::FacetFilters).unwrap();
        assert_eq!(
            clauses,
            vec![
                FilterClause::Literal("a:1".into()),
                FilterClause::OrGroup(vec!["b:2".into(), "b:3".into()]),
            ]
        );
        assert_eq!(
            FilterClause::parse_all(&json!("a:1"), FilterOrigin::FacetFilters).unwrap(),
            vec![FilterClause::Literal("a:1".into())]
        );
        assert_eq!(
            FilterClause::parse_all(&json!("[[\"a:1\"]]"), FilterOrigin::FacetFilters).unwrap(),
            vec![FilterClause::OrGroup(vec!["a:1".into()])]
        );
    }

    #[test]
    fn test_legacy_comma_form() {
        let clauses =
            FilterClause::parse_all(&json!("color:red, (brand:X,brand:Y),size:\"S, M\""), FilterOrigin::FacetFilters)
                .unwrap();
        assert_eq!(
            clauses,
            vec![
                FilterClause::Literal("color:red".into()),
                FilterClause::OrGroup(vec!["brand:X".into(), "brand:Y".into()]),
                FilterClause::Literal("size:\"S, M\"".into()),
            ]
        );

        let all = run(json!("color:red,brand:X"), json!("price=[10,20],rating>3")).unwrap();
        assert_eq!(all.get("color").unwrap().and, vec![RefinementValue::from("red")]);
        assert_eq!(all.get("brand").unwrap().and, vec![RefinementValue::from("X")]);
        assert!(all.get("price").is_some());
        assert!(all.get("rating").is_some());

        for bad in ["color:red,,brand:X", "(color:red", "color:red,(brand:X,(size:M))", "color:red),brand:X"] {
            let err = run(json!(bad), Value::Null).unwrap_err();
            assert!(matches!(err, SearchError::MalformedFilter { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_deep_nesting_is_malformed() {
        let err = run(json!([[["color:red"]]]), Value::Null).unwrap_err();
        assert!(matches!(err, SearchError::MalformedFilter { .. }));
        let err = run(json!([42]), Value::Null).unwrap_err();
        assert!(matches!(err, SearchError::MalformedFilter { .. }));
    }

    #[test]
    fn test_flat_array_is_conjunction() {
        let all = run(json!(["color:red", "brand:-X", "brand:Y"]), Value::Null).unwrap();
        let color = all.get("color").unwrap();
        assert_eq!(color.and, vec![RefinementValue::from("red")]);
        let brand = all.get("brand").unwrap();
        assert_eq!(brand.and, vec![RefinementValue::from("Y")]);
        assert_eq!(brand.and_not, vec![RefinementValue::from("X")]);
        assert!(all.disjunctions.is_empty());
    }

    #[test]
    fn test_same_attribute_group_is_or() {
        let all = run(json!([["brand:X", "brand:Y"], "color:red"]), Value::Null).unwrap();
        assert_eq!(
            all.get("brand").unwrap().or,
            vec![vec![RefinementValue::from("X"), RefinementValue::from("Y")]]
        );
        assert!(all.disjunctions.is_empty());
    }

    #[test]
    fn test_mixed_group_is_kept_whole() {
        let all = run(json!([["brand:X", "color:red"], ["brand:-Y", "brand:Z"]]), Value::Null).unwrap();
        assert_eq!(all.disjunctions.len(), 2);
        assert!(all.get("brand").is_none());
        assert_eq!(
            all.disjunctions[0].attributes().into_iter().collect::<Vec<_>>(),
            vec!["brand", "color"]
        );
    }

    #[test]
    fn test_negation_escape_and_quotes() {
        let all = run(json!(["size:\\-1", "color:\"dark red\""]), Value::Null).unwrap();
        assert_eq!(all.get("size").unwrap().and, vec![RefinementValue::from("-1")]);
        assert_eq!(all.get("color").unwrap().and, vec![RefinementValue::from("dark red")]);
    }

    #[test]
    fn test_unknown_attribute_names_source() {
        let err = run(json!(["password:x"]), Value::Null).unwrap_err();
        match err {
            SearchError::UnknownAttribute { attribute, origin } => {
                assert_eq!(attribute, "password");
                assert_eq!(origin, FilterOrigin::FacetFilters);
            }
            other => panic!("Expected UnknownAttribute, got {:?}", other),
        }
        let err = run(Value::Null, json!(["secret>1"])).unwrap_err();
        assert!(matches!(
            err,
            SearchError::UnknownAttribute {
                origin: FilterOrigin::NumericFilters,
                ..
            }
        ));
    }

    #[test]
    fn test_numeric_on_facet_attribute_is_type_mismatch() {
        let err = run(Value::Null, json!(["color>1"])).unwrap_err();
        assert!(matches!(err, SearchError::TypeMismatch { .. }));
        let err = run(json!(["rating:great"]), Value::Null).unwrap_err();
        assert!(matches!(err, SearchError::TypeMismatch { .. }));
        let all = run(json!(["rating:4"]), Value::Null).unwrap();
        assert_eq!(all.get("rating").unwrap().and, vec![RefinementValue::Number(4.0)]);
    }

    #[test]
    fn test_numeric_operators() {
        let all = run(Value::Null, json!(["price>=10", "price<20", "price!=15", "rating=5"])).unwrap();
        let price = all.get("price").unwrap();
        assert_eq!(
            price.ranges,
            vec![
                RangeBound {
                    operator: Operator::Gte,
                    bound: 10.0
                },
                RangeBound {
                    operator: Operator::Lt,
                    bound: 20.0
                },
            ]
        );
        assert_eq!(price.and_not, vec![RefinementValue::Number(15.0)]);
        assert_eq!(all.get("rating").unwrap().and, vec![RefinementValue::Number(5.0)]);
    }

    #[test]
    fn test_flat_versus_nested_numeric_equality() {
        let flat = run(Value::Null, json!(["price=10", "price=20"])).unwrap();
        let price = flat.get("price").unwrap();
        assert_eq!(price.and.len(), 2);
        assert!(price.or.is_empty());

        let nested = run(Value::Null, json!([["price=10", "price=20"]])).unwrap();
        assert_eq!(
            nested.get("price").unwrap().or,
            vec![vec![RefinementValue::Number(10.0), RefinementValue::Number(20.0)]]
        );
    }

    #[test]
    fn test_vector_values() {
        let all = run(Value::Null, json!(["price=[10, 20]", "rating>[3,4]"])).unwrap();
        assert_eq!(
            all.get("price").unwrap().or,
            vec![vec![RefinementValue::Number(10.0), RefinementValue::Number(20.0)]]
        );
        assert_eq!(all.disjunctions.len(), 1);
        assert_eq!(
            all.disjunctions[0].terms[0],
            Refinement::Numeric {
                attribute: "rating".into(),
                operator: Operator::Gt,
                value: NumericValue::Vector(vec![3.0, 4.0]),
            }
        );
    }

    #[test]
    fn test_interval_syntax() {
        let all = run(Value::Null, json!(["price:10 TO 20"])).unwrap();
        assert_eq!(all.get("price").unwrap().ranges.len(), 2);
        assert_eq!(all.get("price").unwrap().ranges[0].operator, Operator::Gte);
        assert_eq!(all.get("price").unwrap().ranges[1].operator, Operator::Lte);
    }

    #[test]
    fn test_malformed_numeric_tokens() {
        for token in ["price", "price>", "price>abc", "price=[]", "price=[1,x]", ">5", "price!5", "price:1 TO"] {
            let err = run(Value::Null, json!([token])).unwrap_err();
            assert!(
                matches!(err, SearchError::MalformedFilter { .. }),
                "{} gave {:?}",
                token,
                err
            );
        }
    }

    #[test]
    fn test_empty_groups_are_ignored() {
        let all = run(json!([[]]), json!([])).unwrap();
        assert!(all.is_empty());
    }
}
