//! Refinement model
//!
//! The canonical, unambiguous form of `facetFilters` + `numericFilters`.
//!
//! ```text
//! AllRefinements
//!   ├─ attributes: attr → Refinements { OR: [[v..]..], AND: [v..], AND NOT: [v..], RANGES: [{op: n}..] }
//!   └─ disjunctions: [Disjunction { terms: [Refinement..] }]
//! ```
//!
//! Within one attribute each `OR` group is a disjunction, `AND` members are
//! conjoined, `AND NOT` members are each excluded and `RANGES` bounds are
//! conjoined; the four groups are themselves conjoined. Any OR group that is
//! not "positive equality on exactly one attribute" is kept whole as a
//! [`Disjunction`], so it compiles to a single expression.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::condition::Condition;

/// Comparison operator of a numeric filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    /// Operator as written in the filter grammar
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Eq => "=",
            Operator::Ne => "!=",
        }
    }

    /// Operator as emitted in SQL
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Ne => "<>",
            other => other.as_str(),
        }
    }

    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Lte),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Gte),
            "=" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            _ => None,
        }
    }

    pub fn compare(&self, left: f64, right: f64) -> bool {
        match self {
            Operator::Lt => left < right,
            Operator::Lte => left <= right,
            Operator::Gt => left > right,
            Operator::Gte => left >= right,
            Operator::Eq => left == right,
            Operator::Ne => left != right,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A facet or numeric value compared by equality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefinementValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for RefinementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefinementValue::Number(n) => write!(f, "{}", n),
            RefinementValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RefinementValue {
    fn from(value: &str) -> Self {
        RefinementValue::Text(value.to_string())
    }
}

impl From<f64> for RefinementValue {
    fn from(value: f64) -> Self {
        RefinementValue::Number(value)
    }
}

/// Right-hand side of a numeric comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericValue {
    Scalar(f64),
    /// Operator applied per element, results unioned
    Vector(Vec<f64>),
}

/// One bound of a `RANGES` entry, serialized as `{ ">=": 10 }`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeBound {
    pub operator: Operator,
    pub bound: f64,
}

impl Serialize for RangeBound {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.operator.as_str(), &self.bound)?;
        map.end()
    }
}

/// One atomic constraint on one attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Refinement {
    Facet {
        attribute: String,
        value: RefinementValue,
        negated: bool,
    },
    Numeric {
        attribute: String,
        operator: Operator,
        value: NumericValue,
    },
    /// `attr:lower TO upper`, both ends inclusive
    Interval {
        attribute: String,
        lower: f64,
        upper: f64,
    },
}

impl Refinement {
    pub fn attribute(&self) -> &str {
        match self {
            Refinement::Facet { attribute, .. }
            | Refinement::Numeric { attribute, .. }
            | Refinement::Interval { attribute, .. } => attribute,
        }
    }

    /// Positive equality values, if this refinement is nothing more than that.
    pub(crate) fn positive_values(&self) -> Option<Vec<RefinementValue>> {
        match self {
            Refinement::Facet { value, negated: false, .. } => Some(vec![value.clone()]),
            Refinement::Numeric {
                operator: Operator::Eq,
                value,
                ..
            } => Some(match value {
                NumericValue::Scalar(n) => vec![RefinementValue::Number(*n)],
                NumericValue::Vector(ns) => ns.iter().map(|n| RefinementValue::Number(*n)).collect(),
            }),
            _ => None,
        }
    }

    pub fn to_condition(&self) -> Condition {
        match self {
            Refinement::Facet {
                attribute,
                value,
                negated,
            } => Condition::In {
                attribute: attribute.clone(),
                values: vec![value.clone()],
                negated: *negated,
            },
            Refinement::Numeric {
                attribute,
                operator,
                value,
            } => match value {
                NumericValue::Scalar(n) => numeric_condition(attribute, *operator, *n),
                NumericValue::Vector(ns) => match operator {
                    Operator::Eq => Condition::In {
                        attribute: attribute.clone(),
                        values: ns.iter().map(|n| RefinementValue::Number(*n)).collect(),
                        negated: false,
                    },
                    _ => Condition::Or(
                        ns.iter()
                            .map(|n| numeric_condition(attribute, *operator, *n))
                            .collect(),
                    ),
                },
            },
            Refinement::Interval {
                attribute,
                lower,
                upper,
            } => Condition::And(vec![
                numeric_condition(attribute, Operator::Gte, *lower),
                numeric_condition(attribute, Operator::Lte, *upper),
            ]),
        }
    }
}

fn numeric_condition(attribute: &str, operator: Operator, value: f64) -> Condition {
    match operator {
        Operator::Eq | Operator::Ne => Condition::In {
            attribute: attribute.to_string(),
            values: vec![RefinementValue::Number(value)],
            negated: operator == Operator::Ne,
        },
        _ => Condition::Compare {
            attribute: attribute.to_string(),
            operator,
            value,
        },
    }
}

/// An OR group kept whole: mixed attributes, negations or comparisons.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Disjunction {
    pub terms: Vec<Refinement>,
}

impl Disjunction {
    /// Every attribute the group constrains
    pub fn attributes(&self) -> BTreeSet<String> {
        self.terms.iter().map(|t| t.attribute().to_string()).collect()
    }

    pub fn to_condition(&self) -> Condition {
        Condition::Or(self.terms.iter().map(Refinement::to_condition).collect())
    }
}

/// Refinements on one attribute
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Refinements {
    #[serde(rename = "OR")]
    pub or: Vec<Vec<RefinementValue>>,
    #[serde(rename = "AND")]
    pub and: Vec<RefinementValue>,
    #[serde(rename = "AND NOT")]
    pub and_not: Vec<RefinementValue>,
    #[serde(rename = "RANGES")]
    pub ranges: Vec<RangeBound>,
}

impl Refinements {
    pub fn is_empty(&self) -> bool {
        self.or.is_empty() && self.and.is_empty() && self.and_not.is_empty() && self.ranges.is_empty()
    }

    /// Values the user selected positively, in the order they were given.
    /// Single-value OR groups count (that is how menus send a selection).
    pub fn selected_values(&self) -> impl Iterator<Item = &RefinementValue> {
        self.and.iter().chain(
            self.or
                .iter()
                .filter(|group| group.len() == 1)
                .flat_map(|group| group.iter()),
        )
    }

    /// Conjunction of the four groups for `attribute`.
    pub fn to_conditions(&self, attribute: &str) -> Vec<Condition> {
        let mut parts = Vec::new();
        for group in &self.or {
            parts.push(Condition::In {
                attribute: attribute.to_string(),
                values: group.clone(),
                negated: false,
            });
        }
        for value in &self.and {
            parts.push(Condition::In {
                attribute: attribute.to_string(),
                values: vec![value.clone()],
                negated: false,
            });
        }
        if !self.and_not.is_empty() {
            parts.push(Condition::In {
                attribute: attribute.to_string(),
                values: self.and_not.clone(),
                negated: true,
            });
        }
        for range in &self.ranges {
            parts.push(Condition::Compare {
                attribute: attribute.to_string(),
                operator: range.operator,
                value: range.bound,
            });
        }
        parts
    }
}

/// Every refinement of one request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AllRefinements {
    pub attributes: BTreeMap<String, Refinements>,
    pub disjunctions: Vec<Disjunction>,
}

impl AllRefinements {
    pub fn is_empty(&self) -> bool {
        self.attributes.values().all(Refinements::is_empty) && self.disjunctions.is_empty()
    }

    pub fn get(&self, attribute: &str) -> Option<&Refinements> {
        self.attributes.get(attribute)
    }

    pub(crate) fn entry(&mut self, attribute: &str) -> &mut Refinements {
        self.attributes.entry(attribute.to_string()).or_default()
    }

    /// Attributes with at least one active refinement
    pub fn active_attributes(&self) -> BTreeSet<String> {
        let mut attrs: BTreeSet<String> = self
            .attributes
            .iter()
            .filter(|(_, r)| !r.is_empty())
            .map(|(a, _)| a.clone())
            .collect();
        for group in &self.disjunctions {
            attrs.extend(group.attributes());
        }
        attrs
    }

    /// Conjunction of everything, for in-memory evaluation.
    pub fn to_condition(&self) -> Condition {
        let mut parts = Vec::new();
        for (attribute, refinements) in &self.attributes {
            parts.extend(refinements.to_conditions(attribute));
        }
        parts.extend(self.disjunctions.iter().map(Disjunction::to_condition));
        Condition::And(parts)
    }
}
