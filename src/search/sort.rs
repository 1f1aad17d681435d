//! Sort aliases
//!
//! Sorting is selected through the index name, never through raw SQL:
//!
//! ```text
//! products                                   relevance (objectID order)
//! products?sort=price+asc
//! products?sort=price+desc+nulls+last,name+asc
//! ```

use crate::error::{SearchError, SearchResult};
use crate::sql::SqlDialect;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub descending: bool,
    /// `Some(true)` for `nulls last`, `Some(false)` for `nulls first`
    pub nulls_last: Option<bool>,
}

impl SortKey {
    pub fn to_sql(&self, dialect: SqlDialect) -> String {
        dialect.order_term(&dialect.quote_ident(&self.attribute), self.descending, self.nulls_last)
    }
}

/// A parsed `<index>[?sort=...]` name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortAlias {
    pub index: String,
    pub keys: Vec<SortKey>,
}

impl SortAlias {
    /// Parse an index name. Sort attributes are checked against `sortable`.
    pub fn parse(name: &str, sortable: &[String]) -> SearchResult<Self> {
        let Some((index, query)) = name.split_once('?') else {
            return Ok(Self {
                index: name.to_string(),
                keys: Vec::new(),
            });
        };
        let invalid = |reason: String| SearchError::InvalidSort {
            alias: name.to_string(),
            reason,
        };

        let spec = query
            .strip_prefix("sort=")
            .ok_or_else(|| invalid("expected '?sort=' after the index name".into()))?;
        // `+` and `%20` both stand for a space in aliases.
        let spec = spec.replace("%20", " ").replace('+', " ");

        let mut keys = Vec::new();
        for part in spec.split(',') {
            let words: Vec<&str> = part.split_whitespace().collect();
            let (attribute, modifiers) = words
                .split_first()
                .ok_or_else(|| invalid("empty sort key".into()))?;
            if !sortable.iter().any(|s| s == attribute) {
                return Err(invalid(format!("'{}' is not sortable", attribute)));
            }

            let modifiers: Vec<String> = modifiers.iter().map(|m| m.to_ascii_lowercase()).collect();
            let (descending, rest) = match modifiers.split_first() {
                None => (false, &modifiers[..]),
                Some((dir, rest)) if dir == "asc" => (false, rest),
                Some((dir, rest)) if dir == "desc" => (true, rest),
                Some((other, _)) => return Err(invalid(format!("unknown direction '{}'", other))),
            };
            let nulls_last = match rest {
                [] => None,
                [nulls, place] if nulls == "nulls" && place == "last" => Some(true),
                [nulls, place] if nulls == "nulls" && place == "first" => Some(false),
                _ => return Err(invalid(format!("unexpected modifiers in '{}'", part.trim()))),
            };

            keys.push(SortKey {
                attribute: attribute.to_string(),
                descending,
                nulls_last,
            });
        }

        Ok(Self {
            index: index.to_string(),
            keys,
        })
    }

    /// `ORDER BY` list with the tie-breaker column appended
    pub fn order_by(&self, dialect: SqlDialect, tie_breaker: &str) -> String {
        let mut terms: Vec<String> = self
            .keys
            .iter()
            .filter(|k| k.attribute != tie_breaker)
            .map(|k| k.to_sql(dialect))
            .collect();
        terms.push(format!("{} ASC", dialect.quote_ident(tie_breaker)));
        terms.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sortable() -> Vec<String> {
        vec!["price".into(), "name".into()]
    }

    #[test]
    fn test_plain_index_name() {
        let alias = SortAlias::parse("products", &sortable()).unwrap();
        assert_eq!(alias.index, "products");
        assert!(alias.keys.is_empty());
        assert_eq!(alias.order_by(SqlDialect::Postgres, "id"), "\"id\" ASC");
    }

    #[test]
    fn test_multi_key_alias() {
        let alias = SortAlias::parse("products?sort=price+desc+nulls+last,name", &sortable()).unwrap();
        assert_eq!(alias.index, "products");
        assert_eq!(
            alias.keys,
            vec![
                SortKey {
                    attribute: "price".into(),
                    descending: true,
                    nulls_last: Some(true)
                },
                SortKey {
                    attribute: "name".into(),
                    descending: false,
                    nulls_last: None
                },
            ]
        );
        assert_eq!(
            alias.order_by(SqlDialect::Postgres, "id"),
            "\"price\" DESC NULLS LAST, \"name\" ASC, \"id\" ASC"
        );
    }

    #[test]
    fn test_rejects_unsortable_and_garbage() {
        for name in [
            "products?sort=password+asc",
            "products?order=price",
            "products?sort=price+sideways",
            "products?sort=price+asc+nulls",
            "products?sort=",
            "products?sort=price;DROP TABLE x",
        ] {
            let err = SortAlias::parse(name, &sortable()).unwrap_err();
            assert!(matches!(err, SearchError::InvalidSort { .. }), "{}", name);
        }
    }
}
