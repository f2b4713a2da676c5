use crate::{db::query::Query, value::Value};
use std::fmt;

/// Separator between a field name and its lookup suffix (`rank__gt`).
pub const LOOKUP_SEPARATOR: &str = "__";

///
/// Lookup
///
/// Comparison kind of one predicate. Only `Exact` and `In` compile to
/// set algebra; the others parse so they can be rejected explicitly.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Lookup {
    Exact,
    In,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
    IContains,
    IStartsWith,
    IEndsWith,
}

impl Lookup {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let lookup = match raw {
            "exact" => Self::Exact,
            "in" => Self::In,
            "gt" => Self::Gt,
            "ge" | "gte" => Self::Ge,
            "lt" => Self::Lt,
            "le" | "lte" => Self::Le,
            "contains" => Self::Contains,
            "startswith" => Self::StartsWith,
            "endswith" => Self::EndsWith,
            "icontains" => Self::IContains,
            "istartswith" => Self::IStartsWith,
            "iendswith" => Self::IEndsWith,
            _ => return None,
        };

        Some(lookup)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::In => "in",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Contains => "contains",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::IContains => "icontains",
            Self::IStartsWith => "istartswith",
            Self::IEndsWith => "iendswith",
        }
    }

    /// Whether the compiler can express this lookup as set algebra.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::Exact | Self::In)
    }

    pub(crate) const fn tag(self) -> u8 {
        match self {
            Self::Exact => 0x01,
            Self::In => 0x02,
            Self::Gt => 0x03,
            Self::Ge => 0x04,
            Self::Lt => 0x05,
            Self::Le => 0x06,
            Self::Contains => 0x07,
            Self::StartsWith => 0x08,
            Self::EndsWith => 0x09,
            Self::IContains => 0x0A,
            Self::IStartsWith => 0x0B,
            Self::IEndsWith => 0x0C,
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `field__lookup` into its field and optional lookup suffix.
#[must_use]
pub fn split_lookup(expr: &str) -> (&str, Option<&str>) {
    match expr.rsplit_once(LOOKUP_SEPARATOR) {
        Some((field, lookup)) if !field.is_empty() => (field, Some(lookup)),
        _ => (expr, None),
    }
}

///
/// PredicateValues
///

#[derive(Clone, Debug)]
pub enum PredicateValues {
    /// Literal values.
    Values(Vec<Value>),
    /// Ids produced by another query; they are the field's values.
    Query(Box<Query>),
}

impl PredicateValues {
    /// Number of literal values, or `None` for a sub-query.
    #[must_use]
    pub const fn literal_count(&self) -> Option<usize> {
        match self {
            Self::Values(values) => Some(values.len()),
            Self::Query(_) => None,
        }
    }
}

///
/// Predicate
///
/// `(field, lookup, values, unique)`. Conjunctions of predicates form the
/// filter and exclude sides of a query.
///

#[derive(Clone, Debug)]
pub struct Predicate {
    pub field: String,
    pub lookup: Lookup,
    pub values: PredicateValues,
    /// Field is unique; values resolve through the unique lookup hash.
    pub unique: bool,
}

///
/// JoinPredicate
///
/// Another model's query whose `field` holds ids of the joined model.
///

#[derive(Clone, Debug)]
pub struct JoinPredicate {
    pub field: String,
    pub query: Box<Query>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_lookup_uses_the_last_separator() {
        assert_eq!(split_lookup("rank__gt"), ("rank", Some("gt")));
        assert_eq!(split_lookup("name"), ("name", None));
        assert_eq!(split_lookup("__in"), ("__in", None));
    }

    #[test]
    fn only_exact_and_in_are_supported() {
        for raw in ["gt", "gte", "lt", "contains", "istartswith"] {
            let lookup = Lookup::parse(raw).expect("lookup should parse");
            assert!(!lookup.is_supported(), "{raw} should be rejected at compile");
        }
        assert!(Lookup::parse("exact").is_some_and(Lookup::is_supported));
        assert!(Lookup::parse("in").is_some_and(Lookup::is_supported));
        assert!(Lookup::parse("regex").is_none());
    }
}
