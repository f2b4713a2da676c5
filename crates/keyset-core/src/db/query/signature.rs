//! Content address of a query's predicate structure.
//!
//! Every component is length-prefixed and tagged, so two distinct predicate
//! trees never produce the same byte stream. Ordering, windowing, and load
//! options are excluded: they do not change the matching id set.
#![expect(clippy::cast_possible_truncation)]

use crate::{
    db::query::{JoinPredicate, Predicate, PredicateValues, Query},
    value::Value,
};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};

///
/// QuerySignature
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct QuerySignature([u8; 32]);

impl QuerySignature {
    #[must_use]
    pub fn of(query: &Query) -> Self {
        let mut hasher = Sha256::new();
        hash_query(&mut hasher, query);
        Self(hasher.finalize().into())
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn hash_query(hasher: &mut Sha256, query: &Query) {
    write_tag(hasher, 0x01);
    write_str(hasher, query.meta().name());
    write_str(hasher, query.meta().partition());

    write_tag(hasher, 0x02);
    hash_predicates(hasher, query.filters());
    write_tag(hasher, 0x03);
    hash_predicates(hasher, query.excludes());
    write_tag(hasher, 0x04);
    hash_joins(hasher, query.joins());
}

fn hash_predicates(hasher: &mut Sha256, predicates: &[Predicate]) {
    write_u32(hasher, predicates.len() as u32);
    for predicate in predicates {
        write_str(hasher, &predicate.field);
        write_tag(hasher, predicate.lookup.tag());
        match &predicate.values {
            PredicateValues::Values(values) => {
                write_tag(hasher, 0x10);
                write_u32(hasher, values.len() as u32);
                for value in values {
                    write_value(hasher, value);
                }
            }
            PredicateValues::Query(query) => {
                write_tag(hasher, 0x11);
                hash_query(hasher, query);
            }
        }
    }
}

fn hash_joins(hasher: &mut Sha256, joins: &[JoinPredicate]) {
    write_u32(hasher, joins.len() as u32);
    for join in joins {
        write_str(hasher, &join.field);
        hash_query(hasher, &join.query);
    }
}

fn write_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => write_tag(hasher, 0x20),
        Value::Bool(v) => {
            write_tag(hasher, 0x21);
            write_tag(hasher, u8::from(*v));
        }
        Value::Int(v) => {
            write_tag(hasher, 0x22);
            hasher.update(v.to_be_bytes());
        }
        Value::Float(v) => {
            write_tag(hasher, 0x23);
            hasher.update(v.to_bits().to_be_bytes());
        }
        Value::Text(v) => {
            write_tag(hasher, 0x24);
            write_str(hasher, v);
        }
    }
}

fn write_str(hasher: &mut Sha256, value: &str) {
    write_u32(hasher, value.len() as u32);
    hasher.update(value.as_bytes());
}

fn write_u32(hasher: &mut Sha256, value: u32) {
    hasher.update(value.to_be_bytes());
}

fn write_tag(hasher: &mut Sha256, tag: u8) {
    hasher.update([tag]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{item_meta, tag_meta};

    #[test]
    fn identical_queries_share_a_signature() {
        let a = Query::new(item_meta()).filter("group", "g").order_by("rank");
        let b = Query::new(item_meta()).filter("group", "g").slice(0, 3);

        assert_eq!(QuerySignature::of(&a), QuerySignature::of(&b));
        assert_eq!(QuerySignature::of(&a).to_hex().len(), 64);
    }

    #[test]
    fn filter_and_exclude_sides_are_distinguished() {
        let filtered = Query::new(item_meta()).filter("group", "g");
        let excluded = Query::new(item_meta()).exclude("group", "g");

        assert_ne!(QuerySignature::of(&filtered), QuerySignature::of(&excluded));
    }

    #[test]
    fn value_kinds_and_boundaries_are_distinguished() {
        let int = Query::new(item_meta()).filter("group", 1);
        let text = Query::new(item_meta()).filter("group", "1");
        assert_ne!(QuerySignature::of(&int), QuerySignature::of(&text));

        let split = Query::new(item_meta()).filter_in("group", ["ab", "c"]);
        let joined = Query::new(item_meta()).filter_in("group", ["a", "bc"]);
        assert_ne!(QuerySignature::of(&split), QuerySignature::of(&joined));
    }

    #[test]
    fn nested_queries_contribute_their_structure() {
        let red = Query::new(tag_meta()).filter("label", "red");
        let blue = Query::new(tag_meta()).filter("label", "blue");

        let a = Query::new(item_meta()).join("item", red);
        let b = Query::new(item_meta()).join("item", blue);
        assert_ne!(QuerySignature::of(&a), QuerySignature::of(&b));
    }
}
