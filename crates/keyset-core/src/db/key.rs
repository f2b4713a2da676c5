//! Module: db::key
//! Responsibility: derive every store key from (model, region, parts).
//! Invariants: keys are deterministic for everything but temp keys, so
//! concurrent processes agree on object, unique, index, and id keys.

use crate::{model::ModelMeta, types::Id, value::Value};
use std::fmt;
use ulid::Ulid;

/// Region holding temporary set-algebra results.
const TEMP_REGION: &str = "tmp";

///
/// Region
///
/// The four persistent key regions of a model.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Region {
    /// Per-id object hash.
    Obj,
    /// Unique-value lookup hash (value -> id), one per unique field.
    Uni,
    /// Non-unique index container, one per (field, value).
    Idx,
    /// All-ids container.
    Ids,
}

impl Region {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Obj => "obj",
            Self::Uni => "uni",
            Self::Idx => "idx",
            Self::Ids => "id",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

///
/// KeyNamespace
///
/// Pure mapping from (model, region, parts) to key strings.
/// Layout: `{prefix}{model}:{region}:{part}:{part}...`.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Root of every key belonging to `meta`.
    #[must_use]
    pub fn model_root(&self, meta: &ModelMeta) -> String {
        format!("{}{}", self.prefix, meta.name())
    }

    #[must_use]
    pub fn basekey(&self, meta: &ModelMeta, region: Region, parts: &[&str]) -> String {
        let mut key = self.model_root(meta);
        key.push(':');
        key.push_str(region.as_str());
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    #[must_use]
    pub fn object_key(&self, meta: &ModelMeta, id: &Id) -> String {
        self.basekey(meta, Region::Obj, &[id.as_str()])
    }

    /// Sort/projection pattern dereferencing `field` of every object hash.
    #[must_use]
    pub fn object_pattern(&self, meta: &ModelMeta, field: &str) -> String {
        format!("{}->{field}", self.basekey(meta, Region::Obj, &["*"]))
    }

    #[must_use]
    pub fn unique_key(&self, meta: &ModelMeta, field: &str) -> String {
        self.basekey(meta, Region::Uni, &[field])
    }

    #[must_use]
    pub fn index_key(&self, meta: &ModelMeta, field: &str, value: &Value) -> String {
        self.basekey(meta, Region::Idx, &[field, &value.index_token()])
    }

    #[must_use]
    pub fn ids_key(&self, meta: &ModelMeta) -> String {
        self.basekey(meta, Region::Ids, &[])
    }

    /// Counter backing auto-assigned ids.
    #[must_use]
    pub fn sequence_key(&self, meta: &ModelMeta) -> String {
        format!("{}:seq", self.model_root(meta))
    }

    /// Fresh temporary key; never shared between compilations.
    #[must_use]
    pub fn temp_key(&self, meta: &ModelMeta) -> String {
        format!("{}:{TEMP_REGION}:{}", self.model_root(meta), Ulid::new())
    }

    /// Content-addressed temporary key for a memoized query result.
    #[must_use]
    pub fn signature_key(&self, meta: &ModelMeta, signature: &str) -> String {
        format!("{}:{TEMP_REGION}:q:{signature}", self.model_root(meta))
    }

    #[must_use]
    pub fn temp_pattern(&self, meta: &ModelMeta) -> String {
        format!("{}:{TEMP_REGION}:*", self.model_root(meta))
    }

    /// Every key of the model, for whole-model flush.
    #[must_use]
    pub fn model_pattern(&self, meta: &ModelMeta) -> String {
        format!("{}:*", self.model_root(meta))
    }
}
