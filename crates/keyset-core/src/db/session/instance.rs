use crate::{
    PRIMARY_KEY,
    db::session::SessionError,
    error::InternalError,
    model::{ModelMeta, SchemaError},
    types::Id,
    value::{Value, ValueError},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};
use ulid::Ulid;

///
/// Iid
///
/// Identity-map key. Stable before a store id exists.
///

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Iid {
    /// Never committed; generated locally.
    Local(Ulid),
    /// Known to the store under this id.
    Persistent(Id),
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(ulid) => write!(f, "local:{ulid}"),
            Self::Persistent(id) => write!(f, "{id}"),
        }
    }
}

///
/// InstanceState
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceState {
    pub iid: Iid,
    pub persistent: bool,
    pub deleted: bool,
}

///
/// Instance
///
/// Field values of one model instance plus the server-confirmed snapshot
/// they diverged from. The snapshot is the source of index old-values.
///

#[derive(Clone, Debug)]
pub struct Instance {
    meta: Arc<ModelMeta>,
    id: Option<Id>,
    values: BTreeMap<String, Value>,
    snapshot: BTreeMap<String, Value>,
    /// Fields the snapshot covers when loaded with `load_only`.
    partial: Option<BTreeSet<String>>,
    /// Fields assigned locally since the last reconciliation.
    assigned: BTreeSet<String>,
    state: InstanceState,
    related: BTreeMap<String, Self>,
}

impl Instance {
    #[must_use]
    pub fn new(meta: Arc<ModelMeta>) -> Self {
        Self {
            meta,
            id: None,
            values: BTreeMap::new(),
            snapshot: BTreeMap::new(),
            partial: None,
            assigned: BTreeSet::new(),
            state: InstanceState {
                iid: Iid::Local(Ulid::new()),
                persistent: false,
                deleted: false,
            },
            related: BTreeMap::new(),
        }
    }

    /// New instance with a caller-chosen id instead of a counter-assigned one.
    #[must_use]
    pub fn with_id(meta: Arc<ModelMeta>, id: impl Into<Id>) -> Self {
        let mut instance = Self::new(meta);
        instance.id = Some(id.into());
        instance
    }

    /// Set a declared field, checking the value against its kind.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), InternalError> {
        let value = value.into();
        let model = self
            .meta
            .fields()
            .iter()
            .find(|f| f.name() == field)
            .ok_or_else(|| SchemaError::UnknownField {
                model: self.meta.name().to_string(),
                field: field.to_string(),
            })?;
        if !value.kind_matches(model.kind()) {
            return Err(ValueError::KindMismatch {
                field: field.to_string(),
                expected: model.kind().label(),
                found: value.label(),
            }
            .into());
        }

        let value = value.coerce(model.kind());
        if value.is_null() {
            self.values.remove(field);
        } else {
            self.values.insert(field.to_string(), value);
        }
        self.assigned.insert(field.to_string());

        Ok(())
    }

    /// Builder form of [`Instance::set`].
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self, InternalError> {
        self.set(field, value)?;
        Ok(self)
    }

    /// Value of a declared field; `None` when unset or not loaded.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    #[must_use]
    pub const fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    #[must_use]
    pub const fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    #[must_use]
    pub const fn state(&self) -> &InstanceState {
        &self.state
    }

    #[must_use]
    pub const fn iid(&self) -> &Iid {
        &self.state.iid
    }

    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.state.persistent
    }

    /// Related object attached by a `load_related` query.
    #[must_use]
    pub fn related(&self, field: &str) -> Option<&Self> {
        self.related.get(field)
    }

    /// Whether values differ from the server-confirmed snapshot.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.state.persistent || self.values != self.snapshot
    }

    // ------------------------------------------------------------------
    // Store plumbing
    // ------------------------------------------------------------------

    /// Decode a stored object hash. `fields` marks a partial load.
    pub(crate) fn from_store(
        meta: Arc<ModelMeta>,
        id: Id,
        pairs: Vec<(String, String)>,
        fields: Option<&[String]>,
    ) -> Result<Self, InternalError> {
        let mut values = BTreeMap::new();
        for (field, raw) in pairs {
            if field == PRIMARY_KEY {
                continue;
            }
            // fields dropped from the schema are ignored
            let Some(model) = meta.fields().iter().find(|f| f.name() == field) else {
                continue;
            };
            values.insert(field, Value::from_store(model.kind(), &raw)?);
        }

        Ok(Self {
            meta,
            id: Some(id.clone()),
            snapshot: values.clone(),
            values,
            partial: fields.map(|fields| {
                fields
                    .iter()
                    .filter(|f| f.as_str() != PRIMARY_KEY)
                    .cloned()
                    .collect()
            }),
            assigned: BTreeSet::new(),
            state: InstanceState {
                iid: Iid::Persistent(id),
                persistent: true,
                deleted: false,
            },
            related: BTreeMap::new(),
        })
    }

    #[must_use]
    pub(crate) const fn snapshot(&self) -> &BTreeMap<String, Value> {
        &self.snapshot
    }

    /// Fields of `tracked` whose old value the snapshot cannot vouch for.
    pub(crate) fn unknown_fields<'f>(&self, tracked: &[&'f str]) -> Vec<&'f str> {
        match &self.partial {
            None if self.state.persistent => Vec::new(),
            None => tracked.to_vec(),
            Some(covered) => tracked
                .iter()
                .copied()
                .filter(|field| !covered.contains(*field))
                .collect(),
        }
    }

    /// Whether the local value of `field` is authoritative: complete
    /// snapshot, loaded field, or assigned since.
    pub(crate) fn covers(&self, field: &str) -> bool {
        self.assigned.contains(field)
            || self
                .partial
                .as_ref()
                .is_none_or(|covered| covered.contains(field))
    }

    pub(crate) fn attach(&mut self, field: &str, related: Self) {
        self.related.insert(field.to_string(), related);
    }

    pub(crate) const fn mark_deleted(&mut self) {
        self.state.deleted = true;
    }

    /// Reconcile with the id the store confirmed for this instance.
    pub(crate) fn mark_persisted(
        &mut self,
        id: Id,
        written: BTreeMap<String, Value>,
    ) -> Result<(), SessionError> {
        if self.state.persistent
            && let Some(current) = &self.id
            && *current != id
        {
            return Err(SessionError::IdChanged {
                model: self.meta.name().to_string(),
                from: current.clone(),
                to: id,
            });
        }

        if let Some(partial) = &mut self.partial {
            partial.append(&mut self.assigned);
        }
        self.assigned.clear();

        let snapshot = written
            .into_iter()
            .filter(|(field, _)| self.covers(field))
            .collect();
        self.id = Some(id.clone());
        self.snapshot = snapshot;
        self.state.iid = Iid::Persistent(id);
        self.state.persistent = true;

        Ok(())
    }
}
