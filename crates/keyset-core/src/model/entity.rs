use crate::{
    MIN_SCORE, PRIMARY_KEY,
    model::{FieldKind, FieldModel, SchemaError, validate_name},
    value::Value,
};
use std::{collections::BTreeMap, sync::Arc};

/// Partition a model lives in unless it names one.
pub const DEFAULT_PARTITION: &str = "default";

///
/// ModelOrdering
/// Default ordering declared by a model.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModelOrdering {
    pub field: String,
    pub descending: bool,
}

///
/// ModelMeta
///
/// Immutable per-model metadata: name, fields, index flags, ordering field,
/// and the logical store partition. Built once and shared as `Arc<ModelMeta>`.
///

#[derive(Debug)]
pub struct ModelMeta {
    name: String,
    partition: String,
    primary_key: FieldModel,
    fields: Vec<FieldModel>,
    ordering: Option<ModelOrdering>,
}

impl ModelMeta {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ModelMetaBuilder {
        ModelMetaBuilder {
            name: name.into(),
            partition: DEFAULT_PARTITION.to_string(),
            primary_key: FieldKind::Int,
            fields: Vec::new(),
            ordering: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn partition(&self) -> &str {
        &self.partition
    }

    #[must_use]
    pub const fn primary_key(&self) -> &FieldModel {
        &self.primary_key
    }

    /// Declared fields, excluding the primary key, in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldModel] {
        &self.fields
    }

    /// Look up a declared field or the primary key.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldModel> {
        if name == PRIMARY_KEY {
            return Some(&self.primary_key);
        }
        self.fields.iter().find(|field| field.name() == name)
    }

    #[must_use]
    pub const fn ordering(&self) -> Option<&ModelOrdering> {
        self.ordering.as_ref()
    }

    /// Ordered models keep ids and index containers in score-sorted sets.
    #[must_use]
    pub const fn is_ordered(&self) -> bool {
        self.ordering.is_some()
    }

    #[must_use]
    pub fn ordering_field(&self) -> Option<&FieldModel> {
        self.ordering
            .as_ref()
            .and_then(|ordering| self.field(&ordering.field))
    }

    /// Score an instance by its ordering field; absent values get [`MIN_SCORE`].
    #[must_use]
    pub fn score(&self, values: &BTreeMap<String, Value>) -> f64 {
        self.ordering_field()
            .and_then(|field| values.get(field.name()).and_then(|v| field.score(v)))
            .unwrap_or(MIN_SCORE)
    }

    pub fn indexed_fields(&self) -> impl Iterator<Item = &FieldModel> {
        self.fields.iter().filter(|field| field.is_indexed())
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &FieldModel> {
        self.fields.iter().filter(|field| field.is_unique())
    }

    /// Names of fields the commit path needs old values for.
    #[must_use]
    pub fn tracked_fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.indexed_fields().map(FieldModel::name).collect();
        if let Some(ordering) = &self.ordering
            && !names.contains(&ordering.field.as_str())
        {
            names.push(&ordering.field);
        }
        names
    }
}

///
/// ModelMetaBuilder
///

#[derive(Debug)]
pub struct ModelMetaBuilder {
    name: String,
    partition: String,
    primary_key: FieldKind,
    fields: Vec<FieldModel>,
    ordering: Option<ModelOrdering>,
}

impl ModelMetaBuilder {
    #[must_use]
    pub fn field(mut self, field: FieldModel) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn ordering(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.ordering = Some(ModelOrdering {
            field: field.into(),
            descending,
        });
        self
    }

    #[must_use]
    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Override the primary-key kind (int by default).
    #[must_use]
    pub fn primary_key(mut self, kind: FieldKind) -> Self {
        self.primary_key = kind;
        self
    }

    pub fn build(self) -> Result<Arc<ModelMeta>, SchemaError> {
        validate_name(&self.name)?;
        validate_name(&self.partition)?;

        if !matches!(self.primary_key, FieldKind::Int | FieldKind::Text) {
            return Err(SchemaError::InvalidPrimaryKey { model: self.name });
        }

        let mut seen = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            validate_name(field.name())?;

            if field.name() == PRIMARY_KEY {
                return Err(SchemaError::ReservedField {
                    model: self.name.clone(),
                    field: field.name().to_string(),
                });
            }
            if seen.contains(&field.name()) {
                return Err(SchemaError::DuplicateField {
                    model: self.name.clone(),
                    field: field.name().to_string(),
                });
            }
            seen.push(field.name());
        }

        if let Some(ordering) = &self.ordering {
            let field = if ordering.field == PRIMARY_KEY {
                None
            } else {
                self.fields.iter().find(|f| f.name() == ordering.field)
            };
            let Some(field) = field else {
                return Err(SchemaError::UnknownOrderingField {
                    model: self.name.clone(),
                    field: ordering.field.clone(),
                });
            };
            if !field.is_scoreable() {
                return Err(SchemaError::UnscoreableOrdering {
                    model: self.name.clone(),
                    field: ordering.field.clone(),
                });
            }
        }

        Ok(Arc::new(ModelMeta {
            primary_key: FieldModel::new(PRIMARY_KEY, self.primary_key),
            name: self.name,
            partition: self.partition,
            fields: self.fields,
            ordering: self.ordering,
        }))
    }
}
