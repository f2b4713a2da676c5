//! Runtime schema descriptors.
//!
//! Models are declared once at startup through [`ModelMeta::builder`],
//! validated, and shared by reference (`Arc<ModelMeta>`) with every
//! component. Nothing here is discovered at runtime.

pub mod entity;
pub mod field;


use crate::error::{ErrorClass, ErrorOrigin, InternalError};
use thiserror::Error as ThisError;

// re-exports
pub use entity::{DEFAULT_PARTITION, ModelMeta, ModelMetaBuilder, ModelOrdering};
pub use field::{FieldKind, FieldModel, ScoreFn};

///
/// SchemaError
///

#[derive(Debug, ThisError)]
pub enum SchemaError {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("model '{model}' declares field '{field}' more than once")]
    DuplicateField { model: String, field: String },

    #[error("model '{model}' cannot declare reserved field '{field}'")]
    ReservedField { model: String, field: String },

    #[error("model '{model}' orders by unknown field '{field}'")]
    UnknownOrderingField { model: String, field: String },

    #[error("model '{model}' orders by '{field}', which has no score function")]
    UnscoreableOrdering { model: String, field: String },

    #[error("model '{model}' has no field '{field}'")]
    UnknownField { model: String, field: String },

    #[error("model '{model}' primary key must be int or text")]
    InvalidPrimaryKey { model: String },
}

impl SchemaError {
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownField { .. } => ErrorClass::Unsupported,
            _ => ErrorClass::InvariantViolation,
        }
    }
}

impl From<SchemaError> for InternalError {
    fn from(err: SchemaError) -> Self {
        Self::classified(err.class(), ErrorOrigin::Schema, err.to_string())
    }
}

/// Check a model, field, or partition name for use inside store keys.
pub(crate) fn validate_name(name: &str) -> Result<(), SchemaError> {
    let invalid = |reason| {
        Err(SchemaError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("empty");
    }
    if !name.is_ascii() {
        return invalid("non-ascii");
    }
    if name
        .chars()
        .any(|c| c.is_ascii_whitespace() || matches!(c, ':' | '*' | '?' | '[' | ']'))
    {
        return invalid("contains a key-reserved character");
    }
    if name.contains("__") {
        return invalid("contains the lookup separator '__'");
    }

    Ok(())
}
