
use crate::{
    error::{ErrorClass, ErrorOrigin, InternalError},
    model::FieldKind,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

///
/// ValueError
///

#[derive(Debug, ThisError)]
pub enum ValueError {
    #[error("cannot decode stored value '{raw}' as {kind}")]
    Decode { kind: &'static str, raw: String },

    #[error("field '{field}' expects {expected}, found {found}")]
    KindMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl ValueError {
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::Decode { .. } => ErrorClass::Conflict,
            Self::KindMismatch { .. } => ErrorClass::Unsupported,
        }
    }

    pub(crate) const fn origin(&self) -> ErrorOrigin {
        match self {
            Self::Decode { .. } => ErrorOrigin::Backend,
            Self::KindMismatch { .. } => ErrorOrigin::Schema,
        }
    }
}

impl From<ValueError> for InternalError {
    fn from(err: ValueError) -> Self {
        Self::classified(err.class(), err.origin(), err.to_string())
    }
}

///
/// Value
///
/// Field value as held by an instance and encoded into an object hash.
/// `Null` is never written; a null field is absent from the hash.
///

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }

    /// Encode for an object-hash field. `None` for null.
    #[must_use]
    pub fn to_store(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(if *v { "1" } else { "0" }.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Text(v) => Some(v.clone()),
        }
    }

    /// Token used as the value part of an index key.
    /// Null values index under the empty token.
    #[must_use]
    pub fn index_token(&self) -> String {
        self.to_store().unwrap_or_default()
    }

    /// Decode a raw hash field according to the declared kind.
    pub fn from_store(kind: &FieldKind, raw: &str) -> Result<Self, ValueError> {
        let decode_err = || ValueError::Decode {
            kind: kind.label(),
            raw: raw.to_string(),
        };

        match kind {
            FieldKind::Bool => match raw {
                "1" | "true" | "True" => Ok(Self::Bool(true)),
                "0" | "false" | "False" | "" => Ok(Self::Bool(false)),
                _ => Err(decode_err()),
            },
            FieldKind::Int => raw.parse().map(Self::Int).map_err(|_| decode_err()),
            FieldKind::Float => raw.parse().map(Self::Float).map_err(|_| decode_err()),
            FieldKind::Text | FieldKind::ForeignKey(_) => Ok(Self::Text(raw.to_string())),
        }
    }

    /// Default score projection for ordering fields.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn numeric_score(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(f64::from(u8::from(*v))),
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => v.is_finite().then_some(*v),
            Self::Text(v) => v.parse::<f64>().ok().filter(|f| f.is_finite()),
        }
    }

    /// Whether this value may be stored in a field of `kind`.
    #[must_use]
    pub const fn kind_matches(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (Self::Null, _)
                | (Self::Bool(_), FieldKind::Bool)
                | (Self::Int(_), FieldKind::Int | FieldKind::Float)
                | (Self::Float(_), FieldKind::Float)
                | (Self::Text(_), FieldKind::Text)
                | (Self::Text(_) | Self::Int(_), FieldKind::ForeignKey(_))
        )
    }

    /// Bring an accepted value into the kind's canonical variant.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub(crate) fn coerce(self, kind: &FieldKind) -> Self {
        match (self, kind) {
            (Self::Int(v), FieldKind::Float) => Self::Float(v as f64),
            (Self::Int(v), FieldKind::ForeignKey(_)) => Self::Text(v.to_string()),
            (value, _) => value,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&crate::types::Id> for Value {
    fn from(id: &crate::types::Id) -> Self {
        Self::Text(id.as_str().to_string())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
