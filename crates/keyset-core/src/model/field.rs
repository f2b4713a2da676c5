use crate::value::Value;
use std::fmt;

/// Projection of a field value onto a sorted-set score.
pub type ScoreFn = fn(&Value) -> Option<f64>;

///
/// FieldKind
///
/// Storage type of a field; decides decoding and sort mode.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    /// Holds the id of an instance of the named model.
    ForeignKey(String),
}

impl FieldKind {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::ForeignKey(_) => "foreign_key",
        }
    }

    /// Numeric kinds sort by value; the rest sort lexicographically.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Bool | Self::Int | Self::Float)
    }

    #[must_use]
    pub fn related_model(&self) -> Option<&str> {
        match self {
            Self::ForeignKey(model) => Some(model),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForeignKey(model) => write!(f, "foreign_key({model})"),
            other => f.write_str(other.label()),
        }
    }
}

///
/// FieldModel
/// Runtime field metadata used by the index writer and the query compiler.
///

#[derive(Clone, Debug)]
pub struct FieldModel {
    name: String,
    kind: FieldKind,
    unique: bool,
    indexed: bool,
    score: Option<ScoreFn>,
}

impl FieldModel {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            unique: false,
            indexed: false,
            score: None,
        }
    }

    #[must_use]
    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Bool)
    }

    #[must_use]
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Int)
    }

    #[must_use]
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    #[must_use]
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    #[must_use]
    pub fn foreign_key(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(name, FieldKind::ForeignKey(model.into()))
    }

    /// Unique fields are always indexed.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    #[must_use]
    pub const fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    #[must_use]
    pub const fn with_score(mut self, score: ScoreFn) -> Self {
        self.score = Some(score);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> &FieldKind {
        &self.kind
    }

    #[must_use]
    pub const fn is_unique(&self) -> bool {
        self.unique
    }

    #[must_use]
    pub const fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Whether a score can be computed without a custom function.
    #[must_use]
    pub const fn is_scoreable(&self) -> bool {
        self.score.is_some() || self.kind.is_numeric()
    }

    /// Score of `value` when this field orders its model.
    #[must_use]
    pub fn score(&self, value: &Value) -> Option<f64> {
        match self.score {
            Some(score) => score(value),
            None => value.numeric_score(),
        }
    }
}
