use derive_more::{Deref, Display};
use serde::{Deserialize, Serialize};

///
/// Id
///
/// Primary key of a stored instance.
/// Store ids are opaque strings; counter-assigned ids are decimal integers.
///

#[derive(
    Clone, Debug, Deref, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for Id {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Id {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<u64> for Id {
    fn from(raw: u64) -> Self {
        Self(raw.to_string())
    }
}

impl From<i64> for Id {
    fn from(raw: i64) -> Self {
        Self(raw.to_string())
    }
}
