use crate::db::backend::BackendError;
use std::fmt;
use thiserror::Error as ThisError;

///
/// InternalError
///
/// Structured runtime error with a stable internal classification.
/// Every public operation returns this type; layer errors convert into it.
///

#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct InternalError {
    pub class: ErrorClass,
    pub origin: ErrorOrigin,
    pub message: String,

    /// Optional structured error detail.
    /// The variant (if present) must correspond to `origin`.
    pub detail: Option<ErrorDetail>,
}

impl InternalError {
    pub fn new(class: ErrorClass, origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self {
            class,
            origin,
            message: message.into(),
            detail: None,
        }
    }

    /// Construct an error from a layer error's class mapping.
    pub(crate) fn classified(
        class: ErrorClass,
        origin: ErrorOrigin,
        message: impl Into<String>,
    ) -> Self {
        Self::new(class, origin, message)
    }

    /// Construct a query-origin invariant violation.
    pub(crate) fn query_invariant(message: impl Into<String>) -> Self {
        Self::new(
            ErrorClass::InvariantViolation,
            ErrorOrigin::Query,
            message.into(),
        )
    }

    /// Construct an index-origin invariant violation.
    pub(crate) fn index_invariant(message: impl Into<String>) -> Self {
        Self::new(
            ErrorClass::InvariantViolation,
            ErrorOrigin::Index,
            message.into(),
        )
    }

    /// Construct a session-origin invariant violation.
    pub(crate) fn session_invariant(message: impl Into<String>) -> Self {
        Self::new(
            ErrorClass::InvariantViolation,
            ErrorOrigin::Session,
            message.into(),
        )
    }

    /// Construct a backend-origin error for a reply that did not match its command.
    pub(crate) fn backend_reply(expected: &'static str, found: impl Into<String>) -> Self {
        BackendError::UnexpectedReply {
            expected,
            found: found.into(),
        }
        .into()
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.class, ErrorClass::NotFound)
    }

    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self.class, ErrorClass::Unsupported)
    }

    /// Borrow the backend failure this error wraps, if any.
    #[must_use]
    pub const fn backend_error(&self) -> Option<&BackendError> {
        match &self.detail {
            Some(ErrorDetail::Backend(err)) => Some(err),
            None => None,
        }
    }

    #[must_use]
    pub fn display_with_class(&self) -> String {
        format!("{}:{}: {}", self.origin, self.class, self.message)
    }
}

///
/// ErrorDetail
///
/// Structured, origin-specific error detail carried by [`InternalError`].
///

#[derive(Debug, ThisError)]
pub enum ErrorDetail {
    #[error("{0}")]
    Backend(BackendError),
}

impl From<BackendError> for InternalError {
    fn from(err: BackendError) -> Self {
        Self {
            class: ErrorClass::Backend,
            origin: ErrorOrigin::Backend,
            message: err.to_string(),
            detail: Some(ErrorDetail::Backend(err)),
        }
    }
}

///
/// ErrorClass
/// Internal error taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Rejected by the query compiler before any store access.
    Unsupported,
    /// Local state and backend disagree.
    Conflict,
    /// Operation is illegal in the current session or transaction state.
    InvalidState,
    /// Backend failure, carried verbatim.
    Backend,
    InvariantViolation,
    NotFound,
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unsupported => "unsupported",
            Self::Conflict => "conflict",
            Self::InvalidState => "invalid_state",
            Self::Backend => "backend",
            Self::InvariantViolation => "invariant_violation",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

///
/// ErrorOrigin
/// Internal origin taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorOrigin {
    Schema,
    Config,
    Key,
    Index,
    Query,
    Session,
    Transaction,
    PubSub,
    Backend,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Schema => "schema",
            Self::Config => "config",
            Self::Key => "key",
            Self::Index => "index",
            Self::Query => "query",
            Self::Session => "session",
            Self::Transaction => "transaction",
            Self::PubSub => "pubsub",
            Self::Backend => "backend",
        };
        write!(f, "{label}")
    }
}
