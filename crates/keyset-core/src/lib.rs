//! Core runtime for keyset: schema descriptors, values, the query compiler,
//! the unit-of-work session, and the backend contract they run against.
#![warn(unreachable_pub)]

// public exports are one module level down
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod obs;
pub mod types;
pub mod value;

// test
#[cfg(test)]
pub(crate) mod test_fixtures;

/// Crate-wide error alias.
pub type Error = error::InternalError;

///
/// CONSTANTS
///

/// Name of the primary-key field on every model.
pub const PRIMARY_KEY: &str = "id";

/// Sentinel score for an absent ordering value; unset values always sort first.
pub const MIN_SCORE: f64 = -1.0e99;

///
/// Prelude
///
/// Prelude contains only domain vocabulary.
/// No errors, backends, compilers, or helpers are re-exported here.
///

pub mod prelude {
    pub use crate::{
        db::{
            query::Query,
            session::{Instance, Session},
        },
        model::{FieldModel, ModelMeta},
        types::Id,
        value::Value,
    };
}
