//! ## Crate layout
//! - `core`: schema descriptors, values, the query compiler, the unit-of-work
//!   session, and the backend contract they run against.
//!
//! The `prelude` module carries the domain vocabulary used by application
//! code; everything else is reached through `core`.

pub use keyset_core as core;

//
// Consts
//

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use core::{Error, MIN_SCORE, PRIMARY_KEY};

///
/// Prelude
///

pub mod prelude {
    pub use crate::core::{
        config::EngineConfig,
        db::{
            backend::{Backend, MemoryBackend},
            query::Query,
            session::{CommitReport, Iid, Instance, Session},
        },
        model::{FieldModel, ModelMeta},
        types::Id,
        value::Value,
    };
}
