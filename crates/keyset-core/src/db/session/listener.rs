use crate::types::Id;
use ulid::Ulid;

///
/// CommitEvent
///
/// One event per model per commit, emitted after reconciliation.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommitEvent {
    Saved {
        model: String,
        ids: Vec<Id>,
        transaction: Ulid,
    },
    Deleted {
        model: String,
        ids: Vec<Id>,
        transaction: Ulid,
    },
}

impl CommitEvent {
    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            Self::Saved { model, .. } | Self::Deleted { model, .. } => model,
        }
    }

    #[must_use]
    pub fn ids(&self) -> &[Id] {
        match self {
            Self::Saved { ids, .. } | Self::Deleted { ids, .. } => ids,
        }
    }
}

///
/// CommitListener
///
/// Subscriber invoked synchronously by the owning session.
///

pub trait CommitListener: Send + Sync {
    fn on_commit(&self, event: &CommitEvent);
}
