pub mod backend;
pub mod index;
pub mod key;
pub mod pubsub;
pub mod query;
pub mod session;
