//! Configuration
//!
//! Serde schema with defaults for every field, persisted as a JSON file and
//! cached in a lock-free [`ConfigStore`].

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
