//! Collaborator boundaries consumed by the core.
//!
//! The evaluation engine treats its neighbors as opaque services behind
//! narrow traits: model invocation, the model resource manager, the
//! persistent store, and the broadcast channel. Production implementations
//! live next to each trait; tests substitute scripted or in-memory ones.

pub mod broadcast;
pub mod invocation;
pub mod manager;
pub mod store;
