//! Sync domain models and services.

mod entity_model;
mod hydrator;
mod local_store;
mod record_model;
mod remote;
mod sanitize;
mod synchronizer;

pub use entity_model::*;
pub use hydrator::*;
pub use local_store::*;
pub use record_model::*;
pub use remote::*;
pub use sanitize::*;
pub use synchronizer::*;

#[cfg(test)]
mod tests;
