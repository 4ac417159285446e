//! Offline-first sync core for the casework client.
//!
//! The local cache and operation queue live behind the [`sync::CacheStore`]
//! port; the remote relational service behind [`sync::RemoteStore`]. The
//! [`sync::SnapshotLoader`] and [`sync::QueueSynchronizer`] orchestrate
//! hydration and queue replay across both.

pub mod errors;
pub mod sync;

pub use errors::{Error, Result};
