//! Local record cache: diesel models, repository, and change subscriptions.

pub mod model;
pub mod repository;
pub mod subscription;

pub use repository::CacheRepository;
pub use subscription::{ChangeNotifier, RecordSubscription};
