//! Durable partitioned cache for request/response pairs.
//!
//! Partitions are addressed by a version-qualified name (`static-v2`,
//! `dynamic-v2`) and persist until an activation deletes them. There is no
//! expiry: an entry is served for as long as its partition exists.

mod storage;
mod traits;

pub use storage::SqliteStorage;
pub use traits::{CacheStorage, CachedEntry, Registration};
