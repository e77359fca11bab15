//! Local state: article records, named collections and the persistence seam.
//!
//! - [`ArticleStore`] owns article field data, keyed by canonical URL
//! - [`CollectionIndex`] owns memberships (saved, offline, read, followed sources)
//! - [`PersistenceAdapter`] is the opaque-string key-value primitive both flush to;
//!   [`Database`] implements it on SQLite and [`MemoryKv`] in memory

mod articles;
mod collections;
mod kv;
mod kv_table;
mod schema;
#[cfg(test)]
pub(crate) mod test_support;
mod types;

pub use articles::{ArticleStore, ARTICLES_KEY};
pub use collections::CollectionIndex;
pub use kv::{MemoryKv, PersistenceAdapter};
pub(crate) use kv::{load_json, store_json};
pub use schema::Database;
pub use types::{
    estimate_read_time, Article, BulkUpsertReport, CacheError, Category, Collection,
    CollectionEntry, MembershipMeta, MutationOutcome, StorageError, ToggleOutcome, UpsertOutcome,
    DEFAULT_READ_TIME_MINUTES,
};
