//! Scope-partitioned local cache for chats, messages and app settings.
//!
//! - `storage`: the durable Local Store (SQLite), atomic per-collection writes
//! - `manager`: the Cache Manager, the only entry point other code uses
//! - `traits`: the `Cacheable` document trait, collection keys and freshness policy

mod locks;
mod manager;
mod storage;
mod traits;

pub use manager::{
  CacheManager, CacheStats, ChatsSnapshot, CollectionSnapshot, InitState, MessagesPage,
  ScopeStamp, SettingSnapshot,
};
pub(crate) use storage::dedup_by_key;
pub use storage::{LocalStore, NoopStore, SqliteStore, StoreStats, StoredSetting};
pub use traits::{
  CacheSource, CachedCollection, Cacheable, CollectionKey, CollectionKind, FreshnessPolicy,
};
