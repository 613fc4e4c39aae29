//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::model::{Chat, Message};

/// Trait for documents that can be cached.
///
/// Implementors provide the identity used for deduplication within a collection.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier of this document within its collection (the `_id`).
  ///
  /// Empty for a keyless document: it is stored by position and never
  /// deduplicated against other documents.
  fn cache_key(&self) -> String;

  /// Entity type name for storage organization (e.g., "chat", "message")
  fn entity_type() -> &'static str;
}

impl Cacheable for Chat {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "chat"
  }
}

impl Cacheable for Message {
  fn cache_key(&self) -> String {
    self.key()
  }

  fn entity_type() -> &'static str {
    "message"
  }
}

/// Untyped documents are keyed by their `_id` field; without one they are keyless.
impl Cacheable for serde_json::Value {
  fn cache_key(&self) -> String {
    match self.get("_id") {
      Some(serde_json::Value::String(s)) => s.clone(),
      None | Some(serde_json::Value::Null) => String::new(),
      Some(other) => other.to_string(),
    }
  }

  fn entity_type() -> &'static str {
    "document"
  }
}

/// Collection type, which decides the freshness threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
  Chats,
  Messages,
  Settings,
}

impl CollectionKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Chats => "chats",
      Self::Messages => "messages",
      Self::Settings => "settings",
    }
  }
}

/// Logical key of a collection inside one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionKey {
  /// The chat list
  Chats,
  /// Messages of one chat
  Messages { chat_id: String },
  /// A named app setting (quick replies, templates, chat rules, ...)
  Setting { name: String },
}

impl CollectionKey {
  pub fn messages(chat_id: impl Into<String>) -> Self {
    Self::Messages {
      chat_id: chat_id.into(),
    }
  }

  pub fn setting(name: impl Into<String>) -> Self {
    Self::Setting { name: name.into() }
  }

  pub fn kind(&self) -> CollectionKind {
    match self {
      Self::Chats => CollectionKind::Chats,
      Self::Messages { .. } => CollectionKind::Messages,
      Self::Setting { .. } => CollectionKind::Settings,
    }
  }

  /// Stable name used as the storage key.
  pub fn storage_name(&self) -> String {
    match self {
      Self::Chats => "chats".to_string(),
      Self::Messages { chat_id } => format!("messages:{}", chat_id),
      Self::Setting { name } => format!("setting:{}", name),
    }
  }
}

impl fmt::Display for CollectionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.storage_name())
  }
}

/// A named, scope-partitioned snapshot of documents.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCollection<T> {
  pub name: String,
  pub scope_id: String,
  pub kind: CollectionKind,
  /// Documents in display order
  pub items: Vec<T>,
  /// Total the server last reported; may be below `items.len()` while
  /// optimistic records are present
  pub total_count: u64,
  pub fetched_at: DateTime<Utc>,
}

impl<T> CachedCollection<T> {
  pub fn new(
    name: impl Into<String>,
    scope_id: impl Into<String>,
    kind: CollectionKind,
    items: Vec<T>,
    total_count: u64,
  ) -> Self {
    Self {
      name: name.into(),
      scope_id: scope_id.into(),
      kind,
      items,
      total_count,
      fetched_at: Utc::now(),
    }
  }

  pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
    self.fetched_at = fetched_at;
    self
  }
}

/// Per-kind freshness thresholds.
///
/// Chat lists refresh more aggressively than rarely-changing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
  pub chats: Duration,
  pub messages: Duration,
  pub settings: Duration,
}

impl Default for FreshnessPolicy {
  fn default() -> Self {
    Self {
      chats: Duration::minutes(2),
      messages: Duration::minutes(5),
      settings: Duration::minutes(30),
    }
  }
}

impl FreshnessPolicy {
  pub fn threshold(&self, kind: CollectionKind) -> Duration {
    match kind {
      CollectionKind::Chats => self.chats,
      CollectionKind::Messages => self.messages,
      CollectionKind::Settings => self.settings,
    }
  }

  /// Check if data fetched at `fetched_at` is stale for `kind`.
  pub fn is_stale(&self, kind: CollectionKind, fetched_at: DateTime<Utc>) -> bool {
    Utc::now() - fetched_at > self.threshold(kind)
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, older than its freshness threshold
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Nothing cached and nothing fetched
  Empty,
}

impl CacheSource {
  pub fn is_cache(self) -> bool {
    matches!(self, Self::CacheFresh | Self::CacheStale | Self::Offline)
  }
}
