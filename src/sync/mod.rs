//! Sync Coordinator: decides when to hit the network and reconciles results
//! into the cache.
//!
//! Every screen runs the same cycle:
//!
//! ```text
//! Idle -> CacheRead -> NetworkFetch -> Reconciling -> Idle
//!              \
//!               (offline) -> Idle, key recorded for reconnect
//! ```
//!
//! A failed NetworkFetch leaves cached data alone and publishes
//! `CacheEvent::SyncFailed`. There is no automatic retry; the next trigger is
//! the retry.

mod connectivity;
mod coordinator;
mod search;

use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::cache::CacheSource;
use crate::config::CacheConfig;
use crate::error::Error;
use crate::model::{Chat, Message, Page, SendFailure};

pub use connectivity::Connectivity;
pub use coordinator::{ReconnectReport, SyncCoordinator};

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
  Mount,
  Focus,
  PullToRefresh,
  Reconnect,
}

impl SyncTrigger {
  /// Explicit user or recovery triggers fetch even when the cache is fresh.
  pub fn forces_refresh(self) -> bool {
    matches!(self, Self::PullToRefresh | Self::Reconnect)
  }
}

impl fmt::Display for SyncTrigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Mount => "mount",
      Self::Focus => "focus",
      Self::PullToRefresh => "pull-to-refresh",
      Self::Reconnect => "reconnect",
    })
  }
}

/// Where a collection currently is in its sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
  #[default]
  Idle,
  CacheRead,
  NetworkFetch,
  Reconciling,
}

/// Result of a read or refresh cycle.
///
/// `data` is whatever is best to display: the server result on success,
/// otherwise the cached snapshot (possibly empty).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome<T> {
  pub data: T,
  pub source: CacheSource,
  pub is_stale: bool,
  /// Server-reported total, when known
  pub total_count: Option<u64>,
  /// The cycle ended at CacheRead for lack of connectivity
  pub offline: bool,
  /// The NetworkFetch failed; `data` is the cached snapshot
  pub error: Option<Error>,
  /// The Local Store could not be read or written
  pub cache_error: Option<Error>,
}

impl<T> SyncOutcome<T> {
  pub(crate) fn cached(data: T, is_stale: bool, total_count: Option<u64>) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      is_stale,
      total_count,
      offline: false,
      error: None,
      cache_error: None,
    }
  }

  pub(crate) fn network(data: T, total_count: Option<u64>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      is_stale: false,
      total_count,
      offline: false,
      error: None,
      cache_error: None,
    }
  }

  pub(crate) fn into_offline(mut self) -> Self {
    self.offline = true;
    if self.source.is_cache() {
      self.source = CacheSource::Offline;
    }
    self
  }

  pub(crate) fn with_error(mut self, error: Error) -> Self {
    self.error = Some(error);
    self
  }

  pub(crate) fn with_cache_error(mut self, error: Option<Error>) -> Self {
    if error.is_some() {
      self.cache_error = error;
    }
    self
  }

  /// True when `data` came from the Local Store.
  pub fn from_cache(&self) -> bool {
    self.source.is_cache()
  }
}

impl<T: Default> SyncOutcome<T> {
  pub(crate) fn empty() -> Self {
    Self {
      data: T::default(),
      source: CacheSource::Empty,
      is_stale: false,
      total_count: None,
      offline: false,
      error: None,
      cache_error: None,
    }
  }
}

pub type ChatsOutcome = SyncOutcome<Vec<Chat>>;
pub type MessagesOutcome = SyncOutcome<Vec<Message>>;
pub type SettingOutcome = SyncOutcome<Option<Value>>;

/// Result of `load_more_messages`.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadMore {
  /// A page was fetched and appended
  Appended(Page<Message>),
  /// Another load-more for the same chat is in flight
  Skipped,
  /// No connectivity; nothing fetched
  Offline,
  /// Everything the server reported is already cached
  Exhausted,
}

/// Result of `search_chats`.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
  /// Matched the cached chat list; no network call
  Local(Vec<Chat>),
  Remote(Vec<Chat>),
  /// A newer search started while this one was settling
  Superseded,
  /// No local match and no connectivity
  Offline,
}

/// Result of `send_message`.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
  Confirmed { temp_id: String, message: Message },
  Failed { temp_id: String, error: SendFailure },
}

impl SendOutcome {
  pub fn temp_id(&self) -> &str {
    match self {
      Self::Confirmed { temp_id, .. } | Self::Failed { temp_id, .. } => temp_id,
    }
  }
}

/// Tunables of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
  /// Messages per page (first page and load-more)
  pub page_size: usize,
  /// Chats fetched per refresh
  pub chat_page_size: usize,
  pub search_debounce: Duration,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      page_size: 20,
      chat_page_size: 100,
      search_debounce: Duration::from_millis(500),
    }
  }
}

impl From<&CacheConfig> for SyncOptions {
  fn from(config: &CacheConfig) -> Self {
    Self {
      page_size: config.page_size.max(1),
      chat_page_size: config.chat_page_size.max(1),
      search_debounce: Duration::from_millis(config.search_debounce_ms),
    }
  }
}
