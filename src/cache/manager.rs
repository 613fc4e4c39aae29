//! Cache Manager: the single entry point for reading and writing cached data.
//!
//! Every read and write is partitioned by the current scope (the active
//! account/setting id). Store calls run on the blocking pool and writes to one
//! collection are sequenced through a per-key lock.
//!
//! Operations that fetch before they write take a [`ScopeStamp`] up front and
//! use the `*_in` variants, so a scope switch or a logout clear while the
//! fetch is in flight cannot move their data into another scope or bring
//! cleared data back.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, OnceCell, RwLockReadGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::locks::{ClearBarrier, Generation, KeyedLocks};
use super::storage::{LocalStore, SqliteStore, StoreStats};
use super::traits::{CachedCollection, Cacheable, CollectionKey, FreshnessPolicy};
use crate::error::{Error, Result};
use crate::event::{CacheEvent, EventBus};
use crate::model::{Chat, Message, MessageDraft, MessageStatus, PageRequest, SendFailure};

type StoreOpener<S> = Arc<dyn Fn() -> Result<S> + Send + Sync>;

/// Observable initialization state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitState {
  pub is_initialized: bool,
  pub is_initializing: bool,
  pub error: Option<String>,
}

/// Scope a deferred write belongs to, taken when its operation started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeStamp {
  scope_id: String,
  generation: Generation,
}

impl ScopeStamp {
  pub fn scope_id(&self) -> &str {
    &self.scope_id
  }
}

/// Cached snapshot of any collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot<T> {
  pub items: Vec<T>,
  pub total_count: u64,
  pub fetched_at: DateTime<Utc>,
  pub is_stale: bool,
}

/// Result of `get_chats`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatsSnapshot {
  pub chats: Vec<Chat>,
  pub from_cache: bool,
  /// Advisory only: the chats are returned either way
  pub is_stale: bool,
  pub fetched_at: Option<DateTime<Utc>>,
}

/// Result of `get_messages`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagesPage {
  pub messages: Vec<Message>,
  pub from_cache: bool,
  pub has_more: bool,
  pub total_count: u64,
  pub is_stale: bool,
  /// Key of the last returned message, for `get_messages_after`
  pub next_cursor: Option<String>,
}

impl MessagesPage {
  fn miss() -> Self {
    Self {
      messages: Vec::new(),
      from_cache: false,
      has_more: false,
      total_count: 0,
      is_stale: false,
      next_cursor: None,
    }
  }

  /// `limit` messages starting at `start`.
  fn window(snapshot: CollectionSnapshot<Message>, start: usize, limit: usize) -> Self {
    let len = snapshot.items.len();
    let start = start.min(len);
    let end = start.saturating_add(limit).min(len);
    let messages = snapshot.items[start..end].to_vec();
    // Local records can push the cached length past the server total
    let has_more = end < len || (end as u64) < snapshot.total_count;
    Self {
      next_cursor: messages.last().map(Message::key),
      messages,
      from_cache: true,
      has_more,
      total_count: snapshot.total_count,
      is_stale: snapshot.is_stale,
    }
  }
}

/// A cached app setting with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingSnapshot {
  pub data: Value,
  pub updated_at: DateTime<Utc>,
  pub is_stale: bool,
}

/// Output of `get_cache_stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
  pub scope_id: Option<String>,
  /// Counters for the current scope (zeroed when no scope is set)
  pub scope: StoreStats,
  pub total: StoreStats,
}

/// Where an optimistic message lives, so confirmations don't need the caller
/// to repeat it.
#[derive(Debug, Clone)]
struct OptimisticRef {
  scope_id: String,
  chat_id: String,
}

/// Cache-first data access, partitioned by scope.
pub struct CacheManager<S: LocalStore> {
  opener: StoreOpener<S>,
  store: OnceCell<std::result::Result<Arc<S>, Error>>,
  initializing: AtomicBool,
  scope: RwLock<Option<String>>,
  policy: FreshnessPolicy,
  locks: KeyedLocks,
  barrier: ClearBarrier,
  events: EventBus,
  optimistic: Mutex<HashMap<String, OptimisticRef>>,
}

impl CacheManager<SqliteStore> {
  /// Manager over a SQLite store at `path`, or the default location.
  pub fn sqlite(path: Option<PathBuf>, policy: FreshnessPolicy) -> Self {
    Self::new(
      move || match &path {
        Some(path) => SqliteStore::open_at(path),
        None => SqliteStore::open_default(),
      },
      policy,
    )
  }
}

impl<S: LocalStore> CacheManager<S> {
  /// Create a manager. `opener` runs once, on the first `initialize`.
  pub fn new<F>(opener: F, policy: FreshnessPolicy) -> Self
  where
    F: Fn() -> Result<S> + Send + Sync + 'static,
  {
    Self {
      opener: Arc::new(opener),
      store: OnceCell::new(),
      initializing: AtomicBool::new(false),
      scope: RwLock::new(None),
      policy,
      locks: KeyedLocks::new(),
      barrier: ClearBarrier::new(),
      events: EventBus::default(),
      optimistic: Mutex::new(HashMap::new()),
    }
  }

  /// Open the Local Store.
  ///
  /// Idempotent. Concurrent callers share one open attempt and all observe its
  /// outcome. A failed open is remembered: the cache stays unavailable and
  /// callers are expected to run network-only.
  pub async fn initialize(&self) -> Result<()> {
    let outcome = self
      .store
      .get_or_init(|| async {
        self.initializing.store(true, Ordering::SeqCst);
        let opener = Arc::clone(&self.opener);
        let opened = match tokio::task::spawn_blocking(move || opener()).await {
          Ok(result) => result,
          Err(e) => Err(Error::from(e)),
        };
        self.initializing.store(false, Ordering::SeqCst);
        match opened {
          Ok(store) => {
            info!("cache initialized");
            Ok(Arc::new(store))
          }
          Err(e) => {
            error!(error = %e, "cache initialization failed, continuing network-only");
            Err(e)
          }
        }
      })
      .await;

    outcome.as_ref().map(|_| ()).map_err(Clone::clone)
  }

  pub fn init_state(&self) -> InitState {
    match self.store.get() {
      Some(Ok(_)) => InitState {
        is_initialized: true,
        is_initializing: false,
        error: None,
      },
      Some(Err(e)) => InitState {
        is_initialized: false,
        is_initializing: false,
        error: Some(e.to_string()),
      },
      None => InitState {
        is_initialized: false,
        is_initializing: self.initializing.load(Ordering::SeqCst),
        error: None,
      },
    }
  }

  /// True when the Local Store opened successfully.
  pub fn is_available(&self) -> bool {
    matches!(self.store.get(), Some(Ok(_)))
  }

  /// Switch the active scope. Data of other scopes is kept.
  pub fn set_scope(&self, scope_id: impl Into<String>) {
    let scope_id = scope_id.into();
    {
      let mut scope = self.scope.write().unwrap_or_else(|e| e.into_inner());
      if scope.as_deref() == Some(scope_id.as_str()) {
        return;
      }
      *scope = Some(scope_id.clone());
    }
    info!(scope = %scope_id, "cache scope changed");
    self.events.publish(CacheEvent::ScopeChanged { scope_id });
  }

  pub fn current_scope(&self) -> Option<String> {
    self.scope.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Pin the active scope for writes that happen after a fetch.
  pub fn stamp(&self) -> Result<ScopeStamp> {
    Ok(self.stamp_for(self.require_scope()?))
  }

  fn stamp_for(&self, scope_id: String) -> ScopeStamp {
    ScopeStamp {
      generation: self.barrier.generation(&scope_id),
      scope_id,
    }
  }

  pub fn policy(&self) -> &FreshnessPolicy {
    &self.policy
  }

  /// Subscribe to cache change notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  pub(crate) fn events(&self) -> &EventBus {
    &self.events
  }

  pub(crate) fn require_scope(&self) -> Result<String> {
    self.current_scope().ok_or(Error::NoScope)
  }

  async fn store(&self) -> Result<Arc<S>> {
    self.initialize().await?;
    match self.store.get() {
      Some(Ok(store)) => Ok(Arc::clone(store)),
      Some(Err(e)) => Err(Error::Storage(format!("cache unavailable: {}", e))),
      None => Err(Error::Storage("cache not initialized".into())),
    }
  }

  /// Run a store call on the blocking pool.
  async fn with_store<R, F>(&self, f: F) -> Result<R>
  where
    F: FnOnce(&S) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let store = self.store().await?;
    tokio::task::spawn_blocking(move || f(&store)).await?
  }

  /// Hold off clears for one write, unless the stamped scope was cleared
  /// since the stamp was taken.
  async fn admit(&self, stamp: &ScopeStamp) -> Result<RwLockReadGuard<'_, ()>> {
    let guard = self.barrier.enter().await;
    if self.barrier.generation(&stamp.scope_id) != stamp.generation {
      debug!(scope = %stamp.scope_id, "scope cleared since the write started, dropping it");
      return Err(Error::ScopeCleared(stamp.scope_id.clone()));
    }
    Ok(guard)
  }

  // ==========================================================================
  // Generic collections
  // ==========================================================================

  /// Read a collection of the current scope.
  pub async fn get_collection<T: Cacheable>(
    &self,
    key: &CollectionKey,
  ) -> Result<Option<CollectionSnapshot<T>>> {
    let scope = self.require_scope()?;
    self.read_collection(&scope, key).await
  }

  async fn read_collection<T: Cacheable>(
    &self,
    scope_id: &str,
    key: &CollectionKey,
  ) -> Result<Option<CollectionSnapshot<T>>> {
    let (name, scope) = (key.storage_name(), scope_id.to_string());
    let collection = self
      .with_store(move |s| s.read::<T>(&name, &scope))
      .await?;

    Ok(collection.map(|c| {
      let is_stale = self.policy.is_stale(c.kind, c.fetched_at);
      debug!(collection = %key, items = c.items.len(), is_stale, "cache hit");
      CollectionSnapshot {
        items: c.items,
        total_count: c.total_count,
        fetched_at: c.fetched_at,
        is_stale,
      }
    }))
  }

  /// Replace a collection of the current scope with a fresh server snapshot.
  pub async fn save_collection<T: Cacheable>(
    &self,
    key: &CollectionKey,
    items: Vec<T>,
    total_count: Option<u64>,
  ) -> Result<()> {
    self
      .save_collection_in(&self.stamp()?, key, items, total_count)
      .await
  }

  pub async fn save_collection_in<T: Cacheable>(
    &self,
    stamp: &ScopeStamp,
    key: &CollectionKey,
    items: Vec<T>,
    total_count: Option<u64>,
  ) -> Result<()> {
    let total = total_count.unwrap_or(items.len() as u64);
    let collection =
      CachedCollection::new(key.storage_name(), stamp.scope_id(), key.kind(), items, total);
    self.write_collection(stamp, collection).await
  }

  /// Append a page, deduplicating by key.
  pub async fn append_collection<T: Cacheable>(
    &self,
    key: &CollectionKey,
    items: Vec<T>,
    total_count: Option<u64>,
  ) -> Result<()> {
    self
      .append_collection_in(&self.stamp()?, key, items, total_count)
      .await
  }

  pub async fn append_collection_in<T: Cacheable>(
    &self,
    stamp: &ScopeStamp,
    key: &CollectionKey,
    items: Vec<T>,
    total_count: Option<u64>,
  ) -> Result<()> {
    let scope = stamp.scope_id.clone();
    let name = key.storage_name();
    let kind = key.kind();
    let _admitted = self.admit(stamp).await?;
    let _guard = self.locks.acquire(&lock_key(&scope, &name)).await;
    {
      let (name, scope) = (name.clone(), scope.clone());
      self
        .with_store(move |s| s.append_items(&name, &scope, kind, &items, total_count))
        .await?;
    }
    self.events.publish(CacheEvent::CollectionUpdated {
      scope_id: scope,
      name,
    });
    Ok(())
  }

  async fn write_collection<T: Cacheable>(
    &self,
    stamp: &ScopeStamp,
    collection: CachedCollection<T>,
  ) -> Result<()> {
    let scope_id = collection.scope_id.clone();
    let name = collection.name.clone();
    let _admitted = self.admit(stamp).await?;
    let _guard = self.locks.acquire(&lock_key(&scope_id, &name)).await;
    self.with_store(move |s| s.write(&collection)).await?;
    self
      .events
      .publish(CacheEvent::CollectionUpdated { scope_id, name });
    Ok(())
  }

  /// Read-modify-write one collection under its key lock.
  ///
  /// `f` gets the current collection (if any) and returns the collection to
  /// write, or None to leave the store untouched.
  async fn modify_collection<T, R, F>(
    &self,
    stamp: &ScopeStamp,
    key: &CollectionKey,
    f: F,
  ) -> Result<R>
  where
    T: Cacheable,
    F: FnOnce(Option<CachedCollection<T>>) -> Result<(Option<CachedCollection<T>>, R)>,
  {
    let scope_id = stamp.scope_id();
    let name = key.storage_name();
    let _admitted = self.admit(stamp).await?;
    let _guard = self.locks.acquire(&lock_key(scope_id, &name)).await;

    let current = {
      let (name, scope) = (name.clone(), scope_id.to_string());
      self.with_store(move |s| s.read::<T>(&name, &scope)).await?
    };
    let (updated, result) = f(current)?;

    if let Some(collection) = updated {
      self.with_store(move |s| s.write(&collection)).await?;
      self.events.publish(CacheEvent::CollectionUpdated {
        scope_id: scope_id.to_string(),
        name,
      });
    }
    Ok(result)
  }

  // ==========================================================================
  // Chats
  // ==========================================================================

  /// Cached chat list of the current scope, returned even when stale.
  pub async fn get_chats(&self) -> Result<ChatsSnapshot> {
    let scope = self.require_scope()?;
    self.chats_of(&scope).await
  }

  pub async fn get_chats_in(&self, stamp: &ScopeStamp) -> Result<ChatsSnapshot> {
    self.chats_of(stamp.scope_id()).await
  }

  async fn chats_of(&self, scope_id: &str) -> Result<ChatsSnapshot> {
    let snapshot = self
      .read_collection::<Chat>(scope_id, &CollectionKey::Chats)
      .await?;
    Ok(match snapshot {
      Some(s) => ChatsSnapshot {
        chats: s.items,
        from_cache: true,
        is_stale: s.is_stale,
        fetched_at: Some(s.fetched_at),
      },
      None => ChatsSnapshot {
        chats: Vec::new(),
        from_cache: false,
        is_stale: false,
        fetched_at: None,
      },
    })
  }

  /// Replace the chat list after a full network fetch.
  pub async fn save_chats(&self, chats: Vec<Chat>, total_count: Option<u64>) -> Result<()> {
    self
      .save_collection(&CollectionKey::Chats, chats, total_count)
      .await
  }

  pub async fn save_chats_in(
    &self,
    stamp: &ScopeStamp,
    chats: Vec<Chat>,
    total_count: Option<u64>,
  ) -> Result<()> {
    self
      .save_collection_in(stamp, &CollectionKey::Chats, chats, total_count)
      .await
  }

  /// Drop the cached chat list of the current scope.
  pub async fn invalidate_chat_cache(&self) -> Result<()> {
    let stamp = self.stamp()?;
    let scope = stamp.scope_id.clone();
    let name = CollectionKey::Chats.storage_name();
    let _admitted = self.admit(&stamp).await?;
    let _guard = self.locks.acquire(&lock_key(&scope, &name)).await;
    {
      let (name, scope) = (name.clone(), scope.clone());
      self.with_store(move |s| s.delete(&name, &scope)).await?;
    }
    debug!(scope = %scope, "chat cache invalidated");
    self.events.publish(CacheEvent::CollectionUpdated {
      scope_id: scope,
      name,
    });
    Ok(())
  }

  /// Copy `message` into its chat's preview and move the chat to the top.
  async fn update_chat_preview(
    &self,
    stamp: &ScopeStamp,
    chat_id: &str,
    message: &Message,
  ) -> Result<()> {
    let chat_id = chat_id.to_string();
    self
      .modify_collection::<Chat, _, _>(stamp, &CollectionKey::Chats, |current| {
        let Some(mut collection) = current else {
          return Ok((None, ()));
        };
        let Some(index) = collection.items.iter().position(|c| c.id == chat_id) else {
          debug!(chat = %chat_id, "chat not cached, preview not updated");
          return Ok((None, ()));
        };
        let mut chat = collection.items.remove(index);
        chat.apply_preview(message);
        collection.items.insert(0, chat);
        Ok((Some(collection), ()))
      })
      .await
  }

  // ==========================================================================
  // Messages
  // ==========================================================================

  /// A window of cached messages (newest first).
  ///
  /// `has_more` is `offset + returned < total_count`. Offsets count from the
  /// newest message, so a message added at the top between two requests
  /// shifts later windows by one; older pages appended in between do not.
  /// Callers paging while messages arrive should follow `next_cursor` with
  /// [`get_messages_after`](Self::get_messages_after).
  pub async fn get_messages(&self, chat_id: &str, page: PageRequest) -> Result<MessagesPage> {
    let snapshot = self
      .get_collection::<Message>(&CollectionKey::messages(chat_id))
      .await?;
    Ok(match snapshot {
      Some(s) => MessagesPage::window(s, page.offset, page.limit),
      None => MessagesPage::miss(),
    })
  }

  /// The `limit` messages cached after the message keyed `cursor`.
  ///
  /// Anchored to the message rather than a position, so inserts above the
  /// cursor never repeat or skip items. The cursor also matches the temporary
  /// id of a message confirmed since. An unknown cursor yields an empty page.
  pub async fn get_messages_after(
    &self,
    chat_id: &str,
    cursor: &str,
    limit: usize,
  ) -> Result<MessagesPage> {
    let snapshot = self
      .get_collection::<Message>(&CollectionKey::messages(chat_id))
      .await?;
    let Some(snapshot) = snapshot else {
      return Ok(MessagesPage::miss());
    };

    let anchor = snapshot
      .items
      .iter()
      .position(|m| m.key() == cursor || m.temp_id.as_deref() == Some(cursor));
    match anchor {
      Some(index) => Ok(MessagesPage::window(snapshot, index + 1, limit)),
      None => {
        debug!(chat = %chat_id, cursor, "page cursor no longer cached");
        let end = snapshot.items.len();
        Ok(MessagesPage::window(snapshot, end, limit))
      }
    }
  }

  /// Full cached message collection of a chat.
  pub async fn get_all_messages(
    &self,
    chat_id: &str,
  ) -> Result<Option<CollectionSnapshot<Message>>> {
    self
      .get_collection::<Message>(&CollectionKey::messages(chat_id))
      .await
  }

  pub async fn get_all_messages_in(
    &self,
    stamp: &ScopeStamp,
    chat_id: &str,
  ) -> Result<Option<CollectionSnapshot<Message>>> {
    self
      .read_collection::<Message>(stamp.scope_id(), &CollectionKey::messages(chat_id))
      .await
  }

  /// Replace a chat's messages after a full network fetch.
  pub async fn save_messages(
    &self,
    messages: Vec<Message>,
    chat_id: &str,
    total_count: Option<u64>,
  ) -> Result<()> {
    self
      .save_collection(&CollectionKey::messages(chat_id), messages, total_count)
      .await
  }

  /// Replace a chat's messages with the server's newest page, keeping local
  /// records the server has not seen yet.
  ///
  /// Unconfirmed optimistic records stay at the top unless the page already
  /// carries them (matched by `tempId` or key). Returns how many were kept.
  pub async fn reconcile_messages(
    &self,
    chat_id: &str,
    server: Vec<Message>,
    total_count: u64,
  ) -> Result<usize> {
    self
      .reconcile_messages_in(&self.stamp()?, chat_id, server, total_count)
      .await
  }

  pub async fn reconcile_messages_in(
    &self,
    stamp: &ScopeStamp,
    chat_id: &str,
    server: Vec<Message>,
    total_count: u64,
  ) -> Result<usize> {
    let key = CollectionKey::messages(chat_id);
    let name = key.storage_name();
    let kind = key.kind();
    let owner = stamp.scope_id.clone();

    self
      .modify_collection::<Message, _, _>(stamp, &key, move |current| {
        let echoed: HashSet<String> = server
          .iter()
          .flat_map(|m| [Some(m.key()), m.temp_id.clone()])
          .flatten()
          .collect();
        let mut items: Vec<Message> = current
          .map(|c| c.items)
          .unwrap_or_default()
          .into_iter()
          .filter(|m| m.is_optimistic() && m.status.is_unconfirmed())
          .filter(|m| !echoed.contains(&m.key()))
          .collect();
        let kept = items.len();
        items.extend(server);
        let collection = CachedCollection::new(name, owner, kind, items, total_count);
        Ok((Some(collection), kept))
      })
      .await
  }

  /// Append an older page of messages.
  pub async fn append_messages(
    &self,
    messages: Vec<Message>,
    chat_id: &str,
    total_count: Option<u64>,
  ) -> Result<()> {
    self
      .append_collection(&CollectionKey::messages(chat_id), messages, total_count)
      .await
  }

  pub async fn append_messages_in(
    &self,
    stamp: &ScopeStamp,
    messages: Vec<Message>,
    chat_id: &str,
    total_count: Option<u64>,
  ) -> Result<()> {
    self
      .append_collection_in(stamp, &CollectionKey::messages(chat_id), messages, total_count)
      .await
  }

  /// Insert one message at the top of its chat and refresh the chat preview.
  ///
  /// A message whose key is already cached is replaced in place. The server
  /// total is left alone.
  pub async fn add_message(&self, mut message: Message, chat_id: &str) -> Result<()> {
    let stamp = self.stamp()?;
    if message.chat_id.is_empty() {
      message.chat_id = chat_id.to_string();
    }
    self.insert_message(&stamp, chat_id, message.clone()).await?;
    self.update_chat_preview(&stamp, chat_id, &message).await
  }

  async fn insert_message(
    &self,
    stamp: &ScopeStamp,
    chat_id: &str,
    message: Message,
  ) -> Result<()> {
    let key = CollectionKey::messages(chat_id);
    let name = key.storage_name();
    let kind = key.kind();
    let owner = stamp.scope_id.clone();
    self
      .modify_collection::<Message, _, _>(stamp, &key, move |current| {
        let mut collection =
          current.unwrap_or_else(|| CachedCollection::new(name, owner, kind, Vec::new(), 0));
        let message_key = message.key();
        match collection.items.iter().position(|m| m.key() == message_key) {
          Some(index) => collection.items[index] = message,
          None => collection.items.insert(0, message),
        }
        Ok((Some(collection), ()))
      })
      .await
  }

  /// Insert a pending outbound message and return its temporary id.
  ///
  /// The record is in the store (and the chat preview updated) before this
  /// returns, so callers can start the network send afterwards.
  pub async fn add_optimistic_message(&self, draft: MessageDraft, chat_id: &str) -> Result<String> {
    let stamp = self.stamp()?;
    let temp_id = format!("temp_{}", Uuid::now_v7());
    let message = Message::optimistic(temp_id.clone(), chat_id, draft);

    self.insert_message(&stamp, chat_id, message.clone()).await?;
    self.optimistic_index().insert(
      temp_id.clone(),
      OptimisticRef {
        scope_id: stamp.scope_id.clone(),
        chat_id: chat_id.to_string(),
      },
    );
    self.update_chat_preview(&stamp, chat_id, &message).await?;

    debug!(temp_id = %temp_id, chat = %chat_id, "optimistic message added");
    Ok(temp_id)
  }

  /// Confirm a pending message with the server's persisted record.
  ///
  /// The confirmed record takes the optimistic record's position; any other
  /// copy of the server message (e.g. delivered by a push first) is dropped.
  pub async fn update_optimistic_message(
    &self,
    temp_id: &str,
    server_message: Message,
  ) -> Result<()> {
    let location = self.locate_optimistic(temp_id, Some(server_message.chat_id.as_str()))?;
    let stamp = self.stamp_for(location.scope_id.clone());
    let mut confirmed = server_message;
    if confirmed.chat_id.is_empty() {
      confirmed.chat_id = location.chat_id.clone();
    }
    if confirmed.temp_id.is_none() {
      confirmed.temp_id = Some(temp_id.to_string());
    }
    // A confirmed record is never pending again
    if confirmed.status == MessageStatus::Pending {
      confirmed.status = MessageStatus::Sent;
    }

    let is_latest = self
      .transition_optimistic(&stamp, &location.chat_id, temp_id, {
        let confirmed = confirmed.clone();
        move |items, index| {
          let confirmed_key = confirmed.key();
          items[index] = confirmed;
          let mut position = 0;
          items.retain(|m| {
            let keep = position == index || m.key() != confirmed_key;
            position += 1;
            keep
          });
        }
      })
      .await?;

    self.optimistic_index().remove(temp_id);
    if is_latest {
      self
        .update_chat_preview(&stamp, &location.chat_id, &confirmed)
        .await?;
    }
    debug!(temp_id, id = ?confirmed.id, "optimistic message confirmed");
    Ok(())
  }

  /// Mark a pending message as failed. The record is kept for a manual retry.
  pub async fn mark_message_failed(&self, temp_id: &str, error: SendFailure) -> Result<()> {
    let location = self.locate_optimistic(temp_id, None)?;
    let stamp = self.stamp_for(location.scope_id.clone());
    let reason = error.message.clone();

    let mut failed: Option<Message> = None;
    let is_latest = self
      .transition_optimistic(&stamp, &location.chat_id, temp_id, |items, index| {
        let message = &mut items[index];
        message.status = MessageStatus::Failed;
        message.error = Some(error);
        failed = Some(message.clone());
      })
      .await?;

    // The failed record stays indexed so later transitions are rejected as
    // invalid rather than unknown
    if let (true, Some(message)) = (is_latest, failed) {
      self
        .update_chat_preview(&stamp, &location.chat_id, &message)
        .await?;
    }
    warn!(temp_id, error = %reason, "message send failed");
    Ok(())
  }

  /// Apply a terminal transition to the pending record `temp_id`.
  ///
  /// Returns whether the record is the newest message of its chat.
  async fn transition_optimistic<F>(
    &self,
    stamp: &ScopeStamp,
    chat_id: &str,
    temp_id: &str,
    apply: F,
  ) -> Result<bool>
  where
    F: FnOnce(&mut Vec<Message>, usize),
  {
    let temp_id = temp_id.to_string();
    self
      .modify_collection::<Message, _, _>(stamp, &CollectionKey::messages(chat_id), move |current| {
        let mut collection = current.ok_or_else(|| Error::MessageNotFound(temp_id.clone()))?;
        let index = collection
          .items
          .iter()
          .position(|m| m.temp_id.as_deref() == Some(temp_id.as_str()))
          .ok_or_else(|| Error::MessageNotFound(temp_id.clone()))?;

        let current = &collection.items[index];
        if !current.is_optimistic() || current.status != MessageStatus::Pending {
          return Err(Error::InvalidTransition {
            temp_id,
            status: current.status.to_string(),
          });
        }

        apply(&mut collection.items, index);
        let is_latest = collection
          .items
          .first()
          .map(|m| m.temp_id.as_deref() == Some(temp_id.as_str()))
          .unwrap_or(false);
        Ok((Some(collection), is_latest))
      })
      .await
  }

  fn optimistic_index(&self) -> std::sync::MutexGuard<'_, HashMap<String, OptimisticRef>> {
    self.optimistic.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Where `temp_id` was created; falls back to the current scope and the
  /// caller-supplied chat (e.g. for messages created before a restart).
  fn locate_optimistic(&self, temp_id: &str, chat_hint: Option<&str>) -> Result<OptimisticRef> {
    if let Some(found) = self.optimistic_index().get(temp_id) {
      return Ok(found.clone());
    }
    match chat_hint.filter(|c| !c.is_empty()) {
      Some(chat_id) => Ok(OptimisticRef {
        scope_id: self.require_scope()?,
        chat_id: chat_id.to_string(),
      }),
      None => Err(Error::MessageNotFound(temp_id.to_string())),
    }
  }

  /// Unconfirmed (pending or failed) messages of a chat, newest first.
  pub async fn pending_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
    let snapshot = self.get_all_messages(chat_id).await?;
    Ok(
      snapshot
        .map(|s| {
          s.items
            .into_iter()
            .filter(|m| m.is_optimistic() && m.status.is_unconfirmed())
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  // ==========================================================================
  // App settings
  // ==========================================================================

  /// Cached setting blob; None is a miss and warrants a network fetch.
  pub async fn get_app_setting(&self, name: &str) -> Result<Option<Value>> {
    Ok(self.get_app_setting_entry(name).await?.map(|s| s.data))
  }

  pub async fn get_app_setting_entry(&self, name: &str) -> Result<Option<SettingSnapshot>> {
    let scope = self.require_scope()?;
    self.setting_of(&scope, name).await
  }

  pub async fn get_app_setting_entry_in(
    &self,
    stamp: &ScopeStamp,
    name: &str,
  ) -> Result<Option<SettingSnapshot>> {
    self.setting_of(stamp.scope_id(), name).await
  }

  async fn setting_of(&self, scope_id: &str, name: &str) -> Result<Option<SettingSnapshot>> {
    let (scope, setting_name) = (scope_id.to_string(), name.to_string());
    let stored = self
      .with_store(move |s| s.read_setting(&scope, &setting_name))
      .await?;

    Ok(stored.filter(|s| !s.data.is_null()).map(|s| SettingSnapshot {
      is_stale: self
        .policy
        .is_stale(CollectionKey::setting(name).kind(), s.updated_at),
      data: s.data,
      updated_at: s.updated_at,
    }))
  }

  /// Store a setting blob. `None` (or JSON null) clears it.
  pub async fn save_app_setting(&self, name: &str, data: Option<Value>) -> Result<()> {
    self.save_app_setting_in(&self.stamp()?, name, data).await
  }

  pub async fn save_app_setting_in(
    &self,
    stamp: &ScopeStamp,
    name: &str,
    data: Option<Value>,
  ) -> Result<()> {
    let scope = stamp.scope_id.clone();
    let lock_name = CollectionKey::setting(name).storage_name();
    let _admitted = self.admit(stamp).await?;
    let _guard = self.locks.acquire(&lock_key(&scope, &lock_name)).await;

    {
      let (scope, name) = (scope.clone(), name.to_string());
      match data.filter(|d| !d.is_null()) {
        Some(data) => {
          self
            .with_store(move |s| s.write_setting(&scope, &name, &data))
            .await?
        }
        None => {
          self
            .with_store(move |s| s.delete_setting(&scope, &name))
            .await?
        }
      }
    }

    self.events.publish(CacheEvent::SettingUpdated {
      scope_id: scope,
      name: name.to_string(),
    });
    Ok(())
  }

  // ==========================================================================
  // Administration
  // ==========================================================================

  pub async fn get_cache_stats(&self) -> Result<CacheStats> {
    let scope_id = self.current_scope();
    let scope = scope_id.clone();
    let (scope_stats, total) = self
      .with_store(move |s| {
        let scoped = match &scope {
          Some(scope) => s.stats(Some(scope))?,
          None => StoreStats::default(),
        };
        Ok((scoped, s.stats(None)?))
      })
      .await?;

    Ok(CacheStats {
      scope_id,
      scope: scope_stats,
      total,
    })
  }

  /// Remove everything cached for the current scope (logout).
  pub async fn clear_current_setting_cache(&self) -> Result<()> {
    let scope = self.require_scope()?;
    self.clear_scope(&scope).await
  }

  /// Remove everything cached for `scope_id`.
  ///
  /// Waits for writes already running; writes stamped before the clear are
  /// dropped afterwards.
  pub async fn clear_scope(&self, scope_id: &str) -> Result<()> {
    let _clearing = self.barrier.clear_scope(scope_id).await;
    {
      let scope = scope_id.to_string();
      self.with_store(move |s| s.clear_scope(&scope)).await?;
    }
    self
      .optimistic_index()
      .retain(|_, location| location.scope_id != scope_id);
    info!(scope = %scope_id, "scope cache cleared");
    self.events.publish(CacheEvent::ScopeCleared {
      scope_id: scope_id.to_string(),
    });
    Ok(())
  }

  /// Wipe the whole store.
  pub async fn clear_all_cache(&self) -> Result<()> {
    let _clearing = self.barrier.clear_all().await;
    self.with_store(|s| s.clear_all()).await?;
    self.optimistic_index().clear();
    info!("all cache cleared");
    self.events.publish(CacheEvent::AllCleared);
    Ok(())
  }
}

fn lock_key(scope_id: &str, name: &str) -> String {
  format!("{}\u{1f}{}", scope_id, name)
}
