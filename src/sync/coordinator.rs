use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::search::Debouncer;
use super::{
  ChatsOutcome, Connectivity, LoadMore, MessagesOutcome, SearchOutcome, SendOutcome,
  SettingOutcome, SyncOptions, SyncOutcome, SyncPhase, SyncTrigger,
};
use crate::api::RemoteSource;
use crate::cache::{CacheManager, CollectionKey, LocalStore, ScopeStamp};
use crate::error::{Error, Result};
use crate::event::CacheEvent;
use crate::model::{Chat, MessageDraft, PageRequest, SendFailure};

/// A collection within a scope.
type Slot = (String, CollectionKey);

/// Outcome of re-fetching the collections deferred while offline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectReport {
  pub refreshed: Vec<CollectionKey>,
  pub failed: Vec<(CollectionKey, Error)>,
  /// Went offline again before the fetch ran
  pub deferred: Vec<CollectionKey>,
}

/// Shared read-cache-then-fetch protocol for every screen.
pub struct SyncCoordinator<S: LocalStore, R: RemoteSource> {
  cache: Arc<CacheManager<S>>,
  remote: Arc<R>,
  connectivity: Connectivity,
  options: SyncOptions,
  search: Debouncer,
  loading_more: Mutex<HashSet<String>>,
  awaiting_reconnect: Mutex<HashSet<Slot>>,
  phases: Mutex<HashMap<Slot, SyncPhase>>,
}

impl<S: LocalStore, R: RemoteSource> SyncCoordinator<S, R> {
  pub fn new(
    cache: Arc<CacheManager<S>>,
    remote: Arc<R>,
    connectivity: Connectivity,
    options: SyncOptions,
  ) -> Self {
    Self {
      cache,
      remote,
      connectivity,
      search: Debouncer::new(options.search_debounce),
      options,
      loading_more: Mutex::new(HashSet::new()),
      awaiting_reconnect: Mutex::new(HashSet::new()),
      phases: Mutex::new(HashMap::new()),
    }
  }

  pub fn cache(&self) -> &Arc<CacheManager<S>> {
    &self.cache
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn options(&self) -> &SyncOptions {
    &self.options
  }

  /// Current phase of `key` in the active scope.
  pub fn phase(&self, key: &CollectionKey) -> SyncPhase {
    lock(&self.phases)
      .get(&self.slot(key))
      .copied()
      .unwrap_or_default()
  }

  /// Collections of the active scope waiting for connectivity.
  pub fn deferred(&self) -> Vec<CollectionKey> {
    let scope = self.scope();
    lock(&self.awaiting_reconnect)
      .iter()
      .filter(|(s, _)| *s == scope)
      .map(|(_, key)| key.clone())
      .collect()
  }

  // ==========================================================================
  // Chats
  // ==========================================================================

  /// CacheRead only.
  pub async fn read_chats(&self) -> ChatsOutcome {
    let stamp = self.cache.stamp();
    let phase = self.track(&stamp, &CollectionKey::Chats);
    phase.enter(SyncPhase::CacheRead);
    self.cached_chats(&stamp).await
  }

  /// NetworkFetch and Reconciling. Offline or failed fetches fall back to the
  /// cached list.
  ///
  /// The result is written to the scope that was active when the call
  /// started, even if the scope changes while the fetch is in flight.
  pub async fn refresh_chats(&self, trigger: SyncTrigger) -> ChatsOutcome {
    let key = CollectionKey::Chats;
    let stamp = self.cache.stamp();
    let phase = self.track(&stamp, &key);

    if !self.connectivity.is_online() {
      self.defer(&phase.slot);
      phase.enter(SyncPhase::CacheRead);
      return self.cached_chats(&stamp).await.into_offline();
    }

    phase.enter(SyncPhase::NetworkFetch);
    debug!(%trigger, "fetching chats");
    let request = PageRequest::new(self.options.chat_page_size, 0);
    match self.remote.fetch_chats(request).await {
      Ok(page) => {
        self.undefer(&phase.slot);
        phase.enter(SyncPhase::Reconciling);
        let saved = match &stamp {
          Ok(stamp) => {
            self
              .cache
              .save_chats_in(stamp, page.items.clone(), Some(page.total_count))
              .await
          }
          Err(e) => Err(e.clone()),
        };
        SyncOutcome::network(page.items, Some(page.total_count))
          .with_cache_error(self.write_failed(&key, saved))
      }
      Err(e) => {
        self.sync_failed(&phase.slot, &e);
        phase.enter(SyncPhase::CacheRead);
        self.cached_chats(&stamp).await.with_error(e)
      }
    }
  }

  /// Full cycle: CacheRead, then NetworkFetch and Reconciling.
  pub async fn load_chats(&self, trigger: SyncTrigger) -> ChatsOutcome {
    let cached = self.read_chats().await;
    let refreshed = self.refresh_chats(trigger).await;
    refreshed.with_cache_error(cached.cache_error)
  }

  async fn cached_chats(&self, stamp: &Result<ScopeStamp>) -> ChatsOutcome {
    let read = match stamp {
      Ok(stamp) => self.cache.get_chats_in(stamp).await,
      Err(e) => Err(e.clone()),
    };
    match read {
      Ok(snapshot) if snapshot.from_cache => {
        SyncOutcome::cached(snapshot.chats, snapshot.is_stale, None)
      }
      Ok(_) => SyncOutcome::empty(),
      Err(e) => {
        debug!(error = %e, "chat cache unreadable, treating as miss");
        SyncOutcome::empty().with_cache_error(Some(e))
      }
    }
  }

  // ==========================================================================
  // Messages
  // ==========================================================================

  /// CacheRead of everything cached for `chat_id`.
  pub async fn read_messages(&self, chat_id: &str) -> MessagesOutcome {
    let stamp = self.cache.stamp();
    let phase = self.track(&stamp, &CollectionKey::messages(chat_id));
    phase.enter(SyncPhase::CacheRead);
    self.cached_messages(&stamp, chat_id).await
  }

  /// Fetch the newest page and reconcile it into the cache.
  ///
  /// Server data wins, except for local messages the server has not
  /// confirmed yet, which are kept on top.
  pub async fn refresh_messages(&self, chat_id: &str, trigger: SyncTrigger) -> MessagesOutcome {
    let key = CollectionKey::messages(chat_id);
    let stamp = self.cache.stamp();
    let phase = self.track(&stamp, &key);

    if !self.connectivity.is_online() {
      self.defer(&phase.slot);
      phase.enter(SyncPhase::CacheRead);
      return self.cached_messages(&stamp, chat_id).await.into_offline();
    }

    phase.enter(SyncPhase::NetworkFetch);
    debug!(%trigger, chat = %chat_id, "fetching messages");
    let request = PageRequest::new(self.options.page_size, 0);
    let page = match self.remote.fetch_messages(chat_id, request).await {
      Ok(page) => page,
      Err(e) => {
        self.sync_failed(&phase.slot, &e);
        phase.enter(SyncPhase::CacheRead);
        return self.cached_messages(&stamp, chat_id).await.with_error(e);
      }
    };

    self.undefer(&phase.slot);
    phase.enter(SyncPhase::Reconciling);
    let total = page.total_count;
    let stamp = match stamp {
      Ok(stamp) => stamp,
      Err(e) => {
        return SyncOutcome::network(page.items, Some(total))
          .with_cache_error(self.write_failed(&key, Err(e)));
      }
    };
    let reconciled = self
      .cache
      .reconcile_messages_in(&stamp, chat_id, page.items.clone(), total)
      .await;
    match reconciled {
      Ok(kept) => {
        if kept > 0 {
          debug!(chat = %chat_id, kept, "kept unconfirmed messages over server page");
        }
        match self.cache.get_all_messages_in(&stamp, chat_id).await {
          Ok(Some(snapshot)) => SyncOutcome::network(snapshot.items, Some(total)),
          Ok(None) => SyncOutcome::network(page.items, Some(total)),
          Err(e) => SyncOutcome::network(page.items, Some(total)).with_cache_error(Some(e)),
        }
      }
      Err(e) => SyncOutcome::network(page.items, Some(total))
        .with_cache_error(self.write_failed(&key, Err(e))),
    }
  }

  pub async fn load_messages(&self, chat_id: &str, trigger: SyncTrigger) -> MessagesOutcome {
    let cached = self.read_messages(chat_id).await;
    let refreshed = self.refresh_messages(chat_id, trigger).await;
    refreshed.with_cache_error(cached.cache_error)
  }

  async fn cached_messages(&self, stamp: &Result<ScopeStamp>, chat_id: &str) -> MessagesOutcome {
    let read = match stamp {
      Ok(stamp) => self.cache.get_all_messages_in(stamp, chat_id).await,
      Err(e) => Err(e.clone()),
    };
    match read {
      Ok(Some(snapshot)) => {
        SyncOutcome::cached(snapshot.items, snapshot.is_stale, Some(snapshot.total_count))
      }
      Ok(None) => SyncOutcome::empty(),
      Err(e) => {
        debug!(error = %e, chat = %chat_id, "message cache unreadable, treating as miss");
        SyncOutcome::empty().with_cache_error(Some(e))
      }
    }
  }

  /// Fetch the page after `offset` confirmed messages and append it.
  ///
  /// At most one load-more per chat runs at a time; a second call while one
  /// is in flight returns `Skipped` without touching the network.
  pub async fn load_more_messages(&self, chat_id: &str, offset: usize) -> Result<LoadMore> {
    let key = CollectionKey::messages(chat_id);
    let stamp = self.cache.stamp();
    let slot = (scope_of(&stamp), key.clone());
    let Some(_flight) = InFlight::claim(&self.loading_more, lock_name(&slot)) else {
      debug!(chat = %chat_id, "load more already in flight");
      return Ok(LoadMore::Skipped);
    };

    if !self.connectivity.is_online() {
      return Ok(LoadMore::Offline);
    }

    let known = match &stamp {
      Ok(stamp) => self.cache.get_all_messages_in(stamp, chat_id).await,
      Err(e) => Err(e.clone()),
    };
    let known_total = match known {
      Ok(snapshot) => snapshot.map(|s| s.total_count),
      Err(e) => {
        debug!(error = %e, "message cache unreadable, paging from network only");
        None
      }
    };
    if known_total.is_some_and(|total| offset as u64 >= total) {
      return Ok(LoadMore::Exhausted);
    }

    let request = PageRequest::new(self.options.page_size, offset);
    let page = match self.remote.fetch_messages(chat_id, request).await {
      Ok(page) => page,
      Err(e) => {
        self.sync_failed(&slot, &e);
        return Err(e);
      }
    };
    debug!(chat = %chat_id, offset, fetched = page.items.len(), "older messages fetched");

    let appended = match &stamp {
      Ok(stamp) => {
        self
          .cache
          .append_messages_in(stamp, page.items.clone(), chat_id, Some(page.total_count))
          .await
      }
      Err(e) => Err(e.clone()),
    };
    self.write_failed(&key, appended);
    Ok(LoadMore::Appended(page))
  }

  // ==========================================================================
  // Sending
  // ==========================================================================

  /// Optimistic send: the pending record is cached before the network call,
  /// then confirmed or marked failed.
  pub async fn send_message(&self, chat_id: &str, draft: MessageDraft) -> Result<SendOutcome> {
    let temp_id = self.cache.add_optimistic_message(draft.clone(), chat_id).await?;

    let sent = if self.connectivity.is_online() {
      self.remote.send_message(chat_id, &draft).await
    } else {
      Err(Error::network("offline"))
    };

    match sent {
      Ok(message) => {
        self
          .cache
          .update_optimistic_message(&temp_id, message.clone())
          .await?;
        Ok(SendOutcome::Confirmed { temp_id, message })
      }
      Err(e) => {
        let error = SendFailure {
          message: e.to_string(),
          code: match &e {
            Error::Network {
              status: Some(status),
              ..
            } => Some(status.to_string()),
            _ => None,
          },
        };
        self.cache.mark_message_failed(&temp_id, error.clone()).await?;
        Ok(SendOutcome::Failed { temp_id, error })
      }
    }
  }

  // ==========================================================================
  // App settings
  // ==========================================================================

  /// Cache-first setting load. A fresh entry skips the network unless the
  /// trigger forces a refresh.
  pub async fn load_app_setting(&self, name: &str, trigger: SyncTrigger) -> SettingOutcome {
    let key = CollectionKey::setting(name);
    let stamp = self.cache.stamp();
    let phase = self.track(&stamp, &key);
    phase.enter(SyncPhase::CacheRead);

    let entry = match &stamp {
      Ok(stamp) => self.cache.get_app_setting_entry_in(stamp, name).await,
      Err(e) => Err(e.clone()),
    };
    let cached = match entry {
      Ok(Some(entry)) => SyncOutcome::cached(Some(entry.data), entry.is_stale, None),
      Ok(None) => SyncOutcome::empty(),
      Err(e) => SyncOutcome::empty().with_cache_error(Some(e)),
    };
    if cached.from_cache() && !cached.is_stale && !trigger.forces_refresh() {
      debug!(setting = %name, "setting fresh, skipping fetch");
      return cached;
    }

    if !self.connectivity.is_online() {
      self.defer(&phase.slot);
      return cached.into_offline();
    }

    phase.enter(SyncPhase::NetworkFetch);
    match self.remote.fetch_app_setting(name).await {
      Ok(value) => {
        self.undefer(&phase.slot);
        phase.enter(SyncPhase::Reconciling);
        let saved = match &stamp {
          Ok(stamp) => {
            self
              .cache
              .save_app_setting_in(stamp, name, Some(value.clone()))
              .await
          }
          Err(e) => Err(e.clone()),
        };
        let data = Some(value).filter(|v| !v.is_null());
        SyncOutcome::network(data, None)
          .with_cache_error(cached.cache_error)
          .with_cache_error(self.write_failed(&key, saved))
      }
      Err(e) => {
        self.sync_failed(&phase.slot, &e);
        cached.with_error(e)
      }
    }
  }

  // ==========================================================================
  // Search
  // ==========================================================================

  /// Search chats by name or phone.
  ///
  /// A case-insensitive match in the cached list answers immediately.
  /// Otherwise the query waits for input to settle and goes to the network,
  /// unless a newer search has started in the meantime.
  pub async fn search_chats(&self, query: &str) -> Result<SearchOutcome> {
    let ticket = self.search.ticket();
    let query = query.trim();

    let cached: Vec<Chat> = match self.cache.get_chats().await {
      Ok(snapshot) => snapshot.chats,
      Err(e) => {
        debug!(error = %e, "chat cache unreadable, searching remotely");
        Vec::new()
      }
    };
    if query.is_empty() {
      return Ok(SearchOutcome::Local(cached));
    }

    let matches: Vec<Chat> = cached.into_iter().filter(|c| c.matches(query)).collect();
    if !matches.is_empty() {
      debug!(query, hits = matches.len(), "search answered from cache");
      return Ok(SearchOutcome::Local(matches));
    }

    if !self.search.settle(ticket).await {
      return Ok(SearchOutcome::Superseded);
    }
    if !self.connectivity.is_online() {
      return Ok(SearchOutcome::Offline);
    }

    let results = self.remote.search_chats(query).await.map_err(|e| {
      warn!(query, error = %e, "chat search failed");
      e
    })?;
    if !self.search.is_current(ticket) {
      return Ok(SearchOutcome::Superseded);
    }
    Ok(SearchOutcome::Remote(results))
  }

  // ==========================================================================
  // Connectivity
  // ==========================================================================

  /// Feed a connectivity change. Going online re-fetches every collection of
  /// the active scope whose last cycle stopped at CacheRead.
  pub async fn on_connectivity_change(&self, online: bool) -> ReconnectReport {
    let was_online = self.connectivity.set_online(online);
    if online && !was_online {
      self.reconnect().await
    } else {
      ReconnectReport::default()
    }
  }

  /// Re-fetch the deferred collections of the active scope.
  pub async fn reconnect(&self) -> ReconnectReport {
    let scope = self.scope();
    let keys: Vec<CollectionKey> = {
      let mut pending = lock(&self.awaiting_reconnect);
      let keys = pending
        .iter()
        .filter(|(s, _)| *s == scope)
        .map(|(_, key)| key.clone())
        .collect();
      pending.retain(|(s, _)| *s != scope);
      keys
    };
    if keys.is_empty() {
      return ReconnectReport::default();
    }
    info!(count = keys.len(), "back online, refreshing deferred collections");

    let results = join_all(keys.into_iter().map(|key| async move {
      let (error, offline) = match &key {
        CollectionKey::Chats => {
          let outcome = self.refresh_chats(SyncTrigger::Reconnect).await;
          (outcome.error, outcome.offline)
        }
        CollectionKey::Messages { chat_id } => {
          let outcome = self.refresh_messages(chat_id, SyncTrigger::Reconnect).await;
          (outcome.error, outcome.offline)
        }
        CollectionKey::Setting { name } => {
          let outcome = self.load_app_setting(name, SyncTrigger::Reconnect).await;
          (outcome.error, outcome.offline)
        }
      };
      (key, error, offline)
    }))
    .await;

    let mut report = ReconnectReport::default();
    for (key, error, offline) in results {
      match (error, offline) {
        (Some(e), _) => report.failed.push((key, e)),
        (None, true) => report.deferred.push(key),
        (None, false) => report.refreshed.push(key),
      }
    }
    report
  }

  /// Follow the connectivity flag from a background task.
  ///
  /// For providers that call `Connectivity::set_online` directly instead of
  /// `on_connectivity_change`. Abort the handle to stop watching.
  pub fn watch_connectivity(self: &Arc<Self>) -> JoinHandle<()> {
    let this = Arc::clone(self);
    let mut rx = self.connectivity.subscribe();
    let mut was_online = *rx.borrow_and_update();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online && !was_online {
          let report = this.reconnect().await;
          debug!(
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            "reconnect sync finished"
          );
        }
        was_online = online;
      }
    })
  }

  // ==========================================================================
  // Bookkeeping
  // ==========================================================================

  fn scope(&self) -> String {
    self.cache.current_scope().unwrap_or_default()
  }

  fn slot(&self, key: &CollectionKey) -> Slot {
    (self.scope(), key.clone())
  }

  /// Phase tracking for a cycle pinned to `stamp`'s scope.
  fn track(&self, stamp: &Result<ScopeStamp>, key: &CollectionKey) -> PhaseGuard<'_> {
    PhaseGuard {
      phases: &self.phases,
      slot: (scope_of(stamp), key.clone()),
    }
  }

  fn defer(&self, slot: &Slot) {
    debug!(collection = %slot.1, "offline, fetch deferred until reconnect");
    lock(&self.awaiting_reconnect).insert(slot.clone());
  }

  fn undefer(&self, slot: &Slot) {
    lock(&self.awaiting_reconnect).remove(slot);
  }

  fn sync_failed(&self, slot: &Slot, error: &Error) {
    let (scope_id, key) = slot;
    warn!(collection = %key, error = %error, "sync failed, keeping cached data");
    self.cache.events().publish(CacheEvent::SyncFailed {
      scope_id: scope_id.clone(),
      name: key.storage_name(),
      message: error.to_string(),
    });
  }

  /// Log a failed cache write after a successful fetch and hand the error on.
  fn write_failed(&self, key: &CollectionKey, result: Result<()>) -> Option<Error> {
    match result {
      Ok(()) => None,
      Err(e @ Error::ScopeCleared(_)) => {
        debug!(collection = %key, "scope cleared during fetch, result not cached");
        Some(e)
      }
      Err(e) => {
        warn!(collection = %key, error = %e, "could not cache fetched data");
        Some(e)
      }
    }
  }
}

fn scope_of(stamp: &Result<ScopeStamp>) -> String {
  stamp
    .as_ref()
    .map(|s| s.scope_id().to_string())
    .unwrap_or_default()
}

fn lock_name((scope_id, key): &Slot) -> String {
  format!("{}\u{1f}{}", scope_id, key.storage_name())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Phase of one collection for the duration of a cycle; back to Idle on drop.
struct PhaseGuard<'a> {
  phases: &'a Mutex<HashMap<Slot, SyncPhase>>,
  slot: Slot,
}

impl PhaseGuard<'_> {
  fn enter(&self, phase: SyncPhase) {
    lock(self.phases).insert(self.slot.clone(), phase);
  }
}

impl Drop for PhaseGuard<'_> {
  fn drop(&mut self) {
    lock(self.phases).remove(&self.slot);
  }
}

/// Membership in the in-flight load-more set, released on drop.
struct InFlight<'a> {
  set: &'a Mutex<HashSet<String>>,
  key: String,
}

impl<'a> InFlight<'a> {
  fn claim(set: &'a Mutex<HashSet<String>>, key: String) -> Option<Self> {
    if !lock(set).insert(key.clone()) {
      return None;
    }
    Some(Self { set, key })
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    lock(self.set).remove(&self.key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, FreshnessPolicy, SqliteStore};
  use crate::model::{Message, MessageStatus};
  use crate::testing::{chats, memory_cache, memory_cache_with, messages, MockRemote};
  use chrono::Duration as ChronoDuration;
  use serde_json::json;
  use std::time::Duration;

  type Coordinator = SyncCoordinator<SqliteStore, MockRemote>;

  fn coordinator(
    cache: Arc<CacheManager<SqliteStore>>,
    remote: MockRemote,
    online: bool,
  ) -> (Arc<Coordinator>, Arc<MockRemote>) {
    let remote = Arc::new(remote);
    let sync = SyncCoordinator::new(
      cache,
      Arc::clone(&remote),
      Connectivity::new(online),
      SyncOptions {
        page_size: 2,
        chat_page_size: 50,
        search_debounce: Duration::from_millis(500),
      },
    );
    (Arc::new(sync), remote)
  }

  #[tokio::test]
  async fn test_offline_boot_serves_cache_without_network() {
    let cache = memory_cache("s1");
    cache.save_chats(chats(&["c1", "c2"]), None).await.unwrap();
    let (sync, remote) = coordinator(cache, MockRemote::new(), false);

    let outcome = sync.load_chats(SyncTrigger::Mount).await;

    assert_eq!(outcome.data, chats(&["c1", "c2"]));
    assert!(outcome.from_cache());
    assert!(outcome.offline);
    assert!(outcome.error.is_none());
    assert!(remote.calls().is_empty());
    assert_eq!(sync.deferred(), vec![CollectionKey::Chats]);
    assert_eq!(sync.phase(&CollectionKey::Chats), SyncPhase::Idle);
  }

  #[tokio::test]
  async fn test_reconnect_refetches_deferred_collections() {
    let cache = memory_cache("s1");
    let remote = MockRemote::new()
      .with_chats(chats(&["c1", "c9"]))
      .with_messages("c1", messages("c1", "m", 2));
    let (sync, remote) = coordinator(cache, remote, false);

    sync.refresh_chats(SyncTrigger::Mount).await;
    sync.refresh_messages("c1", SyncTrigger::Mount).await;
    assert!(remote.calls().is_empty());

    // Going offline again is not a reconnect
    assert_eq!(sync.on_connectivity_change(false).await, ReconnectReport::default());

    let report = sync.on_connectivity_change(true).await;
    assert_eq!(report.refreshed.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(remote.count("chats:"), 1);
    assert_eq!(remote.count("messages:c1:"), 1);
    assert!(sync.deferred().is_empty());

    let cached = sync.cache().get_chats().await.unwrap();
    assert_eq!(cached.chats, chats(&["c1", "c9"]));
  }

  #[tokio::test]
  async fn test_watch_connectivity_reacts_to_provider() {
    let cache = memory_cache("s1");
    let (sync, remote) = coordinator(cache, MockRemote::new().with_chats(chats(&["c1"])), false);
    sync.refresh_chats(SyncTrigger::Focus).await;

    let watcher = sync.watch_connectivity();
    let mut events = sync.cache().subscribe();
    sync.connectivity().set_online(true);

    // The reconnect refresh rewrites the chat list
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(
      event,
      CacheEvent::CollectionUpdated {
        scope_id: "s1".into(),
        name: "chats".into()
      }
    );
    assert_eq!(remote.count("chats:"), 1);
    watcher.abort();
  }

  #[tokio::test]
  async fn test_failed_refresh_keeps_cached_data() {
    let cache = memory_cache("s1");
    cache.save_chats(chats(&["c1"]), None).await.unwrap();
    let before = cache.get_chats().await.unwrap().fetched_at;
    let (sync, remote) = coordinator(cache, MockRemote::new(), true);
    remote.set_failing(true);
    let mut events = sync.cache().subscribe();

    let outcome = sync.refresh_chats(SyncTrigger::PullToRefresh).await;

    assert_eq!(outcome.data, chats(&["c1"]));
    assert!(outcome.from_cache());
    assert!(outcome.error.as_ref().is_some_and(Error::is_network));
    assert_eq!(sync.cache().get_chats().await.unwrap().fetched_at, before);
    assert!(matches!(
      events.recv().await.unwrap(),
      CacheEvent::SyncFailed { ref name, .. } if name == "chats"
    ));
    // No automatic retry
    assert_eq!(remote.count("chats:"), 1);
    assert!(sync.deferred().is_empty());
  }

  #[tokio::test]
  async fn test_refresh_keeps_unconfirmed_local_messages() {
    let cache = memory_cache("s1");
    cache
      .save_messages(messages("c1", "old", 2), "c1", Some(2))
      .await
      .unwrap();
    let temp_id = cache
      .add_optimistic_message(MessageDraft::text("draft"), "c1")
      .await
      .unwrap();
    let remote = MockRemote::new().with_messages("c1", messages("c1", "m", 5));
    let (sync, _remote) = coordinator(cache, remote, true);

    let outcome = sync.refresh_messages("c1", SyncTrigger::Focus).await;

    let keys: Vec<String> = outcome.data.iter().map(Message::key).collect();
    assert_eq!(keys, vec![temp_id, "m0".to_string(), "m1".to_string()]);
    assert_eq!(outcome.total_count, Some(5));
    assert_eq!(outcome.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_concurrent_load_more_fetches_once() {
    let cache = memory_cache("s1");
    cache
      .save_messages(messages("c1", "m", 2), "c1", Some(6))
      .await
      .unwrap();
    let remote = MockRemote::new().with_messages("c1", messages("c1", "m", 6));
    remote.set_delay(Duration::from_millis(20));
    let (sync, remote) = coordinator(cache, remote, true);

    let (a, b) = tokio::join!(
      sync.load_more_messages("c1", 2),
      sync.load_more_messages("c1", 2)
    );

    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| **o == LoadMore::Skipped).count(), 1);
    assert_eq!(remote.count("messages:c1:2"), 1);

    let all = sync.cache().get_all_messages("c1").await.unwrap().unwrap();
    let keys: Vec<String> = all.items.iter().map(Message::key).collect();
    assert_eq!(keys, vec!["m0", "m1", "m2", "m3"]);

    // The flag is released afterwards
    let next = sync.load_more_messages("c1", 4).await.unwrap();
    assert!(matches!(next, LoadMore::Appended(ref page) if page.items.len() == 2));
    assert_eq!(
      sync.load_more_messages("c1", 6).await.unwrap(),
      LoadMore::Exhausted
    );
  }

  #[tokio::test]
  async fn test_load_more_offline() {
    let (sync, remote) = coordinator(memory_cache("s1"), MockRemote::new(), false);
    assert_eq!(
      sync.load_more_messages("c1", 0).await.unwrap(),
      LoadMore::Offline
    );
    assert!(remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_send_message_confirms_optimistic_record() {
    let cache = memory_cache("s1");
    let (sync, _remote) = coordinator(cache, MockRemote::new(), true);

    let outcome = sync
      .send_message("c1", MessageDraft::text("hello"))
      .await
      .unwrap();

    let SendOutcome::Confirmed { temp_id, message } = outcome else {
      panic!("expected confirmation");
    };
    let all = sync.cache().get_all_messages("c1").await.unwrap().unwrap();
    assert_eq!(all.items.len(), 1);
    assert_eq!(all.items[0].id, message.id);
    assert_eq!(all.items[0].temp_id.as_deref(), Some(temp_id.as_str()));
  }

  #[tokio::test]
  async fn test_send_message_failure_is_retained() {
    let (sync, remote) = coordinator(memory_cache("s1"), MockRemote::new(), true);
    remote.set_failing(true);

    let outcome = sync
      .send_message("c1", MessageDraft::text("hello"))
      .await
      .unwrap();

    let SendOutcome::Failed { error, .. } = outcome else {
      panic!("expected failure");
    };
    assert_eq!(error.code.as_deref(), Some("503"));
    let pending = sync.cache().pending_messages("c1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, MessageStatus::Failed);
  }

  #[tokio::test]
  async fn test_fresh_setting_skips_network_on_mount() {
    let cache = memory_cache("s1");
    cache
      .save_app_setting("quickReplies", Some(json!(["Hi"])))
      .await
      .unwrap();
    let remote = MockRemote::new().with_setting("quickReplies", json!(["Hi", "Bye"]));
    let (sync, remote) = coordinator(cache, remote, true);

    let mounted = sync.load_app_setting("quickReplies", SyncTrigger::Mount).await;
    assert_eq!(mounted.data, Some(json!(["Hi"])));
    assert_eq!(mounted.source, CacheSource::CacheFresh);
    assert!(remote.calls().is_empty());

    let pulled = sync
      .load_app_setting("quickReplies", SyncTrigger::PullToRefresh)
      .await;
    assert_eq!(pulled.data, Some(json!(["Hi", "Bye"])));
    assert_eq!(remote.count("setting:quickReplies"), 1);
  }

  #[tokio::test]
  async fn test_stale_setting_is_refetched() {
    let policy = FreshnessPolicy {
      settings: ChronoDuration::zero(),
      ..FreshnessPolicy::default()
    };
    let cache = memory_cache_with("s1", policy);
    cache.save_app_setting("rules", Some(json!({"a": 1}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (sync, remote) = coordinator(cache, MockRemote::new(), true);

    // Server has nothing: the null clears the cached entry
    let outcome = sync.load_app_setting("rules", SyncTrigger::Focus).await;
    assert_eq!(outcome.data, None);
    assert_eq!(remote.count("setting:rules"), 1);
    assert_eq!(sync.cache().get_app_setting("rules").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_storage_failure_degrades_to_network_only() {
    let cache: Arc<CacheManager<SqliteStore>> = Arc::new(CacheManager::new(
      || Err(Error::Storage("corrupt".into())),
      FreshnessPolicy::default(),
    ));
    cache.set_scope("s1");
    let (sync, _remote) = coordinator(cache, MockRemote::new().with_chats(chats(&["c1"])), true);

    let outcome = sync.load_chats(SyncTrigger::Mount).await;

    assert_eq!(outcome.data, chats(&["c1"]));
    assert_eq!(outcome.source, CacheSource::Network);
    assert!(outcome.cache_error.as_ref().is_some_and(Error::is_storage));
    assert!(outcome.error.is_none());
  }

  #[tokio::test]
  async fn test_search_local_match_skips_network() {
    let cache = memory_cache("s1");
    cache
      .save_chats(vec![Chat::new("c1").with_name("Alice Store")], None)
      .await
      .unwrap();
    let (sync, remote) = coordinator(cache, MockRemote::new(), true);

    let outcome = sync.search_chats("alice").await.unwrap();

    assert!(matches!(outcome, SearchOutcome::Local(ref hits) if hits.len() == 1));
    assert!(remote.calls().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_search_debounce_supersedes_older_queries() {
    let remote = MockRemote::new();
    *remote.search_results.lock().unwrap() = chats(&["remote1"]);
    let (sync, remote) = coordinator(memory_cache("s1"), remote, true);

    let first = {
      let sync = Arc::clone(&sync);
      tokio::spawn(async move { sync.search_chats("bo").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = sync.search_chats("bob").await.unwrap();

    assert_eq!(first.await.unwrap().unwrap(), SearchOutcome::Superseded);
    assert_eq!(second, SearchOutcome::Remote(chats(&["remote1"])));
    assert_eq!(remote.calls(), vec!["search:bob".to_string()]);
  }

  #[tokio::test]
  async fn test_deferred_keys_are_scoped() {
    let cache = memory_cache("s1");
    let (sync, remote) = coordinator(cache, MockRemote::new(), false);
    sync.refresh_chats(SyncTrigger::Mount).await;

    sync.cache().set_scope("s2");
    assert!(sync.deferred().is_empty());
    let report = sync.on_connectivity_change(true).await;
    assert!(report.refreshed.is_empty());
    assert!(remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_scope_switch_during_fetch_keeps_data_in_origin_scope() {
    let remote = MockRemote::new()
      .with_chats(chats(&["a-private"]))
      .with_messages("c1", messages("c1", "m", 2));
    remote.set_delay(Duration::from_millis(50));
    let (sync, _remote) = coordinator(memory_cache("s1"), remote, true);

    let refreshing = {
      let sync = Arc::clone(&sync);
      tokio::spawn(async move { sync.refresh_chats(SyncTrigger::Mount).await })
    };
    let paging = {
      let sync = Arc::clone(&sync);
      tokio::spawn(async move { sync.load_more_messages("c1", 0).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    sync.cache().set_scope("s2");

    let outcome = refreshing.await.unwrap();
    assert!(outcome.cache_error.is_none());
    assert!(matches!(paging.await.unwrap().unwrap(), LoadMore::Appended(_)));

    let cache = sync.cache();
    assert!(!cache.get_chats().await.unwrap().from_cache);
    assert!(cache.get_all_messages("c1").await.unwrap().is_none());
    cache.set_scope("s1");
    assert_eq!(cache.get_chats().await.unwrap().chats, chats(&["a-private"]));
    assert_eq!(cache.get_all_messages("c1").await.unwrap().unwrap().items.len(), 2);
  }

  #[tokio::test]
  async fn test_logout_during_fetch_discards_result() {
    let remote = MockRemote::new().with_chats(chats(&["c1"]));
    remote.set_delay(Duration::from_millis(50));
    let (sync, _remote) = coordinator(memory_cache("s1"), remote, true);

    let refreshing = {
      let sync = Arc::clone(&sync);
      tokio::spawn(async move { sync.refresh_chats(SyncTrigger::PullToRefresh).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    sync.cache().clear_current_setting_cache().await.unwrap();

    let outcome = refreshing.await.unwrap();
    assert_eq!(outcome.data, chats(&["c1"]));
    assert_eq!(outcome.cache_error, Some(Error::ScopeCleared("s1".into())));
    assert!(!sync.cache().get_chats().await.unwrap().from_cache);
  }
}
