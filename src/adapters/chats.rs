use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::lock;
use crate::api::RemoteSource;
use crate::cache::LocalStore;
use crate::error::Result;
use crate::model::Chat;
use crate::sync::{ChatsOutcome, SyncCoordinator, SyncTrigger};

/// What a chat list screen renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatsState {
  pub chats: Vec<Chat>,
  /// Nothing to show yet and a fetch is running
  pub is_loading: bool,
  /// Data is shown and a fetch is running
  pub is_refreshing: bool,
  pub from_cache: bool,
  pub is_stale: bool,
  pub error: Option<String>,
}

/// Chat list view model: cached list first, then a background refresh.
pub struct CachedChats<S: LocalStore, R: RemoteSource> {
  sync: Arc<SyncCoordinator<S, R>>,
  state: Arc<Mutex<ChatsState>>,
  mounted: Arc<AtomicBool>,
}

impl<S: LocalStore, R: RemoteSource> CachedChats<S, R> {
  pub fn new(sync: Arc<SyncCoordinator<S, R>>) -> Self {
    Self {
      sync,
      state: Arc::new(Mutex::new(ChatsState::default())),
      mounted: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn state(&self) -> ChatsState {
    lock(&self.state).clone()
  }

  pub fn is_mounted(&self) -> bool {
    self.mounted.load(Ordering::SeqCst)
  }

  /// Show the cached list, then refresh in the background.
  ///
  /// Returns once the cached list is in the state; the handle resolves when
  /// the refresh has been applied.
  pub async fn mount(&self) -> JoinHandle<()> {
    self.mounted.store(true, Ordering::SeqCst);
    lock(&self.state).is_loading = true;

    let cached = self.sync.read_chats().await;
    let online = self.sync.connectivity().is_online();
    {
      let mut state = lock(&self.state);
      state.from_cache = cached.from_cache();
      state.is_stale = cached.is_stale;
      state.is_loading = cached.data.is_empty() && online;
      state.is_refreshing = !cached.data.is_empty() && online;
      state.chats = cached.data;
    }

    self.spawn_refresh(SyncTrigger::Mount)
  }

  /// Re-run the fetch when the screen regains focus.
  pub fn focus(&self) -> JoinHandle<()> {
    self.spawn_refresh(SyncTrigger::Focus)
  }

  /// Pull-to-refresh. An unmounted view only refreshes the cache.
  pub async fn refresh(&self) {
    if self.is_mounted() {
      lock(&self.state).is_refreshing = true;
    }
    let outcome = self.sync.refresh_chats(SyncTrigger::PullToRefresh).await;
    if self.is_mounted() {
      apply(&self.state, outcome);
    } else {
      debug!("chat list unmounted, pull-to-refresh result only cached");
    }
  }

  /// Replace the displayed list and the cached snapshot.
  pub async fn update_cache(&self, chats: Vec<Chat>) -> Result<()> {
    lock(&self.state).chats = chats.clone();
    let saved = self.sync.cache().save_chats(chats, None).await;
    if let Err(e) = &saved {
      lock(&self.state).error = Some(e.to_string());
    }
    saved
  }

  /// Re-read the Local Store without touching the network.
  pub async fn reload(&self) {
    let cached = self.sync.read_chats().await;
    let mut state = lock(&self.state);
    match cached.cache_error {
      Some(e) => state.error = Some(e.to_string()),
      None => {
        state.chats = cached.data;
        state.from_cache = cached.source.is_cache();
        state.is_stale = cached.is_stale;
      }
    }
  }

  /// Stop applying results to this view. In-flight refreshes still update
  /// the cache.
  pub fn unmount(&self) {
    self.mounted.store(false, Ordering::SeqCst);
  }

  fn spawn_refresh(&self, trigger: SyncTrigger) -> JoinHandle<()> {
    let sync = Arc::clone(&self.sync);
    let state = Arc::clone(&self.state);
    let mounted = Arc::clone(&self.mounted);
    tokio::spawn(async move {
      let outcome = sync.refresh_chats(trigger).await;
      if !mounted.load(Ordering::SeqCst) {
        debug!(%trigger, "chat list unmounted, result only cached");
        return;
      }
      apply(&state, outcome);
    })
  }
}

fn apply(state: &Mutex<ChatsState>, outcome: ChatsOutcome) {
  let mut state = lock(state);
  state.is_loading = false;
  state.is_refreshing = false;
  match outcome.error {
    // Keep what is on screen
    Some(e) => {
      if state.chats.is_empty() {
        state.chats = outcome.data;
        state.from_cache = outcome.source.is_cache();
      }
      state.error = Some(e.to_string());
    }
    None => {
      state.from_cache = outcome.source.is_cache();
      state.is_stale = outcome.is_stale;
      state.chats = outcome.data;
      state.error = None;
    }
  }
}
