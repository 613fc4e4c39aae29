use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::lock;
use crate::api::RemoteSource;
use crate::cache::{dedup_by_key, LocalStore};
use crate::error::Result;
use crate::model::{confirmed_count, Message};
use crate::sync::{LoadMore, MessagesOutcome, SyncCoordinator, SyncTrigger};

/// What a conversation screen renders. Messages are newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagesState {
  pub messages: Vec<Message>,
  pub is_loading: bool,
  pub is_loading_more: bool,
  pub from_cache: bool,
  pub has_more: bool,
  pub total_count: u64,
  pub error: Option<String>,
}

impl MessagesState {
  fn set_total(&mut self, total_count: u64) {
    self.total_count = total_count;
    self.has_more = (confirmed_count(&self.messages) as u64) < total_count;
  }
}

/// View model of one chat's messages.
pub struct CachedMessages<S: LocalStore, R: RemoteSource> {
  sync: Arc<SyncCoordinator<S, R>>,
  chat_id: String,
  state: Arc<Mutex<MessagesState>>,
  mounted: Arc<AtomicBool>,
}

impl<S: LocalStore, R: RemoteSource> CachedMessages<S, R> {
  pub fn new(sync: Arc<SyncCoordinator<S, R>>, chat_id: impl Into<String>) -> Self {
    Self {
      sync,
      chat_id: chat_id.into(),
      state: Arc::new(Mutex::new(MessagesState::default())),
      mounted: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn chat_id(&self) -> &str {
    &self.chat_id
  }

  pub fn state(&self) -> MessagesState {
    lock(&self.state).clone()
  }

  /// Show cached messages, then fetch the newest page in the background.
  pub async fn mount(&self) -> JoinHandle<()> {
    self.mounted.store(true, Ordering::SeqCst);
    lock(&self.state).is_loading = true;

    let cached = self.sync.read_messages(&self.chat_id).await;
    let online = self.sync.connectivity().is_online();
    {
      let mut state = lock(&self.state);
      state.from_cache = cached.from_cache();
      state.is_loading = cached.data.is_empty() && online;
      state.messages = cached.data;
      state.set_total(cached.total_count.unwrap_or(0));
    }

    let sync = Arc::clone(&self.sync);
    let state = Arc::clone(&self.state);
    let mounted = Arc::clone(&self.mounted);
    let chat_id = self.chat_id.clone();
    tokio::spawn(async move {
      let outcome = sync.refresh_messages(&chat_id, SyncTrigger::Mount).await;
      if !mounted.load(Ordering::SeqCst) {
        debug!(chat = %chat_id, "conversation unmounted, result only cached");
        return;
      }
      apply(&state, outcome);
    })
  }

  /// Fetch the next older page and append it to the window.
  ///
  /// Calls made while a previous one is in flight are skipped. A failed fetch
  /// is reported in `error` and counts as skipped.
  pub async fn load_more(&self) -> LoadMore {
    let offset = {
      let mut state = lock(&self.state);
      if !state.has_more {
        return LoadMore::Exhausted;
      }
      state.is_loading_more = true;
      confirmed_count(&state.messages)
    };

    let result = self.sync.load_more_messages(&self.chat_id, offset).await;

    let mut state = lock(&self.state);
    match result {
      Ok(LoadMore::Skipped) => return LoadMore::Skipped,
      Ok(LoadMore::Appended(page)) => {
        if self.mounted.load(Ordering::SeqCst) {
          let total = page.total_count;
          state.messages = merge(&state.messages, &page.items);
          state.set_total(total);
          state.error = None;
        }
        state.is_loading_more = false;
        LoadMore::Appended(page)
      }
      Ok(other) => {
        if other == LoadMore::Exhausted {
          state.has_more = false;
        }
        state.is_loading_more = false;
        other
      }
      Err(e) => {
        state.is_loading_more = false;
        state.error = Some(e.to_string());
        LoadMore::Skipped
      }
    }
  }

  /// Put an incoming or sent message on top and cache it.
  pub async fn add_message(&self, mut message: Message) -> Result<()> {
    if message.chat_id.is_empty() {
      message.chat_id = self.chat_id.clone();
    }
    {
      let mut state = lock(&self.state);
      let key = message.key();
      match state.messages.iter().position(|m| m.key() == key) {
        Some(index) => state.messages[index] = message.clone(),
        None => state.messages.insert(0, message.clone()),
      }
    }
    let added = self.sync.cache().add_message(message, &self.chat_id).await;
    if let Err(e) = &added {
      lock(&self.state).error = Some(e.to_string());
    }
    added
  }

  /// Replace the window and the cached snapshot.
  pub async fn update_cache(&self, messages: Vec<Message>) -> Result<()> {
    let total = {
      let mut state = lock(&self.state);
      state.messages = messages.clone();
      let total = state.total_count.max(confirmed_count(&messages) as u64);
      state.set_total(total);
      total
    };
    let saved = self
      .sync
      .cache()
      .save_messages(messages, &self.chat_id, Some(total))
      .await;
    if let Err(e) = &saved {
      lock(&self.state).error = Some(e.to_string());
    }
    saved
  }

  /// Re-read the Local Store, e.g. after an optimistic update.
  pub async fn reload(&self) {
    let cached = self.sync.read_messages(&self.chat_id).await;
    let mut state = lock(&self.state);
    match cached.cache_error {
      Some(e) => state.error = Some(e.to_string()),
      None => {
        state.from_cache = cached.source.is_cache();
        state.messages = cached.data;
        state.set_total(cached.total_count.unwrap_or(0));
      }
    }
  }

  pub fn unmount(&self) {
    self.mounted.store(false, Ordering::SeqCst);
  }
}

/// Append `page` to `window`; a key already shown is updated in place.
fn merge(window: &[Message], page: &[Message]) -> Vec<Message> {
  let combined: Vec<Message> = window.iter().chain(page).cloned().collect();
  dedup_by_key(&combined).into_iter().cloned().collect()
}

fn apply(state: &Mutex<MessagesState>, outcome: MessagesOutcome) {
  let mut state = lock(state);
  state.is_loading = false;
  match outcome.error {
    Some(e) => {
      if state.messages.is_empty() {
        state.messages = outcome.data;
      }
      state.error = Some(e.to_string());
    }
    None => {
      state.from_cache = outcome.source.is_cache();
      state.messages = outcome.data;
      state.error = None;
      if let Some(total) = outcome.total_count {
        state.set_total(total);
      }
    }
  }
}
