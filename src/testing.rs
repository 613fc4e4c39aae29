//! Scripted `RemoteSource` for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::RemoteSource;
use crate::cache::{CacheManager, FreshnessPolicy, SqliteStore};
use crate::error::{Error, Result};
use crate::model::{Chat, Direction, Message, MessageDraft, Page, PageRequest};

/// In-memory backend that records every call.
#[derive(Default)]
pub(crate) struct MockRemote {
  pub chats: Mutex<Vec<Chat>>,
  /// Server-side messages per chat, newest first
  pub messages: Mutex<HashMap<String, Vec<Message>>>,
  pub settings: Mutex<HashMap<String, Value>>,
  pub search_results: Mutex<Vec<Chat>>,
  pub fail: AtomicBool,
  pub delay: Mutex<Option<Duration>>,
  calls: Mutex<Vec<String>>,
  sent: AtomicUsize,
}

impl MockRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_chats(self, chats: Vec<Chat>) -> Self {
    *self.chats.lock().unwrap() = chats;
    self
  }

  pub fn with_messages(self, chat_id: &str, messages: Vec<Message>) -> Self {
    self
      .messages
      .lock()
      .unwrap()
      .insert(chat_id.to_string(), messages);
    self
  }

  pub fn with_setting(self, name: &str, value: Value) -> Self {
    self.settings.lock().unwrap().insert(name.to_string(), value);
    self
  }

  pub fn set_failing(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  /// Number of recorded calls starting with `prefix`.
  pub fn count(&self, prefix: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.starts_with(prefix))
      .count()
  }

  async fn call(&self, name: String) -> Result<()> {
    self.calls.lock().unwrap().push(name);
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    if self.fail.load(Ordering::SeqCst) {
      return Err(Error::Network {
        status: Some(503),
        message: "service unavailable".into(),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteSource for MockRemote {
  async fn fetch_chats(&self, page: PageRequest) -> Result<Page<Chat>> {
    self.call(format!("chats:{}", page.offset)).await?;
    let chats = self.chats.lock().unwrap().clone();
    let total = chats.len() as u64;
    Ok(Page::new(
      chats.into_iter().skip(page.offset).take(page.limit).collect(),
      total,
    ))
  }

  async fn fetch_messages(&self, chat_id: &str, page: PageRequest) -> Result<Page<Message>> {
    self
      .call(format!("messages:{}:{}", chat_id, page.offset))
      .await?;
    let messages = self
      .messages
      .lock()
      .unwrap()
      .get(chat_id)
      .cloned()
      .unwrap_or_default();
    let total = messages.len() as u64;
    Ok(Page::new(
      messages.into_iter().skip(page.offset).take(page.limit).collect(),
      total,
    ))
  }

  async fn search_chats(&self, query: &str) -> Result<Vec<Chat>> {
    self.call(format!("search:{}", query)).await?;
    Ok(self.search_results.lock().unwrap().clone())
  }

  async fn fetch_app_setting(&self, name: &str) -> Result<Value> {
    self.call(format!("setting:{}", name)).await?;
    Ok(
      self
        .settings
        .lock()
        .unwrap()
        .get(name)
        .cloned()
        .unwrap_or(Value::Null),
    )
  }

  async fn send_message(&self, chat_id: &str, draft: &MessageDraft) -> Result<Message> {
    self.call(format!("send:{}", chat_id)).await?;
    let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
    let mut message =
      Message::new(format!("srv-{}", n), chat_id).with_direction(Direction::Outbound);
    message.text = draft.text.clone();
    Ok(message)
  }
}

/// In-memory manager with `scope` already selected.
pub(crate) fn memory_cache(scope: &str) -> Arc<CacheManager<SqliteStore>> {
  memory_cache_with(scope, FreshnessPolicy::default())
}

pub(crate) fn memory_cache_with(
  scope: &str,
  policy: FreshnessPolicy,
) -> Arc<CacheManager<SqliteStore>> {
  let manager = CacheManager::new(SqliteStore::open_in_memory, policy);
  manager.set_scope(scope);
  Arc::new(manager)
}

pub(crate) fn chats(ids: &[&str]) -> Vec<Chat> {
  ids.iter().map(|id| Chat::new(*id).with_name(*id)).collect()
}

/// `n` confirmed messages `<prefix>0..` for `chat_id`, newest first.
pub(crate) fn messages(chat_id: &str, prefix: &str, n: usize) -> Vec<Message> {
  (0..n)
    .map(|i| Message::new(format!("{}{}", prefix, i), chat_id).with_text(format!("#{}", i)))
    .collect()
}
