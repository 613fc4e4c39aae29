use std::sync::Arc;

use crate::cache::{CacheManager, LocalStore};
use crate::error::Result;
use crate::model::{Message, MessageDraft, SendFailure};

/// Optimistic send bookkeeping for one chat.
///
/// The caller owns the network send: `add_optimistic` before it, then
/// `confirm_message` or `fail_message` with its outcome.
pub struct OptimisticMessages<S: LocalStore> {
  cache: Arc<CacheManager<S>>,
  chat_id: String,
}

impl<S: LocalStore> OptimisticMessages<S> {
  pub fn new(cache: Arc<CacheManager<S>>, chat_id: impl Into<String>) -> Self {
    Self {
      cache,
      chat_id: chat_id.into(),
    }
  }

  /// Pending and failed messages of the chat, newest first.
  pub async fn pending_messages(&self) -> Result<Vec<Message>> {
    self.cache.pending_messages(&self.chat_id).await
  }

  /// Cache a pending record; returns its temporary id once it is visible.
  pub async fn add_optimistic(&self, draft: MessageDraft) -> Result<String> {
    self
      .cache
      .add_optimistic_message(draft, &self.chat_id)
      .await
  }

  pub async fn confirm_message(&self, temp_id: &str, mut server_message: Message) -> Result<()> {
    if server_message.chat_id.is_empty() {
      server_message.chat_id = self.chat_id.clone();
    }
    self
      .cache
      .update_optimistic_message(temp_id, server_message)
      .await
  }

  pub async fn fail_message(&self, temp_id: &str, error: SendFailure) -> Result<()> {
    self.cache.mark_message_failed(temp_id, error).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use crate::model::MessageStatus;
  use crate::testing::memory_cache;

  #[tokio::test]
  async fn test_confirm_leaves_single_server_record() {
    let cache = memory_cache("s1");
    let optimistic = OptimisticMessages::new(Arc::clone(&cache), "c1");

    let temp_id = optimistic
      .add_optimistic(MessageDraft::text("hi"))
      .await
      .unwrap();
    let all = cache.get_all_messages("c1").await.unwrap().unwrap();
    assert_eq!(all.items.len(), 1);
    assert_eq!(all.items[0].status, MessageStatus::Pending);

    let mut server = Message::new("server1", "");
    server.text = Some("hi".into());
    optimistic.confirm_message(&temp_id, server).await.unwrap();

    let all = cache.get_all_messages("c1").await.unwrap().unwrap();
    assert_eq!(all.items.len(), 1);
    assert_eq!(all.items[0].id.as_deref(), Some("server1"));
    assert_eq!(all.items[0].chat_id, "c1");
    assert!(optimistic.pending_messages().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_fail_retains_record_and_blocks_confirm() {
    let cache = memory_cache("s1");
    let optimistic = OptimisticMessages::new(cache, "c1");
    let temp_id = optimistic
      .add_optimistic(MessageDraft::text("hi"))
      .await
      .unwrap();

    optimistic
      .fail_message(&temp_id, SendFailure::new("template required"))
      .await
      .unwrap();
    let pending = optimistic.pending_messages().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, MessageStatus::Failed);

    let err = optimistic
      .fail_message(&temp_id, SendFailure::new("again"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
  }
}
