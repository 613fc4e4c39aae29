//! Domain documents cached by the data layer: chats and messages.
//!
//! Both types keep unknown backend fields in a flattened map so a cache round
//! trip never drops data the UI may render.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
  /// Created locally, not yet acknowledged by the server
  Pending,
  #[default]
  Sent,
  Delivered,
  Read,
  /// Send failed; kept so the UI can offer a retry
  Failed,
}

impl MessageStatus {
  /// Status of a record that has not been confirmed by the server.
  pub fn is_unconfirmed(self) -> bool {
    matches!(self, Self::Pending | Self::Failed)
  }
}

impl fmt::Display for MessageStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Pending => "pending",
      Self::Sent => "sent",
      Self::Delivered => "delivered",
      Self::Read => "read",
      Self::Failed => "failed",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  #[default]
  Inbound,
  Outbound,
}

/// Error descriptor attached to a message whose send failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFailure {
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
}

impl SendFailure {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      code: None,
    }
  }
}

/// A chat message as cached locally.
///
/// Identity is the server `_id` once known, otherwise the local `tempId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
  #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub temp_id: Option<String>,
  #[serde(default)]
  pub chat_id: String,
  #[serde(default)]
  pub status: MessageStatus,
  #[serde(default)]
  pub direction: Direction,
  #[serde(default = "Utc::now")]
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<SendFailure>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Message {
  /// A confirmed message with a server id.
  pub fn new(id: impl Into<String>, chat_id: impl Into<String>) -> Self {
    Self {
      id: Some(id.into()),
      temp_id: None,
      chat_id: chat_id.into(),
      status: MessageStatus::Sent,
      direction: Direction::Inbound,
      timestamp: Utc::now(),
      text: None,
      error: None,
      extra: Map::new(),
    }
  }

  pub fn with_text(mut self, text: impl Into<String>) -> Self {
    self.text = Some(text.into());
    self
  }

  pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
    self.timestamp = timestamp;
    self
  }

  pub fn with_direction(mut self, direction: Direction) -> Self {
    self.direction = direction;
    self
  }

  /// Build the pending record for a locally initiated send.
  pub fn optimistic(temp_id: String, chat_id: &str, draft: MessageDraft) -> Self {
    Self {
      id: None,
      temp_id: Some(temp_id),
      chat_id: chat_id.to_string(),
      status: MessageStatus::Pending,
      direction: Direction::Outbound,
      timestamp: Utc::now(),
      text: draft.text,
      error: None,
      extra: draft.extra,
    }
  }

  /// Identity within a message collection.
  pub fn key(&self) -> String {
    match (&self.id, &self.temp_id) {
      (Some(id), _) => id.clone(),
      (None, Some(temp_id)) => temp_id.clone(),
      (None, None) => format!("{}:{}", self.chat_id, self.timestamp.timestamp_micros()),
    }
  }

  /// True while the message has no server identity.
  pub fn is_optimistic(&self) -> bool {
    self.id.is_none() && self.temp_id.is_some()
  }
}

/// Caller-supplied content of an outgoing message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageDraft {
  pub text: Option<String>,
  pub extra: Map<String, Value>,
}

impl MessageDraft {
  pub fn text(text: impl Into<String>) -> Self {
    Self {
      text: Some(text.into()),
      extra: Map::new(),
    }
  }
}

/// A chat (conversation) list entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
  #[serde(rename = "_id")]
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_message_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_message_status: Option<MessageStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_message_direction: Option<Direction>,
  #[serde(default)]
  pub unread_count: u32,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Chat {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      name: None,
      phone: None,
      last_message: None,
      last_message_at: None,
      last_message_status: None,
      last_message_direction: None,
      unread_count: 0,
      extra: Map::new(),
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
    self.phone = Some(phone.into());
    self
  }

  /// Case-insensitive match on name or phone.
  pub fn matches(&self, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
      return false;
    }
    [&self.name, &self.phone]
      .into_iter()
      .flatten()
      .any(|field| field.to_lowercase().contains(&needle))
  }

  /// Copy the last-message preview fields from `message`.
  pub fn apply_preview(&mut self, message: &Message) {
    self.last_message = Some(message.text.clone().unwrap_or_default());
    self.last_message_at = Some(message.timestamp);
    self.last_message_status = Some(message.status);
    self.last_message_direction = Some(message.direction);
  }
}

/// Offset window into a cached collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
  pub limit: usize,
  pub offset: usize,
}

impl PageRequest {
  pub fn new(limit: usize, offset: usize) -> Self {
    Self { limit, offset }
  }
}

impl Default for PageRequest {
  fn default() -> Self {
    Self {
      limit: 20,
      offset: 0,
    }
  }
}

/// One page of server results with the server-reported total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
  pub items: Vec<T>,
  pub total_count: u64,
}

impl<T> Page<T> {
  pub fn new(items: Vec<T>, total_count: u64) -> Self {
    Self { items, total_count }
  }
}

/// Sort messages newest first for display.
///
/// Confirmed messages order by their (server) timestamp. Equal timestamps keep
/// their cached order, so unconfirmed records stay where they were inserted.
pub fn sort_newest_first(messages: &mut [Message]) {
  messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

/// Number of server-confirmed messages, i.e. the offset of the next page.
pub fn confirmed_count(messages: &[Message]) -> usize {
  messages.iter().filter(|m| !m.is_optimistic()).count()
}
