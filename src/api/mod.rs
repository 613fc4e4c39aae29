//! Network collaborators consumed by the sync layer.
//!
//! `ApiClient` is the raw transport (`fetch(endpoint, method, params)`);
//! `RemoteSource` is the domain-level view the Sync Coordinator uses. The
//! coordinator never sees endpoint URLs or credentials.

mod http;
mod rest;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::Result;
use crate::model::{Chat, Message, MessageDraft, Page, PageRequest};

pub use http::HttpApiClient;
pub use rest::RestRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
    })
  }
}

/// Decoded response of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub data: Value,
  pub status: u16,
}

/// Raw backend transport. Non-2xx responses are `Error::Network`.
#[async_trait]
pub trait ApiClient: Send + Sync + 'static {
  /// `params` is sent as the query string for GET/DELETE and as the JSON body
  /// otherwise. `Value::Null` sends nothing.
  async fn fetch(&self, endpoint: &str, method: Method, params: &Value) -> Result<ApiResponse>;
}

/// Domain-level fetches the Sync Coordinator reconciles into the cache.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
  async fn fetch_chats(&self, page: PageRequest) -> Result<Page<Chat>>;

  /// Messages of a chat, newest first.
  async fn fetch_messages(&self, chat_id: &str, page: PageRequest) -> Result<Page<Message>>;

  async fn search_chats(&self, query: &str) -> Result<Vec<Chat>>;

  async fn fetch_app_setting(&self, name: &str) -> Result<Value>;

  /// Send a message; returns the persisted server record.
  async fn send_message(&self, chat_id: &str, draft: &MessageDraft) -> Result<Message>;
}

/// Re-serialize a value through JSON to convert between compatible types.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}
