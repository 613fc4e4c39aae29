//! `RemoteSource` over a REST `ApiClient`, using configured endpoint templates.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{reserialize, ApiClient, Method, RemoteSource};
use crate::config::Endpoints;
use crate::error::{Error, Result};
use crate::model::{Chat, Message, MessageDraft, Page, PageRequest};

/// Maps domain fetches onto backend endpoints.
pub struct RestRemote<A: ApiClient> {
  client: A,
  endpoints: Endpoints,
}

impl<A: ApiClient> RestRemote<A> {
  pub fn new(client: A, endpoints: Endpoints) -> Self {
    Self { client, endpoints }
  }
}

#[async_trait]
impl<A: ApiClient> RemoteSource for RestRemote<A> {
  async fn fetch_chats(&self, page: PageRequest) -> Result<Page<Chat>> {
    let response = self
      .client
      .fetch(
        &self.endpoints.chats,
        Method::Get,
        &json!({ "limit": page.limit, "offset": page.offset }),
      )
      .await?;
    parse_page(response.data, "chats")
  }

  async fn fetch_messages(&self, chat_id: &str, page: PageRequest) -> Result<Page<Message>> {
    let endpoint = fill(&self.endpoints.messages, "chat_id", chat_id);
    let response = self
      .client
      .fetch(
        &endpoint,
        Method::Get,
        &json!({ "limit": page.limit, "offset": page.offset }),
      )
      .await?;
    let mut page: Page<Message> = parse_page(response.data, "messages")?;
    for message in &mut page.items {
      if message.chat_id.is_empty() {
        message.chat_id = chat_id.to_string();
      }
    }
    Ok(page)
  }

  async fn search_chats(&self, query: &str) -> Result<Vec<Chat>> {
    let response = self
      .client
      .fetch(&self.endpoints.search, Method::Get, &json!({ "q": query }))
      .await?;
    Ok(parse_page::<Chat>(response.data, "chats")?.items)
  }

  async fn fetch_app_setting(&self, name: &str) -> Result<Value> {
    let endpoint = fill(&self.endpoints.setting, "name", name);
    let response = self.client.fetch(&endpoint, Method::Get, &Value::Null).await?;
    Ok(response.data)
  }

  async fn send_message(&self, chat_id: &str, draft: &MessageDraft) -> Result<Message> {
    let endpoint = fill(&self.endpoints.send, "chat_id", chat_id);
    let mut body = draft.extra.clone();
    if let Some(text) = &draft.text {
      body.insert("text".into(), Value::String(text.clone()));
    }
    let response = self
      .client
      .fetch(&endpoint, Method::Post, &Value::Object(body))
      .await?;

    // Some endpoints wrap the record in {"message": {...}}
    let record = match response.data {
      Value::Object(mut map) if map.get("message").is_some_and(Value::is_object) => {
        map.remove("message").unwrap_or(Value::Null)
      }
      other => other,
    };
    let mut message: Message = reserialize(record)?;
    if message.id.is_none() {
      return Err(Error::Serialization("sent message has no _id".into()));
    }
    if message.chat_id.is_empty() {
      message.chat_id = chat_id.to_string();
    }
    Ok(message)
  }
}

/// Substitute `{placeholder}` in an endpoint template.
fn fill(template: &str, placeholder: &str, value: &str) -> String {
  template.replace(&format!("{{{}}}", placeholder), value)
}

/// Accept either a bare array or an object carrying the list and a total.
///
/// The list is looked up under `list_field`, then `items`, then `data`; the
/// total under `totalCount`, `total`, then `count`. Without a total the list
/// length is used.
fn parse_page<T: DeserializeOwned>(data: Value, list_field: &str) -> Result<Page<T>> {
  match data {
    Value::Array(items) => {
      let total = items.len() as u64;
      Ok(Page::new(reserialize(items)?, total))
    }
    Value::Object(mut map) => {
      let items = [list_field, "items", "data"]
        .iter()
        .find_map(|field| match map.remove(*field) {
          Some(Value::Array(items)) => Some(items),
          _ => None,
        })
        .ok_or_else(|| {
          Error::Serialization(format!("response has no '{}' list", list_field))
        })?;
      let total = ["totalCount", "total", "count"]
        .iter()
        .find_map(|field| map.get(*field).and_then(Value::as_u64))
        .unwrap_or(items.len() as u64);
      Ok(Page::new(reserialize(items)?, total))
    }
    other => Err(Error::Serialization(format!(
      "expected a list response, got {}",
      other
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiResponse;
  use std::sync::Mutex;

  /// Records calls and replies with a canned body.
  struct CannedClient {
    body: Value,
    calls: Mutex<Vec<(String, Method, Value)>>,
  }

  impl CannedClient {
    fn new(body: Value) -> Self {
      Self {
        body,
        calls: Mutex::new(Vec::new()),
      }
    }
  }

  #[async_trait]
  impl ApiClient for CannedClient {
    async fn fetch(&self, endpoint: &str, method: Method, params: &Value) -> Result<ApiResponse> {
      self
        .calls
        .lock()
        .unwrap()
        .push((endpoint.to_string(), method, params.clone()));
      Ok(ApiResponse {
        data: self.body.clone(),
        status: 200,
      })
    }
  }

  #[tokio::test]
  async fn test_fetch_messages_fills_template_and_chat_id() {
    let client = CannedClient::new(json!({
      "messages": [{"_id": "m1", "text": "hi"}],
      "totalCount": 57
    }));
    let remote = RestRemote::new(client, Endpoints::default());

    let page = remote
      .fetch_messages("c42", PageRequest::new(20, 40))
      .await
      .unwrap();

    assert_eq!(page.total_count, 57);
    assert_eq!(page.items[0].chat_id, "c42");
    let calls = remote.client.calls.lock().unwrap();
    assert_eq!(calls[0].0, "chats/c42/messages");
    assert_eq!(calls[0].2, json!({"limit": 20, "offset": 40}));
  }

  #[tokio::test]
  async fn test_send_message_unwraps_record() {
    let client = CannedClient::new(json!({"message": {"_id": "s1", "status": "sent"}}));
    let remote = RestRemote::new(client, Endpoints::default());

    let sent = remote
      .send_message("c1", &MessageDraft::text("hello"))
      .await
      .unwrap();

    assert_eq!(sent.id.as_deref(), Some("s1"));
    assert_eq!(sent.chat_id, "c1");
    let calls = remote.client.calls.lock().unwrap();
    assert_eq!(calls[0].1, Method::Post);
    assert_eq!(calls[0].2, json!({"text": "hello"}));
  }

  #[test]
  fn test_parse_page_shapes() {
    let bare: Page<Chat> = parse_page(json!([{"_id": "a"}, {"_id": "b"}]), "chats").unwrap();
    assert_eq!((bare.items.len(), bare.total_count), (2, 2));

    let wrapped: Page<Chat> =
      parse_page(json!({"data": [{"_id": "a"}], "total": 10}), "chats").unwrap();
    assert_eq!((wrapped.items.len(), wrapped.total_count), (1, 10));

    assert!(parse_page::<Chat>(json!({"oops": true}), "chats").is_err());
    assert!(parse_page::<Chat>(json!("nope"), "chats").is_err());
  }
}
