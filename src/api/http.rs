use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ApiClient, ApiResponse, Method};
use crate::config::ApiConfig;
use crate::error::{Error, Result};

/// Longest error body echoed into an error message.
const MAX_ERROR_BODY: usize = 300;

/// REST transport over reqwest.
#[derive(Clone)]
pub struct HttpApiClient {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpApiClient {
  pub fn new(config: &ApiConfig, token: Option<&str>) -> Result<Self> {
    let base_url = parse_base_url(&config.base_url)?;

    let mut headers = HeaderMap::new();
    if let Some(token) = token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| Error::Config(format!("Invalid API token: {}", e)))?;
      headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  fn url(&self, endpoint: &str) -> Result<Url> {
    self
      .base_url
      .join(endpoint.trim_start_matches('/'))
      .map_err(|e| Error::Config(format!("Invalid endpoint '{}': {}", endpoint, e)))
  }
}

#[async_trait]
impl ApiClient for HttpApiClient {
  async fn fetch(&self, endpoint: &str, method: Method, params: &Value) -> Result<ApiResponse> {
    let url = self.url(endpoint)?;
    debug!(%method, %url, "api request");

    let mut request = match method {
      Method::Get => self.client.get(url),
      Method::Post => self.client.post(url),
      Method::Put => self.client.put(url),
      Method::Delete => self.client.delete(url),
    };
    if !params.is_null() {
      request = match method {
        Method::Get | Method::Delete => request.query(&query_pairs(params)),
        Method::Post | Method::Put => request
          .header(reqwest::header::CONTENT_TYPE, "application/json")
          .body(serde_json::to_vec(params)?),
      };
    }

    let response = request.send().await.map_err(|e| Error::Network {
      status: e.status().map(|s| s.as_u16()),
      message: e.to_string(),
    })?;
    let status = response.status();
    let body = response.text().await.map_err(|e| Error::Network {
      status: Some(status.as_u16()),
      message: format!("Failed to read response body: {}", e),
    })?;

    if !status.is_success() {
      return Err(Error::Network {
        status: Some(status.as_u16()),
        message: truncate(&body, MAX_ERROR_BODY),
      });
    }

    let data = if body.trim().is_empty() {
      Value::Null
    } else {
      serde_json::from_str(&body)?
    };
    Ok(ApiResponse {
      data,
      status: status.as_u16(),
    })
  }
}

/// Base URLs are treated as directories so endpoints join beneath them.
fn parse_base_url(raw: &str) -> Result<Url> {
  let normalized = if raw.ends_with('/') {
    raw.to_string()
  } else {
    format!("{}/", raw)
  };
  Url::parse(&normalized)
    .map_err(|e| Error::Config(format!("Invalid API base URL '{}': {}", raw, e)))
}

/// Flatten a JSON object into query pairs. Nulls are skipped.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
  match params {
    Value::Object(map) => map
      .iter()
      .filter(|(_, v)| !v.is_null())
      .map(|(k, v)| {
        let value = match v {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        };
        (k.clone(), value)
      })
      .collect(),
    _ => Vec::new(),
  }
}

fn truncate(s: &str, max: usize) -> String {
  match s.char_indices().nth(max) {
    Some((idx, _)) => format!("{}...", &s[..idx]),
    None => s.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_base_url_joins_beneath_path() {
    let config = ApiConfig {
      base_url: "https://api.example.com/v1".into(),
      ..ApiConfig::default()
    };
    let client = HttpApiClient::new(&config, Some("secret")).unwrap();
    assert_eq!(
      client.url("/chats/42/messages").unwrap().as_str(),
      "https://api.example.com/v1/chats/42/messages"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    let config = ApiConfig {
      base_url: "not a url".into(),
      ..ApiConfig::default()
    };
    assert!(matches!(
      HttpApiClient::new(&config, None),
      Err(Error::Config(_))
    ));
  }

  #[test]
  fn test_query_pairs() {
    let pairs = query_pairs(&json!({"limit": 20, "q": "alice", "skip": null}));
    assert!(pairs.contains(&("limit".to_string(), "20".to_string())));
    assert!(pairs.contains(&("q".to_string(), "alice".to_string())));
    assert_eq!(pairs.len(), 2);
    assert!(query_pairs(&json!([1, 2])).is_empty());
  }

  #[test]
  fn test_truncate() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("abcdef", 3), "abc...");
  }
}
