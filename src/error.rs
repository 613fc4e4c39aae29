//! Error types for the cache layer.

use thiserror::Error;

/// Errors surfaced by the Local Store, the Cache Manager and the Sync Coordinator.
///
/// Payloads are strings so an outcome can be cloned to every caller that
/// awaited the same operation (see `CacheManager::initialize`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
  /// Local Store I/O failure (open, read, write, corruption).
  #[error("storage error: {0}")]
  Storage(String),

  /// A fetch from the backend API failed.
  #[error("network error{}: {message}", status_suffix(.status))]
  Network {
    status: Option<u16>,
    message: String,
  },

  /// A cached document or API payload could not be (de)serialized.
  #[error("serialization error: {0}")]
  Serialization(String),

  /// An operation needed the active scope before `set_scope` was called.
  #[error("no active scope")]
  NoScope,

  /// Optimistic message is no longer pending.
  #[error("message {temp_id} is {status}, expected pending")]
  InvalidTransition { temp_id: String, status: String },

  #[error("message {0} not found")]
  MessageNotFound(String),

  /// The scope was cleared after the write started; the write was dropped.
  #[error("scope {0} was cleared, write discarded")]
  ScopeCleared(String),

  #[error("configuration error: {0}")]
  Config(String),
}

impl Error {
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network {
      status: None,
      message: message.into(),
    }
  }

  /// True for failures of the Local Store itself.
  pub fn is_storage(&self) -> bool {
    matches!(self, Self::Storage(_))
  }

  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network { .. })
  }
}

fn status_suffix(status: &Option<u16>) -> String {
  status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<tokio::task::JoinError> for Error {
  fn from(e: tokio::task::JoinError) -> Self {
    Self::Storage(format!("storage task failed: {e}"))
  }
}

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;
