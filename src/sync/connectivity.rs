use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared device connectivity flag.
///
/// A network-status provider calls `set_online`; the sync layer reads it
/// before every fetch and subscribes to transitions.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn online() -> Self {
    Self::new(true)
  }

  pub fn offline() -> Self {
    Self::new(false)
  }

  /// Update the flag. Returns the previous value.
  pub fn set_online(&self, online: bool) -> bool {
    let mut previous = online;
    self.tx.send_if_modified(|current| {
      previous = *current;
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if previous != online {
      info!(online, "connectivity changed");
    }
    previous
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Receiver woken on every transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::online()
  }
}
