use tokio::sync::broadcast;

/// Cache change notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// A collection snapshot was written or appended to
  CollectionUpdated { scope_id: String, name: String },
  /// An app setting was saved or cleared
  SettingUpdated { scope_id: String, name: String },
  /// The active scope changed
  ScopeChanged { scope_id: String },
  /// Every collection of a scope was removed
  ScopeCleared { scope_id: String },
  /// The whole store was wiped
  AllCleared,
  /// A network refresh failed; cached data was kept. Meant for a transient toast.
  SyncFailed {
    scope_id: String,
    name: String,
    message: String,
  },
}

/// Fan-out channel for cache events.
///
/// Publishing never blocks; slow subscribers lag and miss events rather than
/// holding up writers.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn publish(&self, event: CacheEvent) {
    // No subscribers is fine
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_receive_published_events() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();

    bus.publish(CacheEvent::AllCleared);
    bus.publish(CacheEvent::ScopeChanged {
      scope_id: "s1".into(),
    });

    assert_eq!(rx.recv().await.unwrap(), CacheEvent::AllCleared);
    assert_eq!(
      rx.recv().await.unwrap(),
      CacheEvent::ScopeChanged {
        scope_id: "s1".into()
      }
    );
  }

  #[test]
  fn test_publish_without_subscribers() {
    let bus = EventBus::new(4);
    bus.publish(CacheEvent::AllCleared);
  }
}
