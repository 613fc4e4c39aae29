//! Per-key write sequencing and the clear barrier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Fair async mutex per collection key.
///
/// Tokio's mutex queues waiters in FIFO order, so writes to one key are applied
/// in the order they were issued.
#[derive(Default)]
pub(crate) struct KeyedLocks {
  locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
      // Drop entries nobody holds or waits on
      locks.retain(|k, l| k == key || Arc::strong_count(l) > 1);
      Arc::clone(locks.entry(key.to_string()).or_default())
    };
    lock.lock_owned().await
  }
}

/// How many times a scope has been cleared, plus the global wipe count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Generation {
  epoch: u64,
  scope: u64,
}

/// Orders writes against clears.
///
/// Writers hold a shared guard across their read-modify-write; a clear takes
/// the guard exclusively, so it waits for writers already running and bumps
/// the generation before any later writer gets in. A writer whose generation
/// was taken before the clear must drop its write.
#[derive(Default)]
pub(crate) struct ClearBarrier {
  gate: RwLock<()>,
  epoch: AtomicU64,
  scopes: Mutex<HashMap<String, u64>>,
}

impl ClearBarrier {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn generation(&self, scope_id: &str) -> Generation {
    let scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
    Generation {
      epoch: self.epoch.load(Ordering::SeqCst),
      scope: scopes.get(scope_id).copied().unwrap_or(0),
    }
  }

  /// Shared guard for one write.
  pub(crate) async fn enter(&self) -> RwLockReadGuard<'_, ()> {
    self.gate.read().await
  }

  /// Exclusive guard for clearing `scope_id`; the generation is already bumped.
  pub(crate) async fn clear_scope(&self, scope_id: &str) -> RwLockWriteGuard<'_, ()> {
    let guard = self.gate.write().await;
    let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
    *scopes.entry(scope_id.to_string()).or_default() += 1;
    guard
  }

  /// Exclusive guard for wiping every scope.
  pub(crate) async fn clear_all(&self) -> RwLockWriteGuard<'_, ()> {
    let guard = self.gate.write().await;
    self.epoch.fetch_add(1, Ordering::SeqCst);
    guard
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_same_key_is_serialized_in_issue_order() {
    let locks = Arc::new(KeyedLocks::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = locks.acquire("chats").await;
    let mut handles = Vec::new();
    for i in 0..3 {
      let locks = Arc::clone(&locks);
      let order = Arc::clone(&order);
      handles.push(tokio::spawn(async move {
        let _guard = locks.acquire("chats").await;
        order.lock().unwrap().push(i);
      }));
      // Let each task enqueue before spawning the next
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    drop(first);
    for handle in handles {
      handle.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
  }

  #[tokio::test]
  async fn test_different_keys_do_not_block() {
    let locks = KeyedLocks::new();
    let _a = locks.acquire("messages:a").await;
    let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("messages:b")).await;
    assert!(b.is_ok());
  }

  #[tokio::test]
  async fn test_clear_waits_for_running_writer() {
    let barrier = Arc::new(ClearBarrier::new());
    let before = barrier.generation("s1");

    let writer = barrier.enter().await;
    let clearing = {
      let barrier = Arc::clone(&barrier);
      tokio::spawn(async move {
        let _guard = barrier.clear_scope("s1").await;
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!clearing.is_finished());
    assert_eq!(barrier.generation("s1"), before);

    drop(writer);
    clearing.await.unwrap();
    assert_ne!(barrier.generation("s1"), before);
  }

  #[tokio::test]
  async fn test_generations_are_per_scope() {
    let barrier = ClearBarrier::new();
    let other = barrier.generation("s2");
    drop(barrier.clear_scope("s1").await);
    assert_eq!(barrier.generation("s2"), other);

    drop(barrier.clear_all().await);
    assert_ne!(barrier.generation("s2"), other);
  }
}
