//! Framework-free view models over the cache and sync layers.
//!
//! Each adapter keeps its displayed state behind a shared lock and a mounted
//! flag. Background refreshes run on `tokio::spawn`; a refresh that finishes
//! after `unmount` still lands in the Local Store but leaves the adapter state
//! alone. Errors end up in the state's `error` field, never in a panic.

mod chats;
mod init;
mod messages;
mod optimistic;

use std::sync::{Mutex, MutexGuard};

pub use chats::{CachedChats, ChatsState};
pub use init::CacheInitialization;
pub use messages::{CachedMessages, MessagesState};
pub use optimistic::OptimisticMessages;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}
