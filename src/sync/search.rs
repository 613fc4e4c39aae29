use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latest-wins debounce for search-as-you-type.
///
/// Every call takes a ticket; after the delay only the newest ticket is still
/// current, so older searches drop out without hitting the network.
#[derive(Debug)]
pub(crate) struct Debouncer {
  delay: Duration,
  generation: AtomicU64,
}

impl Debouncer {
  pub fn new(delay: Duration) -> Self {
    Self {
      delay,
      generation: AtomicU64::new(0),
    }
  }

  /// Supersede every outstanding ticket and take a new one.
  pub fn ticket(&self) -> u64 {
    self.generation.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn is_current(&self, ticket: u64) -> bool {
    self.generation.load(Ordering::SeqCst) == ticket
  }

  /// Wait for input to settle. False when a newer ticket was taken meanwhile.
  pub async fn settle(&self, ticket: u64) -> bool {
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self.is_current(ticket)
  }
}
