use std::sync::Arc;

use crate::cache::{CacheManager, InitState, LocalStore};

/// Startup gate: opens the Local Store once and reports how it went.
pub struct CacheInitialization<S: LocalStore> {
  cache: Arc<CacheManager<S>>,
}

impl<S: LocalStore> CacheInitialization<S> {
  pub fn new(cache: Arc<CacheManager<S>>) -> Self {
    Self { cache }
  }

  /// Open the store. A failure is reported in the state, not returned: the
  /// app keeps running network-only.
  pub async fn initialize(&self) -> InitState {
    if let Err(e) = self.cache.initialize().await {
      tracing::warn!(error = %e, "running without local cache");
    }
    self.cache.init_state()
  }

  pub fn state(&self) -> InitState {
    self.cache.init_state()
  }
}
