use std::sync::Arc;

use stowage_common::{StorageDelegate, StoreConfig};
use typed_builder::TypedBuilder;

use crate::dispatcher::Dispatcher;

/// Everything a store needs at startup.
///
/// ```ignore
/// let deps = StoreDeps::builder()
///     .storage(Arc::new(InMemoryStorage::new()))
///     .dispatchers(vec![Arc::new(NoopDispatcher::new())])
///     .build();
/// ```
#[derive(Clone, TypedBuilder)]
pub struct StoreDeps {
    pub storage: Arc<dyn StorageDelegate>,
    /// Empty means the store writes dispatchables nobody delivers.
    #[builder(default)]
    pub dispatchers: Vec<Arc<dyn Dispatcher>>,
    #[builder(default)]
    pub config: StoreConfig,
}

impl std::fmt::Debug for StoreDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDeps")
            .field("dispatchers", &self.dispatchers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
