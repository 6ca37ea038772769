//! Storage collaborator for request history and stub match history.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// Storage operations the core needs from a request-history backend.
///
/// Implementations may be in-memory or externally persisted. From the
/// engine's point of view the store is append-only: every saved record must
/// be retrievable afterwards.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn save_request(&self, record: Value);

    async fn get_requests(&self) -> Vec<Value>;

    async fn get_count(&self) -> usize;

    async fn delete_requests(&self);
}

/// Constructs a fresh store for each stub's match history.
pub type StoreFactory = Arc<dyn Fn() -> Arc<dyn RequestStore> + Send + Sync>;

/// Default factory producing [`InMemoryRequestStore`] instances.
pub fn in_memory_factory() -> StoreFactory {
    Arc::new(|| Arc::new(InMemoryRequestStore::new()) as Arc<dyn RequestStore>)
}

/// Vector-backed store.
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    records: RwLock<Vec<Value>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn save_request(&self, record: Value) {
        self.records.write().push(record);
    }

    async fn get_requests(&self) -> Vec<Value> {
        self.records.read().clone()
    }

    async fn get_count(&self) -> usize {
        self.records.read().len()
    }

    async fn delete_requests(&self) {
        self.records.write().clear();
    }
}
