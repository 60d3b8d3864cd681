use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use uuid::Uuid;

use parley_types::model::{Message, MessageBody};

use crate::{MessageStore, StoreError, StoreResult};

/// In-process implementation of the durable-store contract. Backs the
/// test suites and local single-process runs; the change feed has the
/// same shape as the HTTP client's so consumers cannot tell them apart.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

struct MemoryStoreInner {
    records: RwLock<BTreeMap<String, Message>>,
    version_tx: watch::Sender<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(MemoryStoreInner {
                records: RwLock::new(BTreeMap::new()),
                version_tx,
            }),
        }
    }

    fn notify(&self) {
        self.inner.version_tx.send_modify(|version| *version += 1);
    }

    async fn mutate<F>(&self, key: &str, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Message),
    {
        {
            let mut records = self.inner.records.write().await;
            let record = records
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            apply(record);
        }
        self.notify();
        Ok(())
    }
}

impl MessageStore for MemoryStore {
    async fn append(&self, message: Message) -> StoreResult<String> {
        let key = Uuid::new_v4().to_string();
        self.inner
            .records
            .write()
            .await
            .insert(key.clone(), message);
        self.notify();
        Ok(key)
    }

    async fn snapshot(&self) -> StoreResult<BTreeMap<String, Message>> {
        Ok(self.inner.records.read().await.clone())
    }

    async fn set_seen(&self, key: &str) -> StoreResult<()> {
        self.mutate(key, |record| record.seen = true).await
    }

    async fn set_body(&self, key: &str, body: MessageBody) -> StoreResult<()> {
        self.mutate(key, |record| record.body = body).await
    }

    async fn set_reactions(
        &self,
        key: &str,
        kind: &str,
        users: BTreeSet<String>,
    ) -> StoreResult<()> {
        self.mutate(key, |record| {
            if users.is_empty() {
                record.reactions.remove(kind);
            } else {
                record.reactions.insert(kind.to_string(), users);
            }
        })
        .await
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version_tx.subscribe()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
