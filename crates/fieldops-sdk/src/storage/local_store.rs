//! LocalStore 抽象：按 store 名 + id 存取记录
//!
//! 单个 key 的写入是原子的；跨 store 不保证事务（同步操作重放是幂等的）。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use crate::error::Result;
use crate::storage::entities::{Record, StoreName};

#[async_trait]
pub trait LocalStore: Debug + Send + Sync {
    async fn get(&self, store: StoreName, id: &str) -> Result<Option<Record>>;

    async fn put(&self, store: StoreName, record: &Record) -> Result<()>;

    async fn get_all(&self, store: StoreName) -> Result<Vec<Record>>;

    async fn delete(&self, store: StoreName, id: &str) -> Result<()>;
}

/// 内存实现（不持久化，用于测试和临时宿主）
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    stores: RwLock<HashMap<StoreName, BTreeMap<String, Record>>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, store: StoreName, id: &str) -> Result<Option<Record>> {
        let stores = self.stores.read();
        Ok(stores.get(&store).and_then(|s| s.get(id)).cloned())
    }

    async fn put(&self, store: StoreName, record: &Record) -> Result<()> {
        let mut stores = self.stores.write();
        stores
            .entry(store)
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_all(&self, store: StoreName) -> Result<Vec<Record>> {
        let stores = self.stores.read();
        Ok(stores
            .get(&store)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, store: StoreName, id: &str) -> Result<()> {
        let mut stores = self.stores.write();
        if let Some(s) = stores.get_mut(&store) {
            s.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_isolates_stores() {
        let store = MemoryLocalStore::new();
        let record = Record::new("delivery", "d-1", json!({"status": "assigned"}), 1);
        store.put(StoreName::Deliveries, &record).await.unwrap();

        assert_eq!(store.get(StoreName::Deliveries, "d-1").await.unwrap(), Some(record));
        assert!(store.get(StoreName::Orders, "d-1").await.unwrap().is_none());
        assert_eq!(store.get_all(StoreName::Deliveries).await.unwrap().len(), 1);

        store.delete(StoreName::Deliveries, "d-1").await.unwrap();
        assert!(store.get_all(StoreName::Deliveries).await.unwrap().is_empty());
    }
}
