//! 业务记录访问：在 LocalStore 之上按 (EntityType, id) 读写
//!
//! 同一实体的读-改-写都在实体锁内完成。乐观写与入队必须在同一把锁内，
//! 同步引擎回写 sync_state 时也持锁并在锁内重新判断是否还有未完成操作。

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{FieldOpsError, Result};
use crate::storage::entities::{EntityType, Record, SyncState};
use crate::storage::local_store::LocalStore;
use crate::utils::Clock;

type EntityKey = (EntityType, String);

#[derive(Debug, Default)]
struct EntityLocks {
    locks: Mutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>,
}

/// 实体写锁，drop 时释放；没有等待者时回收条目
#[derive(Debug)]
pub struct EntityGuard {
    key: EntityKey,
    locks: Arc<EntityLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl EntityGuard {
    pub fn entity_type(&self) -> EntityType {
        self.key.0
    }

    pub fn id(&self) -> &str {
        &self.key.1
    }

    fn covers(&self, record: &Record) -> Result<EntityType> {
        match record.entity_type() {
            Some(entity_type) if entity_type == self.key.0 && record.id == self.key.1 => Ok(entity_type),
            _ => Err(FieldOpsError::InvalidOperation(format!(
                "记录 {}:{} 不在当前实体锁 {}:{} 内",
                record.record_type, record.id, self.key.0, self.key.1
            ))),
        }
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<EntityLocks>,
}

impl RecordStore {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: Arc::new(EntityLocks::default()),
        }
    }

    /// 获取实体写锁
    pub async fn lock_entity(&self, entity_type: EntityType, id: &str) -> EntityGuard {
        let key = (entity_type, id.to_string());
        let lock = self
            .locks
            .locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        EntityGuard {
            key,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>> {
        self.store.get(entity_type.store(), id).await
    }

    pub async fn get_all(&self, entity_type: EntityType) -> Result<Vec<Record>> {
        self.store.get_all(entity_type.store()).await
    }

    /// 写入从服务端拉取的记录；本地存在未同步变更时保留本地版本
    pub async fn cache_remote(&self, entity_type: EntityType, id: &str, payload: Value) -> Result<Record> {
        let guard = self.lock_entity(entity_type, id).await;
        self.cache_remote_locked(&guard, payload).await
    }

    pub async fn cache_remote_locked(&self, guard: &EntityGuard, payload: Value) -> Result<Record> {
        let (entity_type, id) = (guard.entity_type(), guard.id());
        if let Some(existing) = self.get(entity_type, id).await? {
            if existing.sync_state != SyncState::Synced {
                debug!("保留本地未同步记录 {}:{}", entity_type, id);
                return Ok(existing);
            }
        }
        let record = Record::entity(entity_type, id, payload, self.clock.now_ms());
        self.store.put(entity_type.store(), &record).await?;
        Ok(record)
    }

    /// 乐观写：更新 payload 并标记为 dirty
    pub async fn write_optimistic(&self, guard: &EntityGuard, mut record: Record) -> Result<Record> {
        let entity_type = guard.covers(&record)?;
        record.updated_at = self.clock.now_ms();
        record.sync_state = SyncState::Dirty;
        self.store.put(entity_type.store(), &record).await?;
        Ok(record)
    }

    /// 原样写回一条记录（乐观写失败后的回滚）
    pub async fn restore(&self, guard: &EntityGuard, record: &Record) -> Result<()> {
        let entity_type = guard.covers(record)?;
        self.store.put(entity_type.store(), record).await
    }

    /// 更新同步状态；记录不存在时忽略（返回 None）
    pub async fn set_sync_state(
        &self,
        entity_type: EntityType,
        id: &str,
        state: SyncState,
    ) -> Result<Option<Record>> {
        self.settle_sync_state(entity_type, id, || state).await
    }

    /// 在实体锁内决定并写入同步状态，只改 sync_state 字段
    pub async fn settle_sync_state<F>(&self, entity_type: EntityType, id: &str, decide: F) -> Result<Option<Record>>
    where
        F: FnOnce() -> SyncState + Send,
    {
        let _guard = self.lock_entity(entity_type, id).await;
        let Some(mut record) = self.get(entity_type, id).await? else {
            return Ok(None);
        };
        let state = decide();
        if record.sync_state == state {
            return Ok(Some(record));
        }
        record.sync_state = state;
        self.store.put(entity_type.store(), &record).await?;
        debug!("记录 {}:{} 同步状态 -> {:?}", entity_type, id, state);
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local_store::MemoryLocalStore;
    use crate::utils::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn record_store() -> RecordStore {
        RecordStore::new(Arc::new(MemoryLocalStore::new()), Arc::new(ManualClock::new(100)))
    }

    #[tokio::test]
    async fn test_cache_remote_keeps_dirty_local_copy() {
        let records = record_store();
        let cached = records
            .cache_remote(EntityType::Delivery, "d-1", json!({"status": "assigned"}))
            .await
            .unwrap();
        assert_eq!(cached.sync_state, SyncState::Synced);

        let mut local = cached.clone();
        local.payload = json!({"status": "picked_up"});
        {
            let guard = records.lock_entity(EntityType::Delivery, "d-1").await;
            records.write_optimistic(&guard, local).await.unwrap();
        }

        let after = records
            .cache_remote(EntityType::Delivery, "d-1", json!({"status": "assigned"}))
            .await
            .unwrap();
        assert_eq!(after.payload["status"], "picked_up");
        assert_eq!(after.sync_state, SyncState::Dirty);
    }

    #[tokio::test]
    async fn test_set_sync_state_ignores_missing_record() {
        let records = record_store();
        let result = records
            .set_sync_state(EntityType::Order, "missing", SyncState::Synced)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_write_outside_guard_entity_is_rejected() {
        let records = record_store();
        let guard = records.lock_entity(EntityType::Delivery, "d-1").await;
        let other = Record::entity(EntityType::Delivery, "d-2", json!({}), 0);
        assert!(matches!(
            records.write_optimistic(&guard, other).await,
            Err(FieldOpsError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_state_update_waits_for_entity_lock_and_keeps_payload() {
        let records = record_store();
        records
            .cache_remote(EntityType::Delivery, "d-1", json!({"status": "assigned"}))
            .await
            .unwrap();

        let guard = records.lock_entity(EntityType::Delivery, "d-1").await;
        let settling = {
            let records = records.clone();
            tokio::spawn(async move {
                records
                    .settle_sync_state(EntityType::Delivery, "d-1", || SyncState::Synced)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!settling.is_finished());

        let mut local = records.get(EntityType::Delivery, "d-1").await.unwrap().unwrap();
        local.payload = json!({"status": "delivered"});
        records.write_optimistic(&guard, local).await.unwrap();
        drop(guard);

        let settled = settling.await.unwrap().unwrap().unwrap();
        assert_eq!(settled.payload["status"], "delivered");
        assert_eq!(settled.sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_entity_locks_are_reclaimed() {
        let records = record_store();
        {
            let _a = records.lock_entity(EntityType::Delivery, "d-1").await;
            let _b = records.lock_entity(EntityType::Delivery, "d-2").await;
            assert_eq!(records.locks.locks.lock().len(), 2);
        }
        assert!(records.locks.locks.lock().is_empty());
    }
}
