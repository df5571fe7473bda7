//! KV 存储模块 - 基于 sled 的持久化 LocalStore
//!
//! - 每个命名 store 对应一个 sled Tree
//! - value 为 JSON 编码的 Record，单 key 写入原子
//! - 每次写入后 flush，保证进程重启后数据仍在

use async_trait::async_trait;
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FieldOpsError, Result};
use crate::storage::entities::{Record, StoreName};
use crate::storage::local_store::LocalStore;

/// 基于 sled 的 LocalStore
#[derive(Debug)]
pub struct SledLocalStore {
    base_path: PathBuf,
    db: Arc<Db>,
    trees: HashMap<StoreName, Tree>,
}

impl SledLocalStore {
    /// 打开（或创建）`<base_path>/kv` 下的 sled 数据库
    pub async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| FieldOpsError::Storage(format!("创建 KV 存储目录失败: {}", e)))?;

        // 旧实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    db_opt = Some(db);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            FieldOpsError::Storage(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let mut trees = HashMap::new();
        for store in StoreName::ALL {
            let tree = db
                .open_tree(store.as_str())
                .map_err(|e| FieldOpsError::Storage(format!("打开 store {} 失败: {}", store, e)))?;
            trees.insert(store, tree);
        }

        tracing::info!("本地存储已打开: {}", kv_path.display());

        Ok(Self {
            base_path,
            db: Arc::new(db),
            trees,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn tree(&self, store: StoreName) -> Result<&Tree> {
        self.trees
            .get(&store)
            .ok_or_else(|| FieldOpsError::Storage(format!("store 不存在: {}", store)))
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FieldOpsError::Storage(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for SledLocalStore {
    async fn get(&self, store: StoreName, id: &str) -> Result<Option<Record>> {
        let tree = self.tree(store)?;
        let result = tree
            .get(id.as_bytes())
            .map_err(|e| FieldOpsError::Storage(format!("读取记录失败: {}", e)))?;

        match result {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|e| FieldOpsError::Serialization(format!("反序列化记录失败: {}", e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, store: StoreName, record: &Record) -> Result<()> {
        let tree = self.tree(store)?;
        let bytes = serde_json::to_vec(record)
            .map_err(|e| FieldOpsError::Serialization(format!("序列化记录失败: {}", e)))?;

        tree.insert(record.id.as_bytes(), bytes)
            .map_err(|e| FieldOpsError::Storage(format!("写入记录失败: {}", e)))?;
        self.flush().await
    }

    async fn get_all(&self, store: StoreName) -> Result<Vec<Record>> {
        let tree = self.tree(store)?;
        let mut records = Vec::new();

        for item in tree.iter() {
            let (key, bytes) = item.map_err(|e| FieldOpsError::Storage(format!("遍历记录失败: {}", e)))?;
            match serde_json::from_slice::<Record>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        "跳过无法解析的记录 {}:{}: {}",
                        store,
                        String::from_utf8_lossy(&key),
                        e
                    );
                }
            }
        }

        Ok(records)
    }

    async fn delete(&self, store: StoreName, id: &str) -> Result<()> {
        let tree = self.tree(store)?;
        tree.remove(id.as_bytes())
            .map_err(|e| FieldOpsError::Storage(format!("删除记录失败: {}", e)))?;
        self.flush().await
    }
}
