//! 存储层
//!
//! - `kv`：sled 持久化 LocalStore
//! - `local_store`：LocalStore trait 与内存实现
//! - `records`：业务记录读写（乐观写、缓存回填）
//! - `queue`：发件箱
//! - `route_history` / `migrate`：SQLite 路线历史

pub mod entities;
pub mod kv;
pub mod local_store;
pub mod migrate;
pub mod queue;
pub mod records;
pub mod route_history;

pub use entities::{EntityType, Record, StoreName, SyncState};
pub use kv::SledLocalStore;
pub use local_store::{LocalStore, MemoryLocalStore};
pub use queue::{SyncQueue, SyncStats};
pub use records::{EntityGuard, RecordStore};
pub use route_history::{RouteHistoryEntry, RouteHistoryStore, StopTiming};
