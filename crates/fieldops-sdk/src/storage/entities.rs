//! 本地持久化实体定义

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 业务实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Delivery,
    Customer,
    Order,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Delivery => "delivery",
            EntityType::Customer => "customer",
            EntityType::Order => "order",
        }
    }

    /// 实体所在的本地 store
    pub fn store(&self) -> StoreName {
        match self {
            EntityType::Delivery => StoreName::Deliveries,
            EntityType::Customer => StoreName::Customers,
            EntityType::Order => StoreName::Orders,
        }
    }

    /// REST 资源路径段：/api/<resource>/<id>
    pub fn resource(&self) -> &'static str {
        self.store().as_str()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "delivery" => Some(EntityType::Delivery),
            "customer" => Some(EntityType::Customer),
            "order" => Some(EntityType::Order),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 本地命名 store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreName {
    #[serde(rename = "deliveries")]
    Deliveries,
    #[serde(rename = "customers")]
    Customers,
    #[serde(rename = "orders")]
    Orders,
    #[serde(rename = "syncQueue")]
    SyncQueue,
}

impl StoreName {
    pub const ALL: [StoreName; 4] = [
        StoreName::Deliveries,
        StoreName::Customers,
        StoreName::Orders,
        StoreName::SyncQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Deliveries => "deliveries",
            StoreName::Customers => "customers",
            StoreName::Orders => "orders",
            StoreName::SyncQueue => "syncQueue",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 记录同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// 与服务端一致，没有待发送的操作
    Synced,
    /// 存在本地未确认的变更
    Dirty,
    /// 有操作正在发送
    Syncing,
}

/// syncQueue store 中记录的类型名
pub const SYNC_OPERATION_RECORD_TYPE: &str = "sync_operation";

/// 本地记录，(type, id) 唯一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(rename = "type")]
    pub record_type: String,
    pub id: String,
    pub payload: Value,
    /// 最后更新时间（UTC 毫秒）
    pub updated_at: i64,
    pub sync_state: SyncState,
}

impl Record {
    pub fn new(record_type: impl Into<String>, id: impl Into<String>, payload: Value, now_ms: i64) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
            payload,
            updated_at: now_ms,
            sync_state: SyncState::Synced,
        }
    }

    pub fn entity(entity_type: EntityType, id: impl Into<String>, payload: Value, now_ms: i64) -> Self {
        Self::new(entity_type.as_str(), id, payload, now_ms)
    }

    pub fn entity_type(&self) -> Option<EntityType> {
        EntityType::parse(&self.record_type)
    }

    /// 记录归属的配送员（payload.ownerId）
    pub fn owner_id(&self) -> Option<&str> {
        self.payload_str("ownerId")
    }

    /// 记录所属片区（payload.areaId）
    pub fn area_id(&self) -> Option<&str> {
        self.payload_str("areaId")
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_serializes_with_wire_names() {
        let record = Record::entity(EntityType::Delivery, "d-1", json!({"ownerId": "u-1"}), 42);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "delivery");
        assert_eq!(value["updatedAt"], 42);
        assert_eq!(value["syncState"], "synced");
        assert_eq!(record.owner_id(), Some("u-1"));
        assert_eq!(record.area_id(), None);
    }

    #[test]
    fn test_store_names() {
        assert_eq!(EntityType::Delivery.resource(), "deliveries");
        assert_eq!(StoreName::SyncQueue.as_str(), "syncQueue");
        assert_eq!(serde_json::to_value(StoreName::SyncQueue).unwrap(), "syncQueue");
        assert_eq!(EntityType::parse("order"), Some(EntityType::Order));
        assert_eq!(EntityType::parse("wallet"), None);
    }
}
