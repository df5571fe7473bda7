use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{FieldOpsError, Result};
use crate::storage::entities::{EntityType, Record, SyncState, SYNC_OPERATION_RECORD_TYPE};

/// 同步操作使用的 HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

/// 发件箱操作状态机
///
/// ```text
/// pending ──> inFlight ──> completed
///    ^            │
///    │            ├──> failed-retryable ──> pending
///    │            └──> failed-terminal
///    └────────────────────────┘ (人工重试)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "inFlight")]
    InFlight,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed-retryable")]
    FailedRetryable,
    #[serde(rename = "failed-terminal")]
    FailedTerminal,
}

impl OperationStatus {
    /// 状态迁移是否合法
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Completed)
                | (InFlight, FailedRetryable)
                | (InFlight, FailedTerminal)
                | (InFlight, Pending)
                | (FailedRetryable, Pending)
                | (FailedTerminal, Pending)
        )
    }

    /// 是否仍在发件箱的活动集合中（待发送或发送中）
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            OperationStatus::Pending | OperationStatus::InFlight | OperationStatus::FailedRetryable
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "inFlight",
            OperationStatus::Completed => "completed",
            OperationStatus::FailedRetryable => "failed-retryable",
            OperationStatus::FailedTerminal => "failed-terminal",
        };
        f.write_str(s)
    }
}

/// 入队参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperationInput {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub method: HttpMethod,
    pub endpoint: String,
    pub payload: Value,
    /// 产生该操作的变更类型（如 update_status）
    #[serde(default)]
    pub kind: Option<String>,
}

/// 发件箱中的一条待同步操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    /// 入队序号，决定 FIFO 顺序
    pub seq: u64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub method: HttpMethod,
    pub endpoint: String,
    pub payload: Value,
    /// 客户端生成，同一逻辑变更的所有重试共用
    pub idempotency_key: String,
    pub attempts: u32,
    pub status: OperationStatus,
    pub created_at: i64,
    pub last_error: Option<String>,
    /// 退避后的最早可发送时间（UTC 毫秒）
    pub next_attempt_at: i64,
    #[serde(default)]
    pub kind: Option<String>,
}

impl SyncOperation {
    /// 由入队参数生成新操作，id 与幂等键各自随机生成
    pub fn from_input(input: SyncOperationInput, seq: u64, now_ms: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            entity_type: input.entity_type,
            entity_id: input.entity_id,
            method: input.method,
            endpoint: input.endpoint,
            payload: input.payload,
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            attempts: 0,
            status: OperationStatus::Pending,
            created_at: now_ms,
            last_error: None,
            next_attempt_at: now_ms,
            kind: input.kind,
        }
    }

    pub fn entity_key(&self) -> (EntityType, String) {
        (self.entity_type, self.entity_id.clone())
    }

    /// 执行状态迁移，非法迁移返回 InvalidOperation
    pub fn transition(&mut self, next: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FieldOpsError::InvalidOperation(format!(
                "同步操作 {} 非法状态迁移: {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn is_eligible(&self, now_ms: i64) -> bool {
        self.status == OperationStatus::Pending && self.next_attempt_at <= now_ms
    }

    pub fn to_record(&self) -> Result<Record> {
        let payload = serde_json::to_value(self)?;
        Ok(Record {
            record_type: SYNC_OPERATION_RECORD_TYPE.to_string(),
            id: self.id.clone(),
            payload,
            updated_at: self.created_at,
            sync_state: SyncState::Dirty,
        })
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        if record.record_type != SYNC_OPERATION_RECORD_TYPE {
            return Err(FieldOpsError::Serialization(format!(
                "记录 {} 不是同步操作: {}",
                record.id, record.record_type
            )));
        }
        Ok(serde_json::from_value(record.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn operation() -> SyncOperation {
        SyncOperation {
            id: "op-1".to_string(),
            seq: 1,
            entity_type: EntityType::Delivery,
            entity_id: "d-1".to_string(),
            method: HttpMethod::Put,
            endpoint: "/api/deliveries/d-1".to_string(),
            payload: json!({"status": "delivered"}),
            idempotency_key: "key-1".to_string(),
            attempts: 0,
            status: OperationStatus::Pending,
            created_at: 5,
            last_error: None,
            next_attempt_at: 0,
            kind: Some("update_status".to_string()),
        }
    }

    #[test]
    fn test_status_machine() {
        let mut op = operation();
        assert!(op.transition(OperationStatus::Completed).is_err());
        op.transition(OperationStatus::InFlight).unwrap();
        op.transition(OperationStatus::FailedRetryable).unwrap();
        op.transition(OperationStatus::Pending).unwrap();
        op.transition(OperationStatus::InFlight).unwrap();
        op.transition(OperationStatus::FailedTerminal).unwrap();
        assert!(op.transition(OperationStatus::InFlight).is_err());
        assert!(!op.status.is_outstanding());
    }

    #[test]
    fn test_record_conversion_keeps_wire_names() {
        let op = operation();
        let record = op.to_record().unwrap();
        assert_eq!(record.record_type, SYNC_OPERATION_RECORD_TYPE);
        assert_eq!(record.payload["idempotencyKey"], "key-1");
        assert_eq!(record.payload["status"], "pending");
        assert_eq!(record.payload["method"], "PUT");
        assert_eq!(SyncOperation::from_record(&record).unwrap(), op);

        let foreign = Record::new("delivery", "d-1", json!({}), 0);
        assert!(SyncOperation::from_record(&foreign).is_err());
    }
}
