//! 配送单变更请求
//!
//! 每种变更对应一项所需能力、一个 REST 端点，以及对本地记录 payload 的乐观合并方式。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{FieldOpsError, Result};
use crate::location::LocationSample;
use crate::permission::Capability;
use crate::storage::queue::{HttpMethod, SyncOperation, SyncOperationInput};
use crate::storage::{EntityType, Record};

const MAX_STATUS_LEN: usize = 64;
const MAX_REMARK_LEN: usize = 2_000;
const MAX_REFERENCE_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationKind {
    UpdateStatus { status: String },
    UpdateLocation { sample: LocationSample },
    AddRemark { text: String },
    /// 交付凭证（图片等已上传资源的引用）
    AddProof { reference: String },
}

fn require_text(field: &str, value: &str, max_len: usize) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FieldOpsError::Validation(format!("{} 不能为空", field)));
    }
    if trimmed.chars().count() > max_len {
        return Err(FieldOpsError::Validation(format!("{} 超过 {} 个字符", field, max_len)));
    }
    Ok(())
}

fn push_entry(payload: &mut Value, field: &str, entry: Value) {
    if !payload.is_object() {
        *payload = json!({});
    }
    if let Some(map) = payload.as_object_mut() {
        let list = map.entry(field).or_insert_with(|| json!([]));
        match list.as_array_mut() {
            Some(items) => items.push(entry),
            None => *list = json!([entry]),
        }
    }
}

fn set_field(payload: &mut Value, field: &str, value: Value) {
    if !payload.is_object() {
        *payload = json!({});
    }
    if let Some(map) = payload.as_object_mut() {
        map.insert(field.to_string(), value);
    }
}

impl MutationKind {
    pub fn name(&self) -> &'static str {
        match self {
            MutationKind::UpdateStatus { .. } => "update_status",
            MutationKind::UpdateLocation { .. } => "update_location",
            MutationKind::AddRemark { .. } => "add_remark",
            MutationKind::AddProof { .. } => "add_proof",
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            MutationKind::UpdateStatus { .. } => Capability::EditStatus,
            MutationKind::UpdateLocation { .. } => Capability::EditLocation,
            MutationKind::AddRemark { .. } => Capability::AddRemark,
            MutationKind::AddProof { .. } => Capability::AddProof,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            MutationKind::UpdateStatus { status } => {
                require_text("status", status, MAX_STATUS_LEN)?;
                if status.trim().chars().any(char::is_whitespace) {
                    return Err(FieldOpsError::Validation(format!("非法状态值: {:?}", status)));
                }
                Ok(())
            }
            MutationKind::UpdateLocation { sample } => {
                if !sample.point().is_valid() {
                    return Err(FieldOpsError::Validation(format!(
                        "非法坐标: ({}, {})",
                        sample.latitude, sample.longitude
                    )));
                }
                if !sample.accuracy.is_finite() || sample.accuracy < 0.0 {
                    return Err(FieldOpsError::Validation(format!("非法精度: {}", sample.accuracy)));
                }
                Ok(())
            }
            MutationKind::AddRemark { text } => require_text("remark", text, MAX_REMARK_LEN),
            MutationKind::AddProof { reference } => require_text("proof reference", reference, MAX_REFERENCE_LEN),
        }
    }

    /// 请求方法与端点
    pub fn endpoint(&self, delivery_id: &str) -> (HttpMethod, String) {
        match self {
            MutationKind::UpdateStatus { .. } => (HttpMethod::Put, format!("/api/deliveries/{}", delivery_id)),
            MutationKind::UpdateLocation { .. } => (HttpMethod::Put, format!("/api/locations/{}", delivery_id)),
            MutationKind::AddRemark { .. } => (HttpMethod::Post, format!("/api/remarks/{}", delivery_id)),
            MutationKind::AddProof { .. } => (HttpMethod::Post, format!("/api/proofs/{}", delivery_id)),
        }
    }

    /// 请求体
    pub fn body(&self, now_ms: i64) -> Value {
        match self {
            MutationKind::UpdateStatus { status } => json!({ "status": status.trim(), "updatedAt": now_ms }),
            MutationKind::UpdateLocation { sample } => json!({
                "latitude": sample.latitude,
                "longitude": sample.longitude,
                "accuracy": sample.accuracy,
                "speed": sample.speed,
                "heading": sample.heading,
                "timestamp": sample.timestamp,
            }),
            MutationKind::AddRemark { text } => json!({ "text": text.trim(), "createdAt": now_ms }),
            MutationKind::AddProof { reference } => json!({ "reference": reference.trim(), "createdAt": now_ms }),
        }
    }

    /// 把变更合并进本地记录的 payload
    pub fn apply_to(&self, payload: &mut Value, now_ms: i64) {
        match self {
            MutationKind::UpdateStatus { status } => {
                set_field(payload, "status", json!(status.trim()));
            }
            MutationKind::UpdateLocation { .. } => {
                set_field(payload, "lastLocation", self.body(now_ms));
            }
            MutationKind::AddRemark { .. } => push_entry(payload, "remarks", self.body(now_ms)),
            MutationKind::AddProof { .. } => push_entry(payload, "proofs", self.body(now_ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub delivery_id: String,
    #[serde(flatten)]
    pub kind: MutationKind,
}

impl MutationRequest {
    pub fn new(delivery_id: impl Into<String>, kind: MutationKind) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            kind,
        }
    }

    pub fn update_status(delivery_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(delivery_id, MutationKind::UpdateStatus { status: status.into() })
    }

    pub fn update_location(delivery_id: impl Into<String>, sample: LocationSample) -> Self {
        Self::new(delivery_id, MutationKind::UpdateLocation { sample })
    }

    pub fn add_remark(delivery_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(delivery_id, MutationKind::AddRemark { text: text.into() })
    }

    pub fn add_proof(delivery_id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::new(delivery_id, MutationKind::AddProof { reference: reference.into() })
    }

    pub fn validate(&self) -> Result<()> {
        let id = self.delivery_id.as_str();
        if id.trim().is_empty() {
            return Err(FieldOpsError::Validation("deliveryId 不能为空".to_string()));
        }
        // id 原样拼进端点路径，也是本地记录的键
        if id != id.trim() || id.contains(['/', '?', '#']) {
            return Err(FieldOpsError::Validation(format!("非法 deliveryId: {:?}", self.delivery_id)));
        }
        self.kind.validate()
    }

    pub fn to_operation_input(&self, now_ms: i64) -> SyncOperationInput {
        let (method, endpoint) = self.kind.endpoint(&self.delivery_id);
        SyncOperationInput {
            entity_type: EntityType::Delivery,
            entity_id: self.delivery_id.clone(),
            method,
            endpoint,
            payload: self.kind.body(now_ms),
            kind: Some(self.kind.name().to_string()),
        }
    }

    /// 乐观写之后的记录（sync_state 由 RecordStore 设置）
    pub fn apply(&self, mut record: Record, now_ms: i64) -> Record {
        self.kind.apply_to(&mut record.payload, now_ms);
        record
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// 已乐观写入本地并进入发件箱
    Queued { operation: SyncOperation },
    /// 降级模式：已直接发送到服务端
    Applied { response: Option<Value> },
}

impl MutationOutcome {
    pub fn operation(&self) -> Option<&SyncOperation> {
        match self {
            MutationOutcome::Queued { operation } => Some(operation),
            MutationOutcome::Applied { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_per_kind() {
        let sample = LocationSample::new(28.7, 77.1, 5.0, 1);
        let cases = [
            (MutationRequest::update_status("d-1", "picked_up"), HttpMethod::Put, "/api/deliveries/d-1"),
            (MutationRequest::update_location("d-1", sample), HttpMethod::Put, "/api/locations/d-1"),
            (MutationRequest::add_remark("d-1", "gate closed"), HttpMethod::Post, "/api/remarks/d-1"),
            (MutationRequest::add_proof("d-1", "img-42"), HttpMethod::Post, "/api/proofs/d-1"),
        ];
        for (request, method, endpoint) in cases {
            let input = request.to_operation_input(10);
            assert_eq!(input.method, method);
            assert_eq!(input.endpoint, endpoint);
            assert_eq!(input.entity_type, EntityType::Delivery);
            assert_eq!(input.kind.as_deref(), Some(request.kind.name()));
        }
    }

    #[test]
    fn test_validation_rejects_malformed_requests() {
        assert!(MutationRequest::update_status("", "picked_up").validate().is_err());
        assert!(MutationRequest::update_status("a/b", "picked_up").validate().is_err());
        assert!(MutationRequest::update_status("   ", "picked_up").validate().is_err());
        assert!(MutationRequest::update_status(" d-1", "picked_up").validate().is_err());
        assert!(MutationRequest::update_status("d-1\n", "picked_up").validate().is_err());
        assert!(MutationRequest::update_status("d-1?x=1", "picked_up").validate().is_err());
        assert!(MutationRequest::update_status("d-1#top", "picked_up").validate().is_err());
        assert!(MutationRequest::update_status("d-1", "  ").validate().is_err());
        assert!(MutationRequest::update_status("d-1", "picked up").validate().is_err());
        assert!(MutationRequest::add_remark("d-1", "x".repeat(MAX_REMARK_LEN + 1)).validate().is_err());
        assert!(MutationRequest::update_location("d-1", LocationSample::new(91.0, 0.0, 5.0, 1))
            .validate()
            .is_err());
        assert!(MutationRequest::update_location("d-1", LocationSample::new(1.0, 0.0, f64::NAN, 1))
            .validate()
            .is_err());
        assert!(MutationRequest::add_proof("d-1", "img-1").validate().is_ok());
    }

    #[test]
    fn test_apply_merges_into_payload() {
        let record = Record::entity(EntityType::Delivery, "d-1", json!({"status": "assigned", "ownerId": "u-1"}), 0);
        let record = MutationRequest::update_status("d-1", " picked_up ").apply(record, 5);
        let record = MutationRequest::add_remark("d-1", "left at door").apply(record, 6);
        let record = MutationRequest::add_remark("d-1", "rang twice").apply(record, 7);

        assert_eq!(record.payload["status"], "picked_up");
        assert_eq!(record.payload["ownerId"], "u-1");
        let remarks = record.payload["remarks"].as_array().unwrap();
        assert_eq!(remarks.len(), 2);
        assert_eq!(remarks[1]["text"], "rang twice");
        assert_eq!(remarks[1]["createdAt"], 7);
    }

    #[test]
    fn test_request_wire_shape() {
        let request: MutationRequest =
            serde_json::from_value(json!({"deliveryId": "d-9", "kind": "add_remark", "text": "hi"})).unwrap();
        assert_eq!(request, MutationRequest::add_remark("d-9", "hi"));
    }
}
