//! 权限网关：根据角色、身份和记录计算可执行的变更
//!
//! 纯函数，不缓存；每次变更前重新计算。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::Record;

/// 用户角色
///
/// 未知角色字符串解析为 [`Role::Unknown`]，不授予任何权限
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    DeliveryBoy,
    Supervisor,
    Unknown(String),
}

impl Role {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "delivery_boy" => Role::DeliveryBoy,
            "supervisor" => Role::Supervisor,
            _ => Role::Unknown(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::DeliveryBoy => "delivery_boy",
            Role::Supervisor => "supervisor",
            Role::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Role::parse(&raw))
    }
}

/// 当前登录身份（由外部认证协作方提供）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub area_id: Option<String>,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            area_id: None,
            role,
        }
    }

    pub fn with_area(mut self, area_id: impl Into<String>) -> Self {
        self.area_id = Some(area_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub can_edit_status: bool,
    pub can_edit_location: bool,
    pub can_add_remark: bool,
    pub can_add_proof: bool,
}

impl CapabilitySet {
    pub const ALL: CapabilitySet = CapabilitySet {
        can_edit_status: true,
        can_edit_location: true,
        can_add_remark: true,
        can_add_proof: true,
    };

    pub const NONE: CapabilitySet = CapabilitySet {
        can_edit_status: false,
        can_edit_location: false,
        can_add_remark: false,
        can_add_proof: false,
    };

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::EditStatus => self.can_edit_status,
            Capability::EditLocation => self.can_edit_location,
            Capability::AddRemark => self.can_add_remark,
            Capability::AddProof => self.can_add_proof,
        }
    }
}

/// 单项能力，变更类型据此查询 [`CapabilitySet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    EditStatus,
    EditLocation,
    AddRemark,
    AddProof,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::EditStatus => "edit_status",
            Capability::EditLocation => "edit_location",
            Capability::AddRemark => "add_remark",
            Capability::AddProof => "add_proof",
        };
        f.write_str(s)
    }
}

fn same(expected: Option<&str>, actual: Option<&str>) -> bool {
    matches!((expected, actual), (Some(a), Some(b)) if a == b)
}

/// 计算 `identity` 在 `record` 上的能力集合
pub fn resolve(role: &Role, identity: &Identity, record: &Record) -> CapabilitySet {
    match role {
        Role::Admin => CapabilitySet::ALL,
        Role::DeliveryBoy => {
            if same(record.owner_id(), Some(identity.user_id.as_str())) {
                CapabilitySet::ALL
            } else {
                CapabilitySet::NONE
            }
        }
        Role::Supervisor => {
            let in_area = same(record.area_id(), identity.area_id.as_deref());
            CapabilitySet {
                can_edit_status: in_area,
                can_edit_location: false,
                can_add_remark: in_area,
                can_add_proof: in_area,
            }
        }
        Role::Unknown(_) => CapabilitySet::NONE,
    }
}
