use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 定位错误：权限、超时、平台不可用。定位失败后追踪停止，不会自动重试。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GeolocationError {
    #[error("Geolocation permission denied")]
    PermissionDenied,
    #[error("Geolocation timed out after {0} ms")]
    Timeout(u64),
    #[error("Geolocation unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum FieldOpsError {
    /// 权限网关拒绝，发生在任何写入之前，永不重试、永不上送
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// 变更请求格式错误，本地拒绝
    #[error("Validation error: {0}")]
    Validation(String),
    /// 传输层错误（连接失败、超时等）
    #[error("Network error: {0}")]
    Network(String),
    /// 服务端返回非 2xx
    #[error("Remote error [{status}]: {message}")]
    Remote { status: u16, message: String },
    /// 401，转交外部认证协作方处理
    #[error("Authentication expired")]
    AuthExpired,
    #[error(transparent)]
    Geolocation(#[from] GeolocationError),
    /// 本地存储不可用（降级模式的触发条件）
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Not connected")]
    NotConnected,
}

impl From<sled::Error> for FieldOpsError {
    fn from(error: sled::Error) -> Self {
        FieldOpsError::Storage(error.to_string())
    }
}

impl From<rusqlite::Error> for FieldOpsError {
    fn from(error: rusqlite::Error) -> Self {
        FieldOpsError::Database(error.to_string())
    }
}

impl From<serde_json::Error> for FieldOpsError {
    fn from(error: serde_json::Error) -> Self {
        FieldOpsError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FieldOpsError {
    fn from(error: std::io::Error) -> Self {
        FieldOpsError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for FieldOpsError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            if status.as_u16() == 401 {
                return FieldOpsError::AuthExpired;
            }
            return FieldOpsError::Remote {
                status: status.as_u16(),
                message: error.to_string(),
            };
        }
        FieldOpsError::Network(error.to_string())
    }
}

impl FieldOpsError {
    /// 事件与日志中使用的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            FieldOpsError::PermissionDenied(_) => "permission_denied",
            FieldOpsError::Validation(_) => "validation_error",
            FieldOpsError::Network(_) => "network_error",
            FieldOpsError::Remote { .. } => "remote_error",
            FieldOpsError::AuthExpired => "auth_expired",
            FieldOpsError::Geolocation(_) => "geolocation_error",
            FieldOpsError::Storage(_) => "storage_error",
            FieldOpsError::Database(_) => "database_error",
            FieldOpsError::Serialization(_) => "serialization_error",
            FieldOpsError::NotFound(_) => "not_found",
            FieldOpsError::InvalidOperation(_) => "invalid_operation",
            FieldOpsError::Config(_) => "config_error",
            FieldOpsError::IO(_) => "io_error",
            FieldOpsError::NotConnected => "not_connected",
        }
    }
}

pub type Result<T> = std::result::Result<T, FieldOpsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geolocation_error_converts() {
        let err: FieldOpsError = GeolocationError::Timeout(30_000).into();
        assert_eq!(err.code(), "geolocation_error");
        assert!(err.to_string().contains("30000"));
    }

    #[test]
    fn test_remote_error_display() {
        let err = FieldOpsError::Remote {
            status: 503,
            message: "maintenance".to_string(),
        };
        assert_eq!(err.to_string(), "Remote error [503]: maintenance");
        assert_eq!(err.code(), "remote_error");
    }
}
