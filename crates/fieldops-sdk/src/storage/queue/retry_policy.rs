use serde::{Deserialize, Serialize};

use crate::error::FieldOpsError;

/// 同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 可重试
    NetworkUnavailable,
    /// 服务端 5xx - 可重试
    ServerError(u16),
    /// 限流或请求超时（429 / 408）- 可重试
    RateLimited(u16),
    /// 认证过期 - 由引擎单独处理，不消耗重试次数
    AuthExpired,
    /// 其他 4xx：服务端拒绝，不重试
    Rejected(u16),
    /// 未知错误
    Unknown(String),
}

impl FailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::NetworkTimeout => true,
            FailureReason::NetworkUnavailable => true,
            FailureReason::ServerError(_) => true,
            FailureReason::RateLimited(_) => true,
            FailureReason::AuthExpired => true,
            FailureReason::Rejected(_) => false,
            // 保守策略：未知错误可重试
            FailureReason::Unknown(_) => true,
        }
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 => FailureReason::AuthExpired,
            408 | 429 => FailureReason::RateLimited(status),
            500..=599 => FailureReason::ServerError(status),
            _ => FailureReason::Rejected(status),
        }
    }
}

impl From<&FieldOpsError> for FailureReason {
    fn from(error: &FieldOpsError) -> Self {
        match error {
            FieldOpsError::Network(msg) => {
                let msg = msg.to_lowercase();
                if msg.contains("timeout") || msg.contains("timed out") {
                    FailureReason::NetworkTimeout
                } else {
                    FailureReason::NetworkUnavailable
                }
            }
            FieldOpsError::NotConnected => FailureReason::NetworkUnavailable,
            FieldOpsError::Remote { status, .. } => FailureReason::from_status(*status),
            FieldOpsError::AuthExpired => FailureReason::AuthExpired,
            FieldOpsError::Validation(_) | FieldOpsError::PermissionDenied(_) => FailureReason::Rejected(400),
            other => FailureReason::Unknown(other.to_string()),
        }
    }
}

/// 重试策略配置
///
/// 第 n 次失败后的等待：`base * backoff_factor^(n-1)`，封顶 `max_delay_ms`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数，达到后进入 failed-terminal
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)，0 表示严格按公式
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5分钟
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// 已失败 `attempts` 次后的退避时长（毫秒），attempts 从 1 开始
    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1) as i32;
        let delay = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64);

        let jittered = if self.jitter_factor > 0.0 {
            let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
            (capped + jitter).clamp(0.0, self.max_delay_ms as f64)
        } else {
            capped
        };
        jittered as u64
    }

    /// 计算下次可发送时间戳（毫秒）
    pub fn next_attempt_at(&self, now_ms: i64, attempts: u32) -> i64 {
        now_ms + self.backoff_delay_ms(attempts) as i64
    }

    /// 检查是否应该重试（attempts 为本次失败后的累计次数）
    pub fn should_retry(&self, attempts: u32, reason: &FailureReason) -> bool {
        attempts < self.max_attempts && reason.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_retryable() {
        assert!(FailureReason::NetworkTimeout.is_retryable());
        assert!(FailureReason::NetworkUnavailable.is_retryable());
        assert!(FailureReason::from_status(503).is_retryable());
        assert!(FailureReason::from_status(429).is_retryable());
        assert!(!FailureReason::from_status(404).is_retryable());
        assert!(!FailureReason::from_status(422).is_retryable());
        assert_eq!(FailureReason::from_status(401), FailureReason::AuthExpired);
    }

    #[test]
    fn test_failure_reason_from_error() {
        let err = FieldOpsError::Network("operation timed out".to_string());
        assert_eq!(FailureReason::from(&err), FailureReason::NetworkTimeout);
        let err = FieldOpsError::Network("connection refused".to_string());
        assert_eq!(FailureReason::from(&err), FailureReason::NetworkUnavailable);
        let err = FieldOpsError::Remote { status: 500, message: String::new() };
        assert_eq!(FailureReason::from(&err), FailureReason::ServerError(500));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        };
        assert_eq!(policy.backoff_delay_ms(1), 1_000);
        assert_eq!(policy.backoff_delay_ms(2), 2_000);
        assert_eq!(policy.backoff_delay_ms(3), 4_000);
        assert_eq!(policy.backoff_delay_ms(4), 5_000);
        assert_eq!(policy.backoff_delay_ms(9), 5_000);
        assert_eq!(policy.next_attempt_at(100, 2), 2_100);
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            max_delay_ms: 3_000,
            ..RetryPolicy::default()
        };
        for attempts in 1..8 {
            assert!(policy.backoff_delay_ms(attempts) <= 3_000);
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, &FailureReason::NetworkTimeout));
        assert!(!policy.should_retry(5, &FailureReason::NetworkTimeout));
        assert!(!policy.should_retry(1, &FailureReason::Rejected(400)));
    }
}
