//! 平台定位能力抽象

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::mpsc;

use crate::config::LocationConfig;
use crate::error::GeolocationError;
use crate::location::LocationSample;

/// 定位请求参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    /// 超时（毫秒）
    pub timeout: u64,
    pub maximum_age: u64,
}

impl From<&LocationConfig> for PositionOptions {
    fn from(config: &LocationConfig) -> Self {
        Self {
            enable_high_accuracy: config.enable_high_accuracy,
            timeout: config.timeout_secs * 1_000,
            maximum_age: config.maximum_age_ms,
        }
    }
}

/// 平台返回的位置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    /// 平台未提供时由采样器用时钟补齐
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Position {
    pub fn into_sample(self, fallback_timestamp: i64) -> LocationSample {
        LocationSample {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            speed: self.speed,
            heading: self.heading,
            timestamp: self.timestamp.unwrap_or(fallback_timestamp),
        }
    }
}

pub type PositionResult = std::result::Result<Position, GeolocationError>;

/// 宿主平台实现的定位源
///
/// `watch_position` 返回的 channel 关闭即表示平台停止推送；
/// 丢弃接收端即取消订阅。
#[async_trait]
pub trait GeolocationSource: Debug + Send + Sync {
    async fn get_current_position(&self, options: PositionOptions) -> PositionResult;

    fn watch_position(&self, options: PositionOptions) -> mpsc::Receiver<PositionResult>;
}
