//! SDK 配置
//!
//! 所有字段都有默认值，宿主可以用 [`FieldOpsConfigBuilder`] 逐项覆盖，
//! 也可以用 [`FieldOpsConfig::from_json_str`] 读取 JSON 配置（缺省字段取默认值）。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FieldOpsError, Result};
use crate::storage::queue::RetryPolicy;

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 最大尝试次数，达到后操作进入 failed-terminal
    pub max_attempts: u32,
    /// 基础退避延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大退避延迟（毫秒）
    pub max_delay_ms: u64,
    /// 一次 flush 中并发发送的实体数
    pub max_concurrency: usize,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 在线时入队后立即触发 flush
    pub auto_flush: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            max_concurrency: 4,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            auto_flush: true,
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            ..RetryPolicy::default()
        }
    }
}

/// 定位配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// 精度差于该值（米）的采样被丢弃
    pub max_accuracy_meters: f64,
    /// 单次定位超时（秒）
    pub timeout_secs: u64,
    pub enable_high_accuracy: bool,
    /// 可接受的缓存位置最大年龄（毫秒）
    pub maximum_age_ms: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            max_accuracy_meters: 100.0,
            timeout_secs: 30,
            enable_high_accuracy: true,
            maximum_age_ms: 0,
        }
    }
}

impl LocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 实时通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// ping 之后等待任意入站帧的时长（秒），超时视为对端失联
    pub pong_timeout_secs: u64,
    /// 首次重连延迟（毫秒）
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_max_delay_ms: u64,
    /// 连续失败多少次后放弃并发出 connection_failed
    pub reconnect_max_attempts: u32,
    /// 建立 WebSocket 连接的超时（秒）
    pub connect_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            pong_timeout_secs: 10,
            reconnect_initial_delay_ms: 1_000,
            reconnect_multiplier: 2.0,
            reconnect_max_delay_ms: 16_000,
            reconnect_max_attempts: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// FieldOps SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldOpsConfig {
    /// 数据存储目录（sled KV + 路线历史库）
    pub data_dir: PathBuf,
    /// REST API 基础地址，例如 https://ops.example.com
    pub api_base_url: String,
    /// 实时通道地址（ws:// 或 wss://），None 表示不启用
    pub realtime_url: Option<String>,
    pub sync: SyncConfig,
    pub location: LocationConfig,
    pub realtime: RealtimeConfig,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// ETA 模型使用的最近路线数
    pub route_history_window: usize,
    pub debug_mode: bool,
}

impl Default for FieldOpsConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            api_base_url: "http://localhost:8080".to_string(),
            realtime_url: None,
            sync: SyncConfig::default(),
            location: LocationConfig::default(),
            realtime: RealtimeConfig::default(),
            event_buffer_size: 256,
            route_history_window: 50,
            debug_mode: false,
        }
    }
}

/// 默认数据目录 ~/.fieldops/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".fieldops")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".fieldops")
    } else {
        PathBuf::from("./fieldops_data")
    }
}

impl FieldOpsConfig {
    pub fn builder() -> FieldOpsConfigBuilder {
        FieldOpsConfigBuilder::new()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FieldOpsConfig =
            serde_json::from_str(json).map_err(|e| FieldOpsError::Config(format!("解析配置失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(FieldOpsError::Config(format!(
                "api_base_url 必须以 http:// 或 https:// 开头: {}",
                self.api_base_url
            )));
        }
        if let Some(url) = &self.realtime_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(FieldOpsError::Config(format!(
                    "realtime_url 必须以 ws:// 或 wss:// 开头: {}",
                    url
                )));
            }
        }
        if self.sync.max_attempts == 0 {
            return Err(FieldOpsError::Config("sync.max_attempts 必须大于 0".to_string()));
        }
        if self.sync.max_concurrency == 0 {
            return Err(FieldOpsError::Config("sync.max_concurrency 必须大于 0".to_string()));
        }
        if self.realtime.connect_timeout_secs == 0 {
            return Err(FieldOpsError::Config("realtime.connect_timeout_secs 必须大于 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(FieldOpsError::Config("event_buffer_size 必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// FieldOps SDK 配置构建器
#[derive(Debug, Default)]
pub struct FieldOpsConfigBuilder {
    config: FieldOpsConfig,
}

impl FieldOpsConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn realtime_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.realtime_url = Some(url.into());
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.config.sync = config;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.sync.max_attempts = max_attempts;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.sync.max_concurrency = max_concurrency;
        self
    }

    pub fn location_config(mut self, config: LocationConfig) -> Self {
        self.config.location = config;
        self
    }

    pub fn realtime_config(mut self, config: RealtimeConfig) -> Self {
        self.config.realtime = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn route_history_window(mut self, window: usize) -> Self {
        self.config.route_history_window = window;
        self
    }

    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.config.debug_mode = debug;
        self
    }

    pub fn build(self) -> Result<FieldOpsConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
