//! 重连退避：1s → 2s → 4s → 8s → 16s，次数耗尽后放弃

use std::time::Duration;
use tracing::info;

use crate::config::RealtimeConfig;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial_delay_ms: u64,
    multiplier: f64,
    max_delay_ms: u64,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            initial_delay_ms: config.reconnect_initial_delay_ms,
            multiplier: config.reconnect_multiplier,
            max_delay_ms: config.reconnect_max_delay_ms,
            max_attempts: config.reconnect_max_attempts,
            attempts: 0,
        }
    }

    /// 下一次重连前的等待时间；次数耗尽返回 None
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay_ms = (self.initial_delay_ms as f64 * self.multiplier.powi(self.attempts as i32))
            .min(self.max_delay_ms as f64) as u64;
        self.attempts += 1;
        info!("重连尝试 #{}/{}，等待 {}ms", self.attempts, self.max_attempts, delay_ms);
        Some(Duration::from_millis(delay_ms))
    }

    /// 连接成功后重置
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
