//! 连续定位采样器
//!
//! - 每个追踪目标最多一个活动订阅，重复 start 会替换旧订阅
//! - 精度差于阈值、或时间戳早于该目标上一个已接受采样的结果被丢弃
//! - 定位出错后该目标停止追踪，错误只通过 on_error 上报一次

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LocationConfig;
use crate::error::GeolocationError;
use crate::location::source::{GeolocationSource, PositionOptions};
use crate::location::LocationSample;
use crate::utils::Clock;

pub type SampleCallback = Arc<dyn Fn(LocationSample) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(GeolocationError) + Send + Sync>;

/// 订阅句柄；generation 用于区分同一目标的新旧订阅
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    target: String,
    generation: u64,
}

impl SubscriptionHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
struct ActiveSubscription {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct SamplerState {
    active: HashMap<String, ActiveSubscription>,
    last_accepted: HashMap<String, i64>,
}

impl SamplerState {
    fn is_current(&self, target: &str, generation: u64) -> bool {
        self.active.get(target).map(|s| s.generation) == Some(generation)
    }

    fn accept(&mut self, target: &str, sample: &LocationSample, max_accuracy: f64) -> bool {
        if !sample.accuracy.is_finite() || sample.accuracy > max_accuracy {
            debug!("丢弃低精度采样: target={} accuracy={}", target, sample.accuracy);
            return false;
        }
        if !sample.point().is_valid() {
            debug!("丢弃非法坐标: target={}", target);
            return false;
        }
        if let Some(&last) = self.last_accepted.get(target) {
            if sample.timestamp < last {
                debug!("丢弃过期采样: target={} ts={} last={}", target, sample.timestamp, last);
                return false;
            }
        }
        self.last_accepted.insert(target.to_string(), sample.timestamp);
        true
    }
}

pub struct LocationSampler {
    source: Arc<dyn GeolocationSource>,
    clock: Arc<dyn Clock>,
    config: LocationConfig,
    state: Arc<Mutex<SamplerState>>,
    next_generation: AtomicU64,
}

impl fmt::Debug for LocationSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationSampler")
            .field("config", &self.config)
            .field("active", &self.state.lock().active.len())
            .finish()
    }
}

impl LocationSampler {
    pub fn new(source: Arc<dyn GeolocationSource>, clock: Arc<dyn Clock>, config: LocationConfig) -> Self {
        Self {
            source,
            clock,
            config,
            state: Arc::new(Mutex::new(SamplerState::default())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// 开始追踪 `target`，必须在 tokio runtime 中调用
    pub fn start(&self, target: &str, on_sample: SampleCallback, on_error: ErrorCallback) -> SubscriptionHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut rx = self.source.watch_position(PositionOptions::from(&self.config));

        let state = self.state.clone();
        let clock = self.clock.clone();
        let max_accuracy = self.config.max_accuracy_meters;
        let task_target = target.to_string();

        // 持锁期间 spawn，保证任务第一次检查 generation 时订阅已登记
        let mut guard = self.state.lock();
        let task = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(position) => {
                        let sample = position.into_sample(clock.now_ms());
                        let accepted = {
                            let mut st = state.lock();
                            if !st.is_current(&task_target, generation) {
                                break;
                            }
                            st.accept(&task_target, &sample, max_accuracy)
                        };
                        if accepted {
                            on_sample(sample);
                        }
                    }
                    Err(e) => {
                        let current = {
                            let mut st = state.lock();
                            let current = st.is_current(&task_target, generation);
                            if current {
                                st.active.remove(&task_target);
                            }
                            current
                        };
                        if current {
                            warn!("定位失败，停止追踪 {}: {}", task_target, e);
                            on_error(e);
                        }
                        break;
                    }
                }
            }

            // 定位流关闭后订阅失效
            let mut st = state.lock();
            if st.is_current(&task_target, generation) {
                st.active.remove(&task_target);
                debug!("定位流结束，移除追踪: target={}", task_target);
            }
        });

        let previous = guard
            .active
            .insert(target.to_string(), ActiveSubscription { generation, task });
        drop(guard);

        if let Some(previous) = previous {
            previous.task.abort();
            debug!("替换追踪订阅: target={} generation={}", target, previous.generation);
        }
        info!("📍 开始追踪: target={} generation={}", target, generation);

        SubscriptionHandle {
            target: target.to_string(),
            generation,
        }
    }

    /// 停止订阅；句柄已被替换时不做任何事并返回 false
    pub fn stop(&self, handle: &SubscriptionHandle) -> bool {
        let removed = {
            let mut state = self.state.lock();
            if state.is_current(&handle.target, handle.generation) {
                state.active.remove(&handle.target)
            } else {
                None
            }
        };
        match removed {
            Some(subscription) => {
                subscription.task.abort();
                info!("停止追踪: target={}", handle.target);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = self.state.lock().active.drain().collect();
        for (_, subscription) in drained {
            subscription.task.abort();
        }
    }

    /// 订阅是否仍是该目标的当前订阅
    pub fn is_current(&self, handle: &SubscriptionHandle) -> bool {
        self.state.lock().is_current(&handle.target, handle.generation)
    }

    pub fn is_tracking(&self, target: &str) -> bool {
        self.state.lock().active.contains_key(target)
    }

    /// 单次定位，超时返回 [`GeolocationError::Timeout`]
    pub async fn get_once(&self) -> std::result::Result<LocationSample, GeolocationError> {
        let options = PositionOptions::from(&self.config);
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.source.get_current_position(options)).await {
            Ok(Ok(position)) => Ok(position.into_sample(self.clock.now_ms())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GeolocationError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

impl Drop for LocationSampler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::location::source::{Position, PositionResult};
    use crate::utils::ManualClock;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// 可由测试推送位置的定位源
    #[derive(Debug, Default)]
    pub(crate) struct FakeGeolocation {
        watchers: Mutex<Vec<mpsc::Sender<PositionResult>>>,
        current: Mutex<Option<PositionResult>>,
    }

    impl FakeGeolocation {
        pub(crate) fn set_current(&self, result: PositionResult) {
            *self.current.lock() = Some(result);
        }

        /// 推送到最新的 watcher
        pub(crate) async fn push(&self, result: PositionResult) {
            let sender = self.watchers.lock().last().cloned();
            if let Some(sender) = sender {
                let _ = sender.send(result).await;
            }
        }

        /// 关闭所有 watcher 的发送端
        pub(crate) fn close_all(&self) {
            self.watchers.lock().clear();
        }

        pub(crate) async fn push_to(&self, index: usize, result: PositionResult) {
            let sender = self.watchers.lock().get(index).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(result).await;
            }
        }
    }

    #[async_trait]
    impl GeolocationSource for FakeGeolocation {
        async fn get_current_position(&self, _options: PositionOptions) -> PositionResult {
            let preset = self.current.lock().clone();
            match preset {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }

        fn watch_position(&self, _options: PositionOptions) -> mpsc::Receiver<PositionResult> {
            let (tx, rx) = mpsc::channel(16);
            self.watchers.lock().push(tx);
            rx
        }
    }

    pub(crate) fn position(latitude: f64, longitude: f64, accuracy: f64, timestamp: i64) -> Position {
        Position {
            latitude,
            longitude,
            accuracy,
            speed: None,
            heading: None,
            timestamp: Some(timestamp),
        }
    }

    fn sampler(source: Arc<FakeGeolocation>) -> LocationSampler {
        LocationSampler::new(source, Arc::new(ManualClock::new(0)), LocationConfig::default())
    }

    fn collectors() -> (
        SampleCallback,
        ErrorCallback,
        mpsc::UnboundedReceiver<LocationSample>,
        mpsc::UnboundedReceiver<GeolocationError>,
    ) {
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let on_sample: SampleCallback = Arc::new(move |s| {
            let _ = sample_tx.send(s);
        });
        let on_error: ErrorCallback = Arc::new(move |e| {
            let _ = error_tx.send(e);
        });
        (on_sample, on_error, sample_rx, error_rx)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_filters_inaccurate_and_out_of_order_samples() {
        let source = Arc::new(FakeGeolocation::default());
        let sampler = sampler(source.clone());
        let (on_sample, on_error, mut samples, _errors) = collectors();
        sampler.start("d-1", on_sample, on_error);

        source.push(Ok(position(28.70, 77.10, 10.0, 1_000))).await;
        source.push(Ok(position(28.71, 77.11, 500.0, 2_000))).await;
        source.push(Ok(position(28.72, 77.12, 10.0, 500))).await;
        source.push(Ok(position(28.73, 77.13, 10.0, 3_000))).await;

        assert_eq!(next(&mut samples).await.unwrap().timestamp, 1_000);
        assert_eq!(next(&mut samples).await.unwrap().timestamp, 3_000);
    }

    #[tokio::test]
    async fn test_restart_replaces_subscription() {
        let source = Arc::new(FakeGeolocation::default());
        let sampler = sampler(source.clone());
        let (on_sample, on_error, mut samples, _errors) = collectors();
        let first = sampler.start("d-1", on_sample.clone(), on_error.clone());
        let second = sampler.start("d-1", on_sample, on_error);
        assert!(second.generation() > first.generation());
        assert!(!sampler.is_current(&first));

        // 旧句柄不能停掉新订阅
        assert!(!sampler.stop(&first));
        assert!(sampler.is_tracking("d-1"));

        source.push_to(0, Ok(position(28.70, 77.10, 10.0, 1_000))).await;
        source.push_to(1, Ok(position(28.70, 77.10, 10.0, 2_000))).await;
        assert_eq!(next(&mut samples).await.unwrap().timestamp, 2_000);

        assert!(sampler.stop(&second));
        assert!(!sampler.is_tracking("d-1"));
    }

    #[tokio::test]
    async fn test_watch_error_stops_tracking_and_reports_once() {
        let source = Arc::new(FakeGeolocation::default());
        let sampler = sampler(source.clone());
        let (on_sample, on_error, _samples, mut errors) = collectors();
        sampler.start("d-1", on_sample, on_error);

        source.push(Err(GeolocationError::PermissionDenied)).await;
        assert_eq!(next(&mut errors).await, Some(GeolocationError::PermissionDenied));
        assert!(!sampler.is_tracking("d-1"));
        assert!(next(&mut errors).await.is_none());
    }

    #[tokio::test]
    async fn test_closed_watch_stream_stops_tracking() {
        let source = Arc::new(FakeGeolocation::default());
        let sampler = sampler(source.clone());
        let (on_sample, on_error, _samples, mut errors) = collectors();
        let handle = sampler.start("d-1", on_sample, on_error);
        assert!(sampler.is_tracking("d-1"));

        source.close_all();
        tokio::time::timeout(Duration::from_secs(1), async {
            while sampler.is_tracking("d-1") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!sampler.is_current(&handle));
        assert!(!sampler.stop(&handle));
        // 流正常结束不算定位错误
        assert!(next(&mut errors).await.is_none());
    }

    #[tokio::test]
    async fn test_get_once_reports_platform_error() {
        let source = Arc::new(FakeGeolocation::default());
        source.set_current(Err(GeolocationError::Unavailable("no fix".to_string())));
        let sampler = sampler(source);
        assert!(matches!(sampler.get_once().await, Err(GeolocationError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_once_times_out() {
        let sampler = sampler(Arc::new(FakeGeolocation::default()));
        assert_eq!(sampler.get_once().await, Err(GeolocationError::Timeout(30_000)));
    }
}
