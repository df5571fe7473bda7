//! 网络连通性监控
//!
//! - 平台层通过 [`NetworkStatusListener`] 提供网络信号
//! - 在线状态经 `watch` channel 发布，同步引擎据此决定是否发送
//! - 每次 offline → online 跃迁恰好触发一次 flush

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{EventManager, SDKEvent};
use crate::utils::Clock;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    Online,
    Offline,
    Connecting,
    /// 网络受限（如强制门户），仍视为在线
    Limited,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

/// 网络状态监听器trait（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 恢复在线时要触发的 flush
#[async_trait]
pub trait FlushTrigger: Send + Sync + std::fmt::Debug {
    async fn trigger_flush(&self);
}

#[derive(Debug)]
pub struct ConnectivityMonitor {
    status: Mutex<NetworkStatus>,
    online_tx: watch::Sender<bool>,
    flush_trigger: Mutex<Option<Arc<dyn FlushTrigger>>>,
    events: Option<Arc<EventManager>>,
    clock: Arc<dyn Clock>,
    listener: Mutex<Option<Arc<dyn NetworkStatusListener>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: NetworkStatus, events: Option<Arc<EventManager>>, clock: Arc<dyn Clock>) -> Self {
        let (online_tx, _) = watch::channel(initial.is_online());
        Self {
            status: Mutex::new(initial),
            online_tx,
            flush_trigger: Mutex::new(None),
            events,
            clock,
            listener: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn set_flush_trigger(&self, trigger: Arc<dyn FlushTrigger>) {
        *self.flush_trigger.lock() = Some(trigger);
    }

    /// 接入平台监听器：先同步当前状态，再持续转发变化
    pub async fn start(self: &Arc<Self>, listener: Arc<dyn NetworkStatusListener>) -> Result<()> {
        let current = listener.get_current_status().await;
        self.set_status(current).await;

        let mut receiver = listener.start_monitoring().await?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let Some(monitor) = weak.upgrade() else { break };
                        monitor.set_status(event.new_status).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("网络状态事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *self.listener.lock() = Some(listener);
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        info!("🌐 网络监控已启动");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop_monitoring().await;
        }
    }

    pub fn get_status(&self) -> NetworkStatus {
        *self.status.lock()
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// 订阅在线状态
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// 应用一个平台信号；offline → online 时等待 flush 完成后返回
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let (was_online, now_online) = {
            let mut status = self.status.lock();
            let was_online = status.is_online();
            *status = new_status;
            (was_online, new_status.is_online())
        };

        if was_online == now_online {
            return;
        }
        self.online_tx.send_replace(now_online);

        info!("网络状态变化: {} -> {}", online_label(was_online), online_label(now_online));
        if let Some(events) = &self.events {
            events.emit(SDKEvent::ConnectivityChanged {
                online: now_online,
                timestamp: self.clock.now_ms(),
            });
        }

        if now_online {
            let trigger = self.flush_trigger.lock().clone();
            if let Some(trigger) = trigger {
                trigger.trigger_flush().await;
            }
        }
    }

    pub async fn set_online(&self, online: bool) {
        let status = if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        };
        self.set_status(status).await;
    }
}

fn online_label(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// 测试用：可手动推送状态的网络监听器
    #[derive(Debug)]
    pub struct DummyNetworkStatusListener {
        status: Mutex<NetworkStatus>,
        sender: Mutex<Option<broadcast::Sender<NetworkStatusEvent>>>,
    }

    impl DummyNetworkStatusListener {
        pub fn new(status: NetworkStatus) -> Self {
            Self {
                status: Mutex::new(status),
                sender: Mutex::new(None),
            }
        }

        pub fn push(&self, new_status: NetworkStatus) {
            let old_status = std::mem::replace(&mut *self.status.lock(), new_status);
            if let Some(sender) = self.sender.lock().as_ref() {
                let _ = sender.send(NetworkStatusEvent {
                    old_status,
                    new_status,
                    timestamp: 0,
                });
            }
        }
    }

    impl Default for DummyNetworkStatusListener {
        fn default() -> Self {
            Self::new(NetworkStatus::Online)
        }
    }

    #[async_trait]
    impl NetworkStatusListener for DummyNetworkStatusListener {
        async fn get_current_status(&self) -> NetworkStatus {
            *self.status.lock()
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
            let (tx, rx) = broadcast::channel(16);
            *self.sender.lock() = Some(tx);
            Ok(rx)
        }

        async fn stop_monitoring(&self) {
            *self.sender.lock() = None;
        }
    }
}

#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingTrigger {
        flushes: AtomicUsize,
    }

    #[async_trait]
    impl FlushTrigger for CountingTrigger {
        async fn trigger_flush(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor(initial: NetworkStatus) -> (Arc<ConnectivityMonitor>, Arc<CountingTrigger>, Arc<EventManager>) {
        let events = Arc::new(EventManager::new(16));
        let monitor = Arc::new(ConnectivityMonitor::new(
            initial,
            Some(events.clone()),
            Arc::new(ManualClock::new(0)),
        ));
        let trigger = Arc::new(CountingTrigger::default());
        monitor.set_flush_trigger(trigger.clone());
        (monitor, trigger, events)
    }

    #[tokio::test]
    async fn test_flush_once_per_online_transition() {
        let (monitor, trigger, _events) = monitor(NetworkStatus::Offline);
        assert!(!monitor.is_online());

        monitor.set_online(true).await;
        monitor.set_online(true).await;
        monitor.set_status(NetworkStatus::Limited).await;
        assert_eq!(trigger.flushes.load(Ordering::SeqCst), 1);

        monitor.set_online(false).await;
        monitor.set_status(NetworkStatus::Connecting).await;
        assert_eq!(trigger.flushes.load(Ordering::SeqCst), 1);

        monitor.set_online(true).await;
        assert_eq!(trigger.flushes.load(Ordering::SeqCst), 2);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_watch_and_events_follow_state() {
        let (monitor, _trigger, events) = monitor(NetworkStatus::Online);
        let mut watch = monitor.watch();
        let mut received = events.subscribe();

        monitor.set_online(false).await;
        assert!(!*watch.borrow_and_update());
        assert_eq!(
            received.recv().await.unwrap(),
            SDKEvent::ConnectivityChanged { online: false, timestamp: 0 }
        );
    }

    #[tokio::test]
    async fn test_platform_listener_drives_monitor() {
        let (monitor, trigger, _events) = monitor(NetworkStatus::Offline);
        let listener = Arc::new(DummyNetworkStatusListener::new(NetworkStatus::Offline));
        monitor.start(listener.clone()).await.unwrap();
        assert!(!monitor.is_online());

        let mut watch = monitor.watch();
        listener.push(NetworkStatus::Online);
        tokio::time::timeout(Duration::from_secs(1), watch.wait_for(|online| *online))
            .await
            .unwrap()
            .unwrap();

        // flush 在状态发布之后执行，稍等任务完成
        tokio::time::timeout(Duration::from_secs(1), async {
            while trigger.flushes.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        monitor.stop().await;
    }
}
