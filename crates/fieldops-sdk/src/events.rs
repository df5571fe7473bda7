//! 事件系统 - SDK 向宿主（展示层）推送的状态变化
//!
//! - 广播：`subscribe()` 得到 broadcast Receiver
//! - 监听器：`add_listener(event_type, handler)`，`"*"` 接收全部事件
//! - 监听器在 `emit` 调用方的上下文中同步执行，不应阻塞

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::eta::EtaEstimate;
use crate::location::LocationSample;
use crate::realtime::ChannelStatus;
use crate::storage::queue::OperationStatus;
use crate::storage::{EntityType, SyncState};

/// SDK 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SDKEvent {
    /// 网络在线状态变化
    ConnectivityChanged { online: bool, timestamp: i64 },
    /// 发件箱操作状态变化
    SyncOperationUpdated {
        operation_id: String,
        entity_type: EntityType,
        entity_id: String,
        status: OperationStatus,
        attempts: u32,
        last_error: Option<String>,
        timestamp: i64,
    },
    /// 一轮 flush 结束
    SyncFlushCompleted { synced: usize, failed: usize, timestamp: i64 },
    /// 本地记录同步状态变化
    RecordSyncStateChanged {
        entity_type: EntityType,
        entity_id: String,
        sync_state: SyncState,
        timestamp: i64,
    },
    /// 401：需要宿主刷新凭证
    AuthExpired { timestamp: i64 },
    /// 采样器接受了一个新位置
    LocationSampled {
        target: String,
        sample: LocationSample,
    },
    /// 定位失败，该目标的追踪已停止
    TrackingError {
        target: String,
        error: String,
        timestamp: i64,
    },
    /// 本地重新计算的 ETA
    EtaUpdated {
        delivery_id: String,
        estimate: EtaEstimate,
    },
    /// 实时通道状态变化
    RealtimeStateChanged {
        old_state: ChannelStatus,
        new_state: ChannelStatus,
        timestamp: i64,
    },
    /// 服务端推送的位置
    LocationUpdate { data: serde_json::Value, timestamp: i64 },
    /// 服务端推送的 ETA
    EtaUpdate { data: serde_json::Value, timestamp: i64 },
    /// 重连次数耗尽，不再重试
    ConnectionFailed { attempts: u32, timestamp: i64 },
}

impl SDKEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SDKEvent::SyncOperationUpdated { .. } => "sync_operation_updated",
            SDKEvent::SyncFlushCompleted { .. } => "sync_flush_completed",
            SDKEvent::RecordSyncStateChanged { .. } => "record_sync_state_changed",
            SDKEvent::AuthExpired { .. } => "auth_expired",
            SDKEvent::LocationSampled { .. } => "location_sampled",
            SDKEvent::TrackingError { .. } => "tracking_error",
            SDKEvent::EtaUpdated { .. } => "eta_updated",
            SDKEvent::RealtimeStateChanged { .. } => "realtime_state_changed",
            SDKEvent::LocationUpdate { .. } => "location_update",
            SDKEvent::EtaUpdate { .. } => "eta_update",
            SDKEvent::ConnectionFailed { .. } => "connection_failed",
        }
    }

    /// 事件关联的实体 id（配送单或追踪目标）
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            SDKEvent::SyncOperationUpdated { entity_id, .. } => Some(entity_id),
            SDKEvent::RecordSyncStateChanged { entity_id, .. } => Some(entity_id),
            SDKEvent::LocationSampled { target, .. } => Some(target),
            SDKEvent::TrackingError { target, .. } => Some(target),
            SDKEvent::EtaUpdated { delivery_id, .. } => Some(delivery_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SDKEvent::ConnectivityChanged { timestamp, .. }
            | SDKEvent::SyncOperationUpdated { timestamp, .. }
            | SDKEvent::SyncFlushCompleted { timestamp, .. }
            | SDKEvent::RecordSyncStateChanged { timestamp, .. }
            | SDKEvent::AuthExpired { timestamp }
            | SDKEvent::TrackingError { timestamp, .. }
            | SDKEvent::RealtimeStateChanged { timestamp, .. }
            | SDKEvent::LocationUpdate { timestamp, .. }
            | SDKEvent::EtaUpdate { timestamp, .. }
            | SDKEvent::ConnectionFailed { timestamp, .. } => *timestamp,
            SDKEvent::LocationSampled { sample, .. } => sample.timestamp,
            SDKEvent::EtaUpdated { estimate, .. } => estimate.computed_at,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub entity_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_entity_ids(mut self, entity_ids: Vec<String>) -> Self {
        self.entity_ids = Some(entity_ids);
        self
    }

    pub fn matches(&self, event: &SDKEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(ids) = &self.entity_ids {
            match event.entity_id() {
                Some(id) if ids.iter().any(|i| i == id) => {}
                // 事件没有实体 id 但过滤器要求有
                _ => return false,
            }
        }
        true
    }
}

pub type EventListener = Arc<dyn Fn(&SDKEvent) + Send + Sync>;

/// 监听器 id，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
    listeners: RwLock<HashMap<String, Vec<(ListenerId, EventListener)>>>,
    stats: RwLock<EventStats>,
    next_listener_id: AtomicU64,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventStats::default()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 失败属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 复制出监听器再调用，监听器里可以安全地增删监听
        let to_call: Vec<EventListener> = {
            let listeners = self.listeners.read();
            listeners
                .get(event.event_type())
                .into_iter()
                .chain(listeners.get("*"))
                .flat_map(|v| v.iter().map(|(_, l)| l.clone()))
                .collect()
        };
        for listener in to_call {
            listener(&event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    pub fn add_listener<F>(&self, event_type: &str, listener: F) -> ListenerId
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        let count = {
            let mut listeners = self.listeners.write();
            listeners
                .entry(event_type.to_string())
                .or_default()
                .push((id, Arc::new(listener)));
            listeners.values().map(|v| v.len()).sum()
        };
        self.stats.write().listener_count = count;
        info!("Added listener for event type: {}", event_type);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let (removed, count) = {
            let mut listeners = self.listeners.write();
            let mut removed = false;
            for entries in listeners.values_mut() {
                let before = entries.len();
                entries.retain(|(lid, _)| *lid != id);
                removed |= entries.len() != before;
            }
            listeners.retain(|_, v| !v.is_empty());
            (removed, listeners.values().map(|v| v.len()).sum())
        };
        self.stats.write().listener_count = count;
        removed
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(|v| v.len()).sum()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn flush_event(synced: usize) -> SDKEvent {
        SDKEvent::SyncFlushCompleted {
            synced,
            failed: 0,
            timestamp: 1,
        }
    }

    #[test]
    fn test_event_listeners() {
        let manager = EventManager::new(16);
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let typed_clone = typed.clone();
        manager.add_listener("sync_flush_completed", move |_| {
            typed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let all_clone = all.clone();
        let wildcard = manager.add_listener("*", move |_| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.emit(flush_event(1));
        manager.emit(SDKEvent::ConnectivityChanged { online: true, timestamp: 2 });
        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        assert!(manager.remove_listener(wildcard));
        assert!(!manager.remove_listener(wildcard));
        manager.emit(flush_event(2));
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get_stats().total_events, 3);
        assert_eq!(manager.get_stats().listener_count, 1);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let manager = EventManager::new(16);
        let mut receiver1 = manager.subscribe();
        let mut receiver2 = manager.subscribe();
        assert_eq!(manager.subscriber_count(), 2);

        manager.emit(flush_event(3));
        assert_eq!(receiver1.recv().await.unwrap().event_type(), "sync_flush_completed");
        assert_eq!(receiver2.recv().await.unwrap(), flush_event(3));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let manager = EventManager::new(16);
        let mut receiver = manager.subscribe_filtered(
            EventFilter::new()
                .with_event_types(vec!["tracking_error".to_string()])
                .with_entity_ids(vec!["d-2".to_string()]),
        );

        for target in ["d-1", "d-2"] {
            manager.emit(SDKEvent::TrackingError {
                target: target.to_string(),
                error: "denied".to_string(),
                timestamp: 5,
            });
        }
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.entity_id(), Some("d-2"));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let value = serde_json::to_value(SDKEvent::ConnectionFailed {
            attempts: 5,
            timestamp: 9,
        })
        .unwrap();
        assert_eq!(value["type"], "connection_failed");
        assert_eq!(value["attempts"], 5);
    }
}
