//! FieldOps SDK 主入口
//!
//! `FieldOpsSDK` 是组合根：持有全部服务实例，没有全局单例。
//!
//! 分层初始化顺序：
//! 1. 存储层（sled LocalStore + 发件箱）→ 2. 网络层 → 3. 同步层 → 4. 定位 / ETA → 5. 实时通道
//!
//! 本地存储打不开时进入降级模式：变更直接发往服务端，不做本地缓存。

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::FieldOpsConfig;
use crate::error::{FieldOpsError, Result};
use crate::eta::{ChainStopEta, EtaEstimate, EtaEstimator, EtaModel};
use crate::events::{EventManager, ListenerId, SDKEvent};
use crate::location::{
    ErrorCallback, GeoPoint, GeolocationSource, LocationSample, LocationSampler, SampleCallback,
    SubscriptionHandle,
};
use crate::mutation::{MutationOutcome, MutationRequest};
use crate::network::{ConnectivityMonitor, NetworkStatus, NetworkStatusListener};
use crate::permission::{self, Identity};
use crate::realtime::{ChannelStatus, RealtimeChannel, RealtimeConnector, WsConnector};
use crate::storage::queue::SyncOperation;
use crate::storage::{
    EntityGuard, EntityType, LocalStore, Record, RecordStore, RouteHistoryEntry, RouteHistoryStore, SledLocalStore,
    SyncQueue, SyncState, SyncStats,
};
use crate::sync::{AuthProvider, FlushOutcome, HttpRemoteApi, RemoteApi, SyncEngine};
use crate::utils::{Clock, SystemClock};
use crate::version::{BUILD_TIME, GIT_SHA, SDK_VERSION};

/// 为没有自己 subscriber 的宿主安装 fmt 日志输出；已安装时不做任何事
pub fn init_logging(debug_mode: bool) {
    let level = if debug_mode {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_err()
    {
        debug!("tracing subscriber 已存在，跳过安装");
    }
}

/// 宿主注入的外部协作方
///
/// 只有认证与定位是必需的；其余为 None 时使用默认实现。
#[derive(Debug, Clone)]
pub struct SdkCollaborators {
    pub auth: Arc<dyn AuthProvider>,
    pub geolocation: Arc<dyn GeolocationSource>,
    /// 平台网络信号；None 时视为始终在线，可用 `set_online` 手动切换
    pub network_listener: Option<Arc<dyn NetworkStatusListener>>,
    /// 默认为 reqwest 实现的 [`HttpRemoteApi`]
    pub remote: Option<Arc<dyn RemoteApi>>,
    /// 默认为 [`WsConnector`]
    pub realtime_connector: Option<Arc<dyn RealtimeConnector>>,
    pub clock: Option<Arc<dyn Clock>>,
    /// 默认在 `<data_dir>/store` 打开 sled
    pub local_store: Option<Arc<dyn LocalStore>>,
}

impl SdkCollaborators {
    pub fn new(auth: Arc<dyn AuthProvider>, geolocation: Arc<dyn GeolocationSource>) -> Self {
        Self {
            auth,
            geolocation,
            network_listener: None,
            remote: None,
            realtime_connector: None,
            clock: None,
            local_store: None,
        }
    }

    pub fn network_listener(mut self, listener: Arc<dyn NetworkStatusListener>) -> Self {
        self.network_listener = Some(listener);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn realtime_connector(mut self, connector: Arc<dyn RealtimeConnector>) -> Self {
        self.realtime_connector = Some(connector);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local_store = Some(store);
        self
    }
}

#[derive(Debug)]
struct OfflineStack {
    records: RecordStore,
    queue: Arc<SyncQueue>,
    engine: Arc<SyncEngine>,
}

#[derive(Debug)]
struct TrackingSession {
    handle: SubscriptionHandle,
    worker: JoinHandle<()>,
}

#[derive(Debug)]
pub struct FieldOpsSDK {
    config: FieldOpsConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
    auth: Arc<dyn AuthProvider>,
    remote: Arc<dyn RemoteApi>,
    /// None 表示降级模式
    offline: Option<OfflineStack>,
    connectivity: Arc<ConnectivityMonitor>,
    sampler: Arc<LocationSampler>,
    eta: Arc<EtaEstimator>,
    route_history: Option<Arc<RouteHistoryStore>>,
    realtime: Option<Arc<RealtimeChannel>>,
    tracking: Mutex<HashMap<String, TrackingSession>>,
    shutting_down: AtomicBool,
}

impl FieldOpsSDK {
    /// 异步初始化 SDK，必须在 tokio runtime 中调用
    pub async fn initialize(config: FieldOpsConfig, collaborators: SdkCollaborators) -> Result<Arc<Self>> {
        info!("正在初始化 FieldOps SDK {} ({}, built {})...", SDK_VERSION, GIT_SHA, BUILD_TIME);
        config.validate()?;

        let SdkCollaborators {
            auth,
            geolocation,
            network_listener,
            remote,
            realtime_connector,
            clock,
            local_store,
        } = collaborators;
        let clock: Arc<dyn Clock> = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        let remote: Arc<dyn RemoteApi> = match remote {
            Some(remote) => remote,
            None => Arc::new(HttpRemoteApi::new(&config)?),
        };

        // === 第1层：存储 ===
        let store: Result<Arc<dyn LocalStore>> = match local_store {
            Some(store) => Ok(store),
            None => SledLocalStore::open(&config.data_dir.join("store"))
                .await
                .map(|store| Arc::new(store) as Arc<dyn LocalStore>),
        };
        let storage = match store {
            Ok(store) => match SyncQueue::open(store.clone(), clock.clone(), config.sync.retry_policy()).await {
                Ok(queue) => Some((store, Arc::new(queue))),
                Err(e) => {
                    warn!("⚠️ 发件箱不可用，进入降级模式: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("⚠️ 本地存储不可用，进入降级模式: {}", e);
                None
            }
        };

        // === 第2层：网络 ===
        let initial_status = match &network_listener {
            Some(listener) => listener.get_current_status().await,
            None => NetworkStatus::Online,
        };
        let connectivity = Arc::new(ConnectivityMonitor::new(initial_status, Some(events.clone()), clock.clone()));

        // === 第3层：同步 ===
        let offline = storage.map(|(store, queue)| {
            let records = RecordStore::new(store, clock.clone());
            let engine = Arc::new(SyncEngine::new(
                queue.clone(),
                records.clone(),
                remote.clone(),
                auth.clone(),
                connectivity.watch(),
                events.clone(),
                clock.clone(),
                config.sync.max_concurrency,
            ));
            connectivity.set_flush_trigger(engine.clone());
            OfflineStack { records, queue, engine }
        });
        if let Some(listener) = network_listener {
            connectivity.start(listener).await?;
        }
        info!("网络层初始化完成 (online={})", connectivity.is_online());

        // === 第4层：定位与 ETA ===
        let route_history = match RouteHistoryStore::open(&config.data_dir) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("⚠️ 路线历史库不可用，ETA 使用默认参数: {}", e);
                None
            }
        };
        let history = match &route_history {
            Some(store) => store.list_recent(config.route_history_window).unwrap_or_else(|e| {
                warn!("读取路线历史失败: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let eta = Arc::new(EtaEstimator::from_history(&history, clock.clone()));
        let sampler = Arc::new(LocationSampler::new(geolocation, clock.clone(), config.location.clone()));
        info!("ETA 模型已加载 ({} 条历史路线)", history.len());

        // === 第5层：实时通道 ===
        let realtime = config.realtime_url.as_ref().map(|url| {
            let connector = realtime_connector
                .unwrap_or_else(|| Arc::new(WsConnector::from_config(&config.realtime)));
            let channel = Arc::new(RealtimeChannel::new(
                url.clone(),
                config.realtime.clone(),
                connector,
                auth.clone(),
                events.clone(),
                clock.clone(),
            ));
            channel.start();
            channel
        });

        let sdk = Arc::new(Self {
            config,
            clock,
            events,
            auth,
            remote,
            offline,
            connectivity,
            sampler,
            eta,
            route_history,
            realtime,
            tracking: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        });

        // 上次会话遗留的操作
        if let Some(stack) = &sdk.offline {
            let pending = stack.queue.stats().pending;
            if pending > 0 && sdk.connectivity.is_online() {
                info!("发件箱中有 {} 个待同步操作，启动 flush", pending);
                sdk.spawn_flush();
            }
        }

        info!("✅ FieldOps SDK 初始化完成 (degraded={})", sdk.is_degraded());
        Ok(sdk)
    }

    pub fn config(&self) -> &FieldOpsConfig {
        &self.config
    }

    /// 本地存储不可用、变更直接发往服务端
    pub fn is_degraded(&self) -> bool {
        self.offline.is_none()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(FieldOpsError::InvalidOperation("SDK 已关闭".to_string()));
        }
        Ok(())
    }

    fn offline_stack(&self) -> Result<&OfflineStack> {
        self.offline
            .as_ref()
            .ok_or_else(|| FieldOpsError::Storage("降级模式下没有本地发件箱".to_string()))
    }

    fn spawn_flush(&self) {
        if let Some(stack) = &self.offline {
            let engine = stack.engine.clone();
            tokio::spawn(async move {
                let outcome = engine.flush().await;
                debug!("后台 flush 结束: {:?}", outcome);
            });
        }
    }

    async fn notify_auth_expired(&self) {
        self.events.emit(SDKEvent::AuthExpired {
            timestamp: self.clock.now_ms(),
        });
        self.auth.on_auth_expired().await;
    }

    fn authorize(identity: &Identity, record: &Record, request: &MutationRequest) -> Result<()> {
        let capability = request.kind.capability();
        let capabilities = permission::resolve(&identity.role, identity, record);
        if capabilities.allows(capability) {
            return Ok(());
        }
        warn!(
            "权限拒绝: user={} role={} record={} capability={}",
            identity.user_id, identity.role, record.id, capability
        );
        Err(FieldOpsError::PermissionDenied(format!(
            "{} 无权在配送单 {} 上执行 {}",
            identity.user_id, record.id, capability
        )))
    }

    // ========== 变更 ==========

    /// 发起一个变更：校验 → 权限 → 乐观写 → 入队
    ///
    /// 权限拒绝时不写入任何本地数据
    #[instrument(skip(self, request), fields(delivery = %request.delivery_id, kind = request.kind.name()))]
    pub async fn request_mutation(&self, request: MutationRequest) -> Result<MutationOutcome> {
        self.ensure_running()?;
        request.validate()?;
        let identity = self
            .auth
            .identity()
            .ok_or_else(|| FieldOpsError::PermissionDenied("当前没有登录身份".to_string()))?;
        let now = self.clock.now_ms();

        let Some(stack) = &self.offline else {
            return self.apply_direct(&identity, &request, now).await;
        };

        // 乐观写与入队在同一把实体锁内，同步引擎回写状态时看得到这条新操作
        let guard = stack
            .records
            .lock_entity(EntityType::Delivery, &request.delivery_id)
            .await;
        let previous = self.load_delivery(stack, &guard).await?;
        Self::authorize(&identity, &previous, &request)?;

        let record = stack
            .records
            .write_optimistic(&guard, request.apply(previous.clone(), now))
            .await?;
        let operation = match stack.queue.enqueue(request.to_operation_input(now)).await {
            Ok(operation) => operation,
            Err(e) => {
                if let Err(rollback) = stack.records.restore(&guard, &previous).await {
                    warn!("回滚乐观写失败 {}: {}", previous.id, rollback);
                }
                return Err(e);
            }
        };
        drop(guard);

        self.events.emit(SDKEvent::RecordSyncStateChanged {
            entity_type: EntityType::Delivery,
            entity_id: record.id.clone(),
            sync_state: SyncState::Dirty,
            timestamp: now,
        });
        self.events.emit(SDKEvent::SyncOperationUpdated {
            operation_id: operation.id.clone(),
            entity_type: operation.entity_type,
            entity_id: operation.entity_id.clone(),
            status: operation.status,
            attempts: operation.attempts,
            last_error: None,
            timestamp: now,
        });

        if self.config.sync.auto_flush && self.connectivity.is_online() {
            self.spawn_flush();
        }
        Ok(MutationOutcome::Queued { operation })
    }

    /// 先查本地，没有则从服务端拉取并缓存
    async fn load_delivery(&self, stack: &OfflineStack, guard: &EntityGuard) -> Result<Record> {
        let id = guard.id();
        if let Some(record) = stack.records.get(EntityType::Delivery, id).await? {
            return Ok(record);
        }
        let payload = self.fetch_remote(EntityType::Delivery, id).await?;
        match stack.records.cache_remote_locked(guard, payload.clone()).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!("缓存配送单 {} 失败: {}", id, e);
                Ok(Record::entity(EntityType::Delivery, id, payload, self.clock.now_ms()))
            }
        }
    }

    async fn fetch_remote(&self, entity_type: EntityType, id: &str) -> Result<serde_json::Value> {
        let token = self.auth.access_token();
        match self.remote.fetch_record(entity_type, id, token.as_deref()).await {
            Err(FieldOpsError::AuthExpired) => {
                self.notify_auth_expired().await;
                Err(FieldOpsError::AuthExpired)
            }
            other => other,
        }
    }

    /// 降级模式：直接发送，不落本地
    async fn apply_direct(&self, identity: &Identity, request: &MutationRequest, now: i64) -> Result<MutationOutcome> {
        let payload = self.fetch_remote(EntityType::Delivery, &request.delivery_id).await?;
        let record = Record::entity(EntityType::Delivery, &request.delivery_id, payload, now);
        Self::authorize(identity, &record, request)?;

        let operation = SyncOperation::from_input(request.to_operation_input(now), 0, now);
        let token = self.auth.access_token();
        match self.remote.send_operation(&operation, token.as_deref()).await {
            Ok(response) => {
                debug!("降级模式直接发送成功: {}", operation.endpoint);
                Ok(MutationOutcome::Applied { response })
            }
            Err(FieldOpsError::AuthExpired) => {
                self.notify_auth_expired().await;
                Err(FieldOpsError::AuthExpired)
            }
            Err(e) => Err(e),
        }
    }

    // ========== 读取 ==========

    /// 从服务端读取记录并缓存；缓存失败只记日志
    ///
    /// 本地存在未同步的修改时返回本地版本
    pub async fn fetch_record(&self, entity_type: EntityType, id: &str) -> Result<Record> {
        self.ensure_running()?;
        let payload = self.fetch_remote(entity_type, id).await?;
        let Some(stack) = &self.offline else {
            return Ok(Record::entity(entity_type, id, payload, self.clock.now_ms()));
        };
        match stack.records.cache_remote(entity_type, id, payload.clone()).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!("缓存 {}:{} 失败: {}", entity_type, id, e);
                Ok(Record::entity(entity_type, id, payload, self.clock.now_ms()))
            }
        }
    }

    /// 读取本地记录；降级模式下总是 None
    pub async fn get_record(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>> {
        match &self.offline {
            Some(stack) => stack.records.get(entity_type, id).await,
            None => Ok(None),
        }
    }

    pub async fn list_records(&self, entity_type: EntityType) -> Result<Vec<Record>> {
        match &self.offline {
            Some(stack) => stack.records.get_all(entity_type).await,
            None => Ok(Vec::new()),
        }
    }

    // ========== 同步 ==========

    pub fn get_sync_stats(&self) -> SyncStats {
        self.offline
            .as_ref()
            .map(|stack| stack.queue.stats())
            .unwrap_or_default()
    }

    /// 手动 flush；已有 flush 在进行、离线或降级模式时返回 `{0, 0}`
    pub async fn flush(&self) -> FlushOutcome {
        match &self.offline {
            Some(stack) => stack.engine.flush().await,
            None => FlushOutcome::default(),
        }
    }

    pub fn pending_operations(&self) -> Vec<SyncOperation> {
        self.offline
            .as_ref()
            .map(|stack| {
                stack
                    .queue
                    .operations()
                    .into_iter()
                    .filter(|op| op.status.is_outstanding())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 等待人工处理的失败操作
    pub fn terminal_failures(&self) -> Vec<SyncOperation> {
        self.offline
            .as_ref()
            .map(|stack| stack.queue.terminal_failures())
            .unwrap_or_default()
    }

    fn emit_operation(&self, op: &SyncOperation) {
        self.events.emit(SDKEvent::SyncOperationUpdated {
            operation_id: op.id.clone(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            status: op.status,
            attempts: op.attempts,
            last_error: op.last_error.clone(),
            timestamp: self.clock.now_ms(),
        });
    }

    /// 把 failed-terminal 操作重新放回队列
    pub async fn retry_terminal(&self, operation_id: &str) -> Result<SyncOperation> {
        self.ensure_running()?;
        let stack = self.offline_stack()?;
        let op = stack.queue.retry_terminal(operation_id).await?;
        if let Err(e) = stack
            .records
            .set_sync_state(op.entity_type, &op.entity_id, SyncState::Dirty)
            .await
        {
            warn!("更新记录同步状态失败 {}:{}: {}", op.entity_type, op.entity_id, e);
        }
        self.emit_operation(&op);
        if self.config.sync.auto_flush && self.connectivity.is_online() {
            self.spawn_flush();
        }
        Ok(op)
    }

    /// 放弃一个 failed-terminal 操作，同一实体排在它后面的操作随即放行
    ///
    /// 没有后续操作时，本地记录在下一次 fetch_record 时被服务端数据覆盖
    pub async fn discard_terminal(&self, operation_id: &str) -> Result<SyncOperation> {
        self.ensure_running()?;
        let stack = self.offline_stack()?;
        let op = stack.queue.discard_terminal(operation_id).await?;
        self.emit_operation(&op);
        if stack.queue.has_outstanding(op.entity_type, &op.entity_id)
            && self.config.sync.auto_flush
            && self.connectivity.is_online()
        {
            self.spawn_flush();
        }
        Ok(op)
    }

    // ========== 事件 ==========

    /// 注册事件回调，`"*"` 接收全部事件
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> ListenerId
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(event_type, handler)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    // ========== 网络 ==========

    /// 手动设置在线状态（没有平台监听器的宿主使用）
    pub async fn set_online(&self, online: bool) {
        self.connectivity.set_online(online).await;
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.connectivity.get_status()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn realtime_status(&self) -> Option<ChannelStatus> {
        self.realtime.as_ref().map(|channel| channel.status())
    }

    // ========== 追踪与 ETA ==========

    /// 开始追踪一个配送单
    ///
    /// 每个被接受的采样：在有权限时入队位置变更、重算 ETA、在实时通道已连接时广播
    pub fn start_tracking(
        self: &Arc<Self>,
        delivery_id: &str,
        destination: GeoPoint,
        upcoming_stops: usize,
    ) -> Result<SubscriptionHandle> {
        self.ensure_running()?;
        if delivery_id.trim().is_empty() {
            return Err(FieldOpsError::Validation("deliveryId 不能为空".to_string()));
        }
        if !destination.is_valid() {
            return Err(FieldOpsError::Validation(format!(
                "非法目的地坐标: ({}, {})",
                destination.latitude, destination.longitude
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<LocationSample>();
        let on_sample: SampleCallback = Arc::new(move |sample| {
            let _ = tx.send(sample);
        });
        let events = self.events.clone();
        let clock = self.clock.clone();
        let error_target = delivery_id.to_string();
        let on_error: ErrorCallback = Arc::new(move |error| {
            warn!("追踪 {} 定位失败: {}", error_target, error);
            events.emit(SDKEvent::TrackingError {
                target: error_target.clone(),
                error: error.to_string(),
                timestamp: clock.now_ms(),
            });
        });

        let mut sessions = self.tracking.lock();
        let handle = self.sampler.start(delivery_id, on_sample, on_error);

        let weak = Arc::downgrade(self);
        let current = handle.clone();
        let target = delivery_id.to_string();
        let worker = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                let Some(sdk) = weak.upgrade() else { break };
                if !sdk.sampler.is_current(&current) {
                    debug!("追踪会话已失效，丢弃采样: {}", target);
                    break;
                }
                sdk.on_tracking_sample(&target, destination, upcoming_stops, sample)
                    .await;
            }
        });

        let session = TrackingSession {
            handle: handle.clone(),
            worker,
        };
        if let Some(previous) = sessions.insert(delivery_id.to_string(), session) {
            previous.worker.abort();
        }
        info!("📍 开始追踪配送单 {} (generation={})", delivery_id, handle.generation());
        Ok(handle)
    }

    async fn on_tracking_sample(
        &self,
        delivery_id: &str,
        destination: GeoPoint,
        upcoming_stops: usize,
        sample: LocationSample,
    ) {
        self.events.emit(SDKEvent::LocationSampled {
            target: delivery_id.to_string(),
            sample,
        });

        match self
            .request_mutation(MutationRequest::update_location(delivery_id, sample))
            .await
        {
            Ok(_) => {}
            Err(FieldOpsError::PermissionDenied(reason)) => debug!("跳过位置上报: {}", reason),
            Err(e) => warn!("位置变更入队失败 {}: {}", delivery_id, e),
        }

        let estimate = self.eta.estimate(sample.point(), destination, upcoming_stops);
        self.events.emit(SDKEvent::EtaUpdated {
            delivery_id: delivery_id.to_string(),
            estimate,
        });

        if let Some(channel) = &self.realtime {
            if channel.is_connected() {
                let data = json!({
                    "deliveryId": delivery_id,
                    "latitude": sample.latitude,
                    "longitude": sample.longitude,
                    "accuracy": sample.accuracy,
                    "timestamp": sample.timestamp,
                    "etaMinutes": estimate.minutes,
                });
                if let Err(e) = channel.send_location(data) {
                    debug!("实时位置广播失败: {}", e);
                }
            }
        }
    }

    pub fn stop_tracking(&self, delivery_id: &str) -> bool {
        let Some(session) = self.tracking.lock().remove(delivery_id) else {
            return false;
        };
        self.sampler.stop(&session.handle);
        session.worker.abort();
        info!("停止追踪配送单 {}", delivery_id);
        true
    }

    pub fn is_tracking(&self, delivery_id: &str) -> bool {
        self.sampler.is_tracking(delivery_id)
    }

    /// 单次定位
    pub async fn current_position(&self) -> Result<LocationSample> {
        Ok(self.sampler.get_once().await?)
    }

    pub fn estimate_eta(&self, current: GeoPoint, destination: GeoPoint, upcoming_stops: usize) -> EtaEstimate {
        self.eta.estimate(current, destination, upcoming_stops)
    }

    pub fn estimate_route(&self, current: GeoPoint, stops: &[GeoPoint]) -> Vec<ChainStopEta> {
        self.eta.estimate_chain(current, stops)
    }

    pub fn eta_model(&self) -> EtaModel {
        self.eta.model()
    }

    /// 归档一条完成的路线并用最近的历史重建 ETA 模型
    pub fn record_completed_route(&self, route_key: &str, entry: &RouteHistoryEntry) -> Result<EtaModel> {
        let store = self
            .route_history
            .as_ref()
            .ok_or_else(|| FieldOpsError::Storage("路线历史库不可用".to_string()))?;
        store.insert(route_key, entry, self.clock.now_ms())?;
        let history = store.list_recent(self.config.route_history_window)?;
        Ok(self.eta.refresh_model(&history))
    }

    // ========== 生命周期 ==========

    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("正在关闭 FieldOps SDK...");

        let sessions: Vec<TrackingSession> = self.tracking.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.worker.abort();
        }
        self.sampler.stop_all();
        if let Some(channel) = &self.realtime {
            channel.stop();
        }
        self.connectivity.stop().await;
        self.events.clear_listeners();

        info!("FieldOps SDK 关闭完成");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

impl Drop for FieldOpsSDK {
    fn drop(&mut self) {
        for (_, session) in self.tracking.lock().drain() {
            session.worker.abort();
        }
    }
}
