//! FieldOps SDK - 离线优先的外勤作业 SDK
//!
//! 本 SDK 提供：
//! - 📦 本地持久化与发件箱：离线时的变更先乐观写入本地，恢复网络后按顺序同步
//! - 🔐 权限网关：按角色、归属和区域决定可执行的变更
//! - 📍 连续定位采样：过滤低精度与过期采样
//! - ⏱️ ETA 估算：基于历史路线统计的到达时间预测
//! - 📡 实时通道：WebSocket 推送，心跳与指数退避重连
//! - ⚙️ 事件系统：统一的状态变化回调
//!
//! # 快速开始
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fieldops_sdk::{FieldOpsConfig, FieldOpsSDK, Identity, MutationRequest, Role, SdkCollaborators, StaticAuthProvider};
//!
//! #[tokio::main]
//! async fn main() -> fieldops_sdk::Result<()> {
//!     fieldops_sdk::init_logging(false);
//!
//!     let config = FieldOpsConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://ops.example.com")
//!         .realtime_url("wss://ops.example.com/ws")
//!         .build()?;
//!
//!     let auth = Arc::new(StaticAuthProvider::new("token", Identity::new("u-1", Role::DeliveryBoy)));
//!     // 平台定位实现
//!     let geolocation = Arc::new(PlatformGeolocation::new());
//!     let sdk = FieldOpsSDK::initialize(config, SdkCollaborators::new(auth, geolocation)).await?;
//!
//!     sdk.subscribe("sync_flush_completed", |event| println!("{:?}", event));
//!     sdk.request_mutation(MutationRequest::update_status("d-42", "picked_up")).await?;
//!     println!("{:?}", sdk.get_sync_stats());
//!
//!     sdk.shutdown().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod eta;
pub mod events;
pub mod location;
pub mod mutation;
pub mod network;
pub mod permission;
pub mod realtime;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use config::{FieldOpsConfig, FieldOpsConfigBuilder, LocationConfig, RealtimeConfig, SyncConfig};
pub use error::{FieldOpsError, GeolocationError, Result};
pub use eta::{ChainStopEta, EtaEstimate, EtaEstimator, EtaModel};
pub use events::{EventFilter, EventManager, ListenerId, SDKEvent};
pub use location::{
    distance_km, distance_m, GeoPoint, GeolocationSource, LocationSample, LocationSampler, Position,
    PositionOptions, PositionResult, SubscriptionHandle,
};
pub use mutation::{MutationKind, MutationOutcome, MutationRequest};
pub use network::{ConnectivityMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use permission::{resolve, Capability, CapabilitySet, Identity, Role};
pub use realtime::{ChannelStatus, RealtimeChannel, RealtimeConnection, RealtimeConnector, WsConnector};
pub use sdk::{init_logging, FieldOpsSDK, SdkCollaborators};
pub use storage::queue::{HttpMethod, OperationStatus, SyncOperation, SyncOperationInput};
pub use storage::{
    EntityType, LocalStore, MemoryLocalStore, Record, RouteHistoryEntry, StopTiming, StoreName, SyncState,
    SyncStats,
};
pub use sync::{AuthProvider, FlushOutcome, HttpRemoteApi, RemoteApi, StaticAuthProvider};
pub use utils::{Clock, ManualClock, SystemClock};
pub use version::{SDK_VERSION, user_agent};
