//! 同步模块
//!
//! - `sync_engine`：发件箱 flush
//! - `remote`：REST 传输
//! - `auth`：外部认证协作方

pub mod auth;
pub mod remote;
pub mod sync_engine;

pub use auth::{AuthProvider, StaticAuthProvider};
pub use remote::{HttpRemoteApi, RemoteApi, IDEMPOTENCY_KEY_HEADER};
pub use sync_engine::{FlushOutcome, SyncEngine};
