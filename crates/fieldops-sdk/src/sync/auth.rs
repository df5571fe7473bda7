//! 外部认证协作方
//!
//! SDK 不负责登录；宿主注入 token 与当前身份，并在收到 401 后刷新凭证。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

use crate::permission::Identity;

#[async_trait]
pub trait AuthProvider: Debug + Send + Sync {
    /// 当前的 bearer token，None 表示未登录
    fn access_token(&self) -> Option<String>;

    fn identity(&self) -> Option<Identity>;

    /// 服务端返回 401 时调用；宿主可以在这里刷新 token
    async fn on_auth_expired(&self);
}

/// 由宿主直接设置凭证的简单实现
#[derive(Debug, Default)]
pub struct StaticAuthProvider {
    token: RwLock<Option<String>>,
    identity: RwLock<Option<Identity>>,
    expired_count: AtomicUsize,
}

impl StaticAuthProvider {
    pub fn new(token: impl Into<String>, identity: Identity) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            identity: RwLock::new(Some(identity)),
            expired_count: AtomicUsize::new(0),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    pub fn set_identity(&self, identity: Option<Identity>) {
        *self.identity.write() = identity;
    }

    /// 收到 401 的次数
    pub fn expired_count(&self) -> usize {
        self.expired_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    async fn on_auth_expired(&self) {
        self.expired_count.fetch_add(1, Ordering::SeqCst);
        warn!("🔐 认证已过期，等待宿主刷新 token");
    }
}
