/// 同步引擎
///
/// 职责：
/// - 把发件箱中的操作按 FIFO 发往服务端（不同实体之间并发，同一实体串行）
/// - 根据结果推进操作状态机并更新记录的同步状态
/// - 401 时通知认证协作方并中止本轮
///
/// 触发方式只有两种：网络恢复（ConnectivityMonitor）和调用方主动请求。

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FieldOpsError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::network::FlushTrigger;
use crate::storage::queue::{FailureOutcome, FailureReason, SyncOperation, SyncQueue};
use crate::storage::{EntityType, RecordStore, SyncState};
use crate::sync::auth::AuthProvider;
use crate::sync::remote::RemoteApi;
use crate::utils::time::format_ms;
use crate::utils::Clock;

/// 一轮 flush 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub synced: usize,
    pub failed: usize,
}

enum Settled {
    Synced,
    Failed,
    AuthExpired,
}

/// 处理标志的 RAII 守卫，drop 时复位
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ProcessingGuard(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    queue: Arc<SyncQueue>,
    records: RecordStore,
    remote: Arc<dyn RemoteApi>,
    auth: Arc<dyn AuthProvider>,
    online: watch::Receiver<bool>,
    events: Arc<EventManager>,
    clock: Arc<dyn Clock>,
    max_concurrency: usize,
    processing: AtomicBool,
    rerun_requested: AtomicBool,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("max_concurrency", &self.max_concurrency)
            .field("processing", &self.processing.load(Ordering::Relaxed))
            .finish()
    }
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<SyncQueue>,
        records: RecordStore,
        remote: Arc<dyn RemoteApi>,
        auth: Arc<dyn AuthProvider>,
        online: watch::Receiver<bool>,
        events: Arc<EventManager>,
        clock: Arc<dyn Clock>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            queue,
            records,
            remote,
            auth,
            online,
            events,
            clock,
            max_concurrency: max_concurrency.max(1),
            processing: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// 发送所有可发送的操作
    ///
    /// 已有 flush 在进行或当前离线时立即返回 `{0, 0}`；
    /// 被拒绝的调用会让正在进行的 flush 在释放前再跑一轮
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        if !self.is_online() {
            debug!("离线，跳过 flush");
            return outcome;
        }
        let mut guard = match ProcessingGuard::acquire(&self.processing) {
            Some(guard) => Some(guard),
            None => {
                self.rerun_requested.store(true, Ordering::SeqCst);
                // 持有方可能刚好已经释放
                match ProcessingGuard::acquire(&self.processing) {
                    Some(guard) => Some(guard),
                    None => {
                        debug!("flush 正在进行，本次调用直接返回");
                        return outcome;
                    }
                }
            }
        };

        // 本轮失败过的实体不再重试，避免同一轮内反复撞同一个错误
        let mut failed_entities: HashSet<(EntityType, String)> = HashSet::new();
        let mut auth_expired = false;

        while let Some(held) = guard.take() {
            self.rerun_requested.store(false, Ordering::SeqCst);
            auth_expired = self.drain(&mut failed_entities, &mut outcome).await;
            drop(held);
            if auth_expired {
                break;
            }
            if self.rerun_requested.swap(false, Ordering::SeqCst) && self.is_online() {
                debug!("flush 期间有新的请求，再跑一轮");
                guard = ProcessingGuard::acquire(&self.processing);
            }
        }

        if auth_expired {
            warn!("🔐 服务端返回 401，本轮 flush 中止");
            self.events.emit(SDKEvent::AuthExpired {
                timestamp: self.clock.now_ms(),
            });
            self.auth.on_auth_expired().await;
        }

        info!("flush 完成: synced={} failed={}", outcome.synced, outcome.failed);
        self.events.emit(SDKEvent::SyncFlushCompleted {
            synced: outcome.synced,
            failed: outcome.failed,
            timestamp: self.clock.now_ms(),
        });
        outcome
    }

    /// 发到队列为空为止；返回是否遇到 401
    async fn drain(&self, failed_entities: &mut HashSet<(EntityType, String)>, outcome: &mut FlushOutcome) -> bool {
        while self.is_online() {
            let batch = match self
                .queue
                .next_batch_excluding(self.max_concurrency, failed_entities)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!("读取发件箱失败: {}", e);
                    return false;
                }
            };
            if batch.is_empty() {
                return false;
            }

            for op in &batch {
                self.update_record_state(op.entity_type, &op.entity_id, || SyncState::Syncing)
                    .await;
            }

            let token = self.auth.access_token();
            let results: Vec<(SyncOperation, Result<Option<serde_json::Value>>)> = stream::iter(batch)
                .map(|op| {
                    let remote = self.remote.clone();
                    let token = token.clone();
                    async move {
                        let result = remote.send_operation(&op, token.as_deref()).await;
                        (op, result)
                    }
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

            let mut auth_expired = false;
            for (op, result) in results {
                let key = op.entity_key();
                match self.settle(op, result).await {
                    Ok(Settled::Synced) => outcome.synced += 1,
                    Ok(Settled::Failed) => {
                        outcome.failed += 1;
                        failed_entities.insert(key);
                    }
                    Ok(Settled::AuthExpired) => auth_expired = true,
                    Err(e) => {
                        error!("更新同步操作状态失败: {}", e);
                        outcome.failed += 1;
                        failed_entities.insert(key);
                    }
                }
            }

            if auth_expired {
                return true;
            }
        }
        false
    }

    async fn settle(&self, op: SyncOperation, result: Result<Option<serde_json::Value>>) -> Result<Settled> {
        let (updated, settled) = match result {
            Ok(_) => (self.queue.mark_completed(&op.id).await?, Settled::Synced),
            Err(FieldOpsError::AuthExpired) => (self.queue.release(&op.id).await?, Settled::AuthExpired),
            Err(e) if !FailureReason::from(&e).is_retryable() => {
                error!("同步操作被拒绝: op={} endpoint={} error={}", op.id, op.endpoint, e);
                (self.queue.mark_terminal(&op.id, &e).await?, Settled::Failed)
            }
            Err(e) => {
                let (updated, failure) = self.queue.mark_failed(&op.id, &e).await?;
                if failure == FailureOutcome::Terminal {
                    error!("同步操作重试次数耗尽: op={} error={}", op.id, e);
                } else {
                    warn!(
                        "同步操作失败，{} 后重试: op={} attempts={} error={}",
                        format_ms(updated.next_attempt_at),
                        op.id,
                        updated.attempts,
                        e
                    );
                }
                (updated, Settled::Failed)
            }
        };

        self.events.emit(SDKEvent::SyncOperationUpdated {
            operation_id: updated.id.clone(),
            entity_type: updated.entity_type,
            entity_id: updated.entity_id.clone(),
            status: updated.status,
            attempts: updated.attempts,
            last_error: updated.last_error.clone(),
            timestamp: self.clock.now_ms(),
        });

        // 在实体锁内判断：锁外入队的新变更会让记录保持 dirty
        let queue = &self.queue;
        let (entity_type, entity_id) = (updated.entity_type, updated.entity_id.as_str());
        self.update_record_state(entity_type, entity_id, || {
            if queue.has_outstanding(entity_type, entity_id) {
                SyncState::Dirty
            } else {
                SyncState::Synced
            }
        })
        .await;
        Ok(settled)
    }

    /// 记录状态更新失败不影响同步流程，只记日志
    async fn update_record_state<F>(&self, entity_type: EntityType, entity_id: &str, decide: F)
    where
        F: FnOnce() -> SyncState + Send,
    {
        match self.records.settle_sync_state(entity_type, entity_id, decide).await {
            Ok(Some(record)) => self.events.emit(SDKEvent::RecordSyncStateChanged {
                entity_type,
                entity_id: entity_id.to_string(),
                sync_state: record.sync_state,
                timestamp: self.clock.now_ms(),
            }),
            Ok(None) => {}
            Err(e) => warn!("更新记录同步状态失败 {}:{}: {}", entity_type, entity_id, e),
        }
    }
}

#[async_trait]
impl FlushTrigger for SyncEngine {
    async fn trigger_flush(&self) {
        let outcome = self.flush().await;
        debug!("网络恢复触发 flush: {:?}", outcome);
    }
}
