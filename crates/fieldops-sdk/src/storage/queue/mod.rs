//! 发件箱（SyncQueue）- 基于 LocalStore 的有序待同步操作队列
//!
//! - 操作按入队序号 FIFO 排列，持久化在 `syncQueue` store
//! - 同一实体同一时刻最多一个 inFlight 操作
//! - 同一实体的操作严格按入队顺序放行；不同实体之间可以交错
//! - failed-terminal 操作仍占据实体队头，后续操作等待人工重试或丢弃
//! - 内存状态由非异步锁保护，选择与置为 inFlight 在同一步完成

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{FieldOpsError, Result};
use crate::storage::entities::{EntityType, StoreName};
use crate::storage::local_store::LocalStore;
use crate::utils::Clock;

pub mod retry_policy;
pub mod sync_operation;

pub use retry_policy::{FailureReason, RetryPolicy};
pub use sync_operation::{HttpMethod, OperationStatus, SyncOperation, SyncOperationInput};

/// 发件箱统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// 待发送与发送中
    pub pending: usize,
    /// 本次进程生命周期内已完成
    pub completed: usize,
    /// failed-terminal，等待人工处理
    pub failed: usize,
    pub total: usize,
}

/// markFailed 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// 已回到 pending，等待退避结束
    Retrying { next_attempt_at: i64 },
    /// 超过最大次数或不可重试
    Terminal,
}

#[derive(Debug, Default)]
struct QueueState {
    /// seq -> operation
    ops: BTreeMap<u64, SyncOperation>,
    next_seq: u64,
    completed: usize,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Option<&mut SyncOperation> {
        self.ops.values_mut().find(|op| op.id == id)
    }

    fn seq_of(&self, id: &str) -> Option<u64> {
        self.ops.values().find(|op| op.id == id).map(|op| op.seq)
    }
}

#[derive(Debug)]
pub struct SyncQueue {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
}

impl SyncQueue {
    /// 从 LocalStore 恢复发件箱；崩溃前处于 inFlight 的操作重置为 pending
    pub async fn open(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Result<Self> {
        let records = store.get_all(StoreName::SyncQueue).await?;
        let mut state = QueueState::default();
        let mut recovered = Vec::new();

        for record in &records {
            match SyncOperation::from_record(record) {
                Ok(mut op) => {
                    if op.status == OperationStatus::InFlight {
                        op.status = OperationStatus::Pending;
                        recovered.push(op.clone());
                    }
                    state.next_seq = state.next_seq.max(op.seq + 1);
                    state.ops.insert(op.seq, op);
                }
                Err(e) => warn!("跳过无法解析的同步操作 {}: {}", record.id, e),
            }
        }

        for op in &recovered {
            store.put(StoreName::SyncQueue, &op.to_record()?).await?;
        }

        info!(
            "发件箱已恢复: {} 条操作（{} 条 inFlight 重置为 pending）",
            state.ops.len(),
            recovered.len()
        );

        Ok(Self {
            store,
            clock,
            policy,
            state: Mutex::new(state),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 入队，生成稳定的幂等键
    #[instrument(skip(self, input), fields(entity = %input.entity_id))]
    pub async fn enqueue(&self, input: SyncOperationInput) -> Result<SyncOperation> {
        if input.entity_id.trim().is_empty() {
            return Err(FieldOpsError::Validation("entity_id 不能为空".to_string()));
        }
        if !input.endpoint.starts_with('/') {
            return Err(FieldOpsError::Validation(format!("非法 endpoint: {}", input.endpoint)));
        }

        let now = self.clock.now_ms();
        let op = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let op = SyncOperation::from_input(input, seq, now);
            state.ops.insert(seq, op.clone());
            op
        };

        if let Err(e) = self.persist(&op).await {
            self.state.lock().ops.remove(&op.seq);
            return Err(e);
        }

        debug!("同步操作已入队: id={} seq={} endpoint={}", op.id, op.seq, op.endpoint);
        Ok(op)
    }

    /// 取出可发送的操作并置为 inFlight
    pub async fn next_batch(&self, limit: usize) -> Result<Vec<SyncOperation>> {
        self.next_batch_excluding(limit, &HashSet::new()).await
    }

    /// 同 [`next_batch`](Self::next_batch)，但跳过 `excluded` 中的实体
    pub async fn next_batch_excluding(
        &self,
        limit: usize,
        excluded: &HashSet<(EntityType, String)>,
    ) -> Result<Vec<SyncOperation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_ms();

        let batch = {
            let mut state = self.state.lock();
            let mut heads: HashSet<(EntityType, String)> = HashSet::new();
            let mut picked: Vec<u64> = Vec::new();

            for op in state.ops.values() {
                let key = op.entity_key();
                // 每个实体只看最早的一条操作；failed-terminal 的队头在重试或丢弃前挡住后续操作
                if !heads.insert(key.clone()) {
                    continue;
                }
                if op.is_eligible(now) && !excluded.contains(&key) {
                    picked.push(op.seq);
                    if picked.len() >= limit {
                        break;
                    }
                }
            }

            let mut batch = Vec::with_capacity(picked.len());
            for seq in picked {
                if let Some(op) = state.ops.get_mut(&seq) {
                    op.transition(OperationStatus::InFlight)?;
                    batch.push(op.clone());
                }
            }
            batch
        };

        for op in &batch {
            if let Err(e) = self.persist(op).await {
                let mut state = self.state.lock();
                for op in &batch {
                    if let Some(op) = state.ops.get_mut(&op.seq) {
                        op.status = OperationStatus::Pending;
                    }
                }
                return Err(e);
            }
        }

        Ok(batch)
    }

    /// 发送成功：操作出队并销毁
    pub async fn mark_completed(&self, id: &str) -> Result<SyncOperation> {
        let op = {
            let mut state = self.state.lock();
            let seq = state
                .seq_of(id)
                .ok_or_else(|| FieldOpsError::NotFound(format!("同步操作不存在: {}", id)))?;
            let mut op = state.ops.remove(&seq).ok_or_else(|| FieldOpsError::NotFound(id.to_string()))?;
            if let Err(e) = op.transition(OperationStatus::Completed) {
                state.ops.insert(seq, op);
                return Err(e);
            }
            state.completed += 1;
            op
        };

        self.store.delete(StoreName::SyncQueue, &op.id).await?;
        debug!("同步操作完成: id={} entity={}", op.id, op.entity_id);
        Ok(op)
    }

    /// 发送失败：累加 attempts，未超限则带退避回到 pending，否则 failed-terminal
    pub async fn mark_failed(&self, id: &str, error: &FieldOpsError) -> Result<(SyncOperation, FailureOutcome)> {
        let reason = FailureReason::from(error);
        let now = self.clock.now_ms();

        let (op, outcome) = {
            let mut state = self.state.lock();
            let op = state
                .find_mut(id)
                .ok_or_else(|| FieldOpsError::NotFound(format!("同步操作不存在: {}", id)))?;
            op.attempts += 1;
            op.last_error = Some(error.to_string());

            let outcome = if self.policy.should_retry(op.attempts, &reason) {
                op.transition(OperationStatus::FailedRetryable)?;
                op.transition(OperationStatus::Pending)?;
                op.next_attempt_at = self.policy.next_attempt_at(now, op.attempts);
                FailureOutcome::Retrying {
                    next_attempt_at: op.next_attempt_at,
                }
            } else {
                op.transition(OperationStatus::FailedTerminal)?;
                FailureOutcome::Terminal
            };
            (op.clone(), outcome)
        };

        self.persist(&op).await?;
        match &outcome {
            FailureOutcome::Retrying { next_attempt_at } => debug!(
                "同步操作失败，将重试: id={} attempts={} next_attempt_at={}",
                op.id, op.attempts, next_attempt_at
            ),
            FailureOutcome::Terminal => warn!(
                "同步操作进入 failed-terminal: id={} attempts={} error={:?}",
                op.id, op.attempts, op.last_error
            ),
        }
        Ok((op, outcome))
    }

    /// 服务端永久拒绝：直接进入 failed-terminal
    pub async fn mark_terminal(&self, id: &str, error: &FieldOpsError) -> Result<SyncOperation> {
        let op = {
            let mut state = self.state.lock();
            let op = state
                .find_mut(id)
                .ok_or_else(|| FieldOpsError::NotFound(format!("同步操作不存在: {}", id)))?;
            op.attempts += 1;
            op.last_error = Some(error.to_string());
            op.transition(OperationStatus::FailedTerminal)?;
            op.clone()
        };
        self.persist(&op).await?;
        warn!("同步操作被服务端拒绝: id={} error={}", op.id, error);
        Ok(op)
    }

    /// inFlight -> pending，不消耗重试次数（用于 401）
    pub async fn release(&self, id: &str) -> Result<SyncOperation> {
        let op = {
            let mut state = self.state.lock();
            let op = state
                .find_mut(id)
                .ok_or_else(|| FieldOpsError::NotFound(format!("同步操作不存在: {}", id)))?;
            op.transition(OperationStatus::Pending)?;
            op.clone()
        };
        self.persist(&op).await?;
        Ok(op)
    }

    /// 人工重试 failed-terminal 操作：attempts 清零，立即可发送
    pub async fn retry_terminal(&self, id: &str) -> Result<SyncOperation> {
        let now = self.clock.now_ms();
        let op = {
            let mut state = self.state.lock();
            let op = state
                .find_mut(id)
                .ok_or_else(|| FieldOpsError::NotFound(format!("同步操作不存在: {}", id)))?;
            if op.status != OperationStatus::FailedTerminal {
                return Err(FieldOpsError::InvalidOperation(format!(
                    "只能重试 failed-terminal 操作，当前状态: {}",
                    op.status
                )));
            }
            op.transition(OperationStatus::Pending)?;
            op.attempts = 0;
            op.next_attempt_at = now;
            op.clone()
        };
        self.persist(&op).await?;
        info!("failed-terminal 操作已重新入队: id={}", op.id);
        Ok(op)
    }

    /// 人工丢弃 failed-terminal 操作
    pub async fn discard_terminal(&self, id: &str) -> Result<SyncOperation> {
        let op = {
            let mut state = self.state.lock();
            let seq = state
                .seq_of(id)
                .ok_or_else(|| FieldOpsError::NotFound(format!("同步操作不存在: {}", id)))?;
            match state.ops.get(&seq) {
                Some(op) if op.status == OperationStatus::FailedTerminal => {}
                Some(op) => {
                    return Err(FieldOpsError::InvalidOperation(format!(
                        "只能丢弃 failed-terminal 操作，当前状态: {}",
                        op.status
                    )))
                }
                None => return Err(FieldOpsError::NotFound(id.to_string())),
            }
            state.ops.remove(&seq).ok_or_else(|| FieldOpsError::NotFound(id.to_string()))?
        };
        self.store.delete(StoreName::SyncQueue, &op.id).await?;
        info!("failed-terminal 操作已丢弃: id={}", op.id);
        Ok(op)
    }

    pub fn get(&self, id: &str) -> Option<SyncOperation> {
        self.state.lock().ops.values().find(|op| op.id == id).cloned()
    }

    /// 全部操作（FIFO 顺序）
    pub fn operations(&self) -> Vec<SyncOperation> {
        self.state.lock().ops.values().cloned().collect()
    }

    pub fn terminal_failures(&self) -> Vec<SyncOperation> {
        self.state
            .lock()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::FailedTerminal)
            .cloned()
            .collect()
    }

    /// 实体是否还有待发送或发送中的操作
    pub fn has_outstanding(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.state
            .lock()
            .ops
            .values()
            .any(|op| op.entity_type == entity_type && op.entity_id == entity_id && op.status.is_outstanding())
    }

    pub fn stats(&self) -> SyncStats {
        let state = self.state.lock();
        let mut stats = SyncStats {
            completed: state.completed,
            ..SyncStats::default()
        };
        for op in state.ops.values() {
            if op.status.is_outstanding() {
                stats.pending += 1;
            } else if op.status == OperationStatus::FailedTerminal {
                stats.failed += 1;
            }
        }
        stats.total = stats.pending + stats.completed + stats.failed;
        stats
    }

    async fn persist(&self, op: &SyncOperation) -> Result<()> {
        self.store.put(StoreName::SyncQueue, &op.to_record()?).await
    }
}
