//! 中继工作者管理
//!
//! 每条待处理消息对应一个长期运行的工作者任务，按固定（或指数）间隔重试中继。
//! 工作者句柄按消息 ID 存放，同一 ID 任何时刻至多一个工作者。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::LayerAdapters,
    config::RelayerConfig,
    notify::NotificationHub,
    signer::Signer,
    store::{AttemptGate, MessageStore},
    types::{Message, MessageId, MessageStatus},
};

pub const MAX_RETRIES_REASON: &str = "Max retries reached";

struct WorkerHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum CycleOutcome {
    /// 消息已离开待处理集合，工作者退出
    Stop,
    /// 等待确认或证明，不计入重试
    Wait,
    /// 第 n 次尝试失败
    Retry(u32),
}

struct Inner {
    store: Arc<MessageStore>,
    adapters: LayerAdapters,
    signer: Arc<dyn Signer>,
    notifications: NotificationHub,
    config: RelayerConfig,
    workers: Mutex<HashMap<MessageId, WorkerHandle>>,
    next_generation: AtomicU64,
    /// 暂停时不再启动新的工作者
    accepting: AtomicBool,
}

#[derive(Clone)]
pub struct RelayWorkerManager {
    inner: Arc<Inner>,
}

impl RelayWorkerManager {
    pub fn new(
        store: Arc<MessageStore>,
        adapters: LayerAdapters,
        signer: Arc<dyn Signer>,
        notifications: NotificationHub,
        config: RelayerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                adapters,
                signer,
                notifications,
                config,
                workers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// 为消息启动工作者；已暂停、已有工作者或消息不在待处理集合时不做任何事
    pub fn spawn(&self, message_id: MessageId) -> bool {
        let mut workers = self.inner.workers.lock();
        if !self.inner.accepting.load(Ordering::SeqCst) {
            debug!(message_id = %message_id, "Worker manager paused, message left pending");
            return false;
        }
        if workers.contains_key(&message_id) {
            debug!(message_id = %message_id, "Worker already active");
            return false;
        }
        if !self.inner.store.is_pending(&message_id) {
            debug!(message_id = %message_id, "Message not pending, no worker spawned");
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.inner).run(message_id, generation, cancel.clone()));
        workers.insert(
            message_id,
            WorkerHandle {
                generation,
                cancel,
                task,
            },
        );
        debug!(message_id = %message_id, generation, "Relay worker spawned");
        true
    }

    /// 恢复接受新的工作者
    pub fn resume(&self) {
        let _workers = self.inner.workers.lock();
        self.inner.accepting.store(true, Ordering::SeqCst);
    }

    /// 暂停：之后的 spawn 均为空操作，已有工作者不受影响
    pub fn pause(&self) {
        let _workers = self.inner.workers.lock();
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// 取消工作者并等待其退出，重复调用是安全的。
    /// 返回后可以立即为同一消息重新 spawn。
    pub async fn stop(&self, message_id: &MessageId) -> bool {
        let Some(handle) = self.inner.workers.lock().remove(message_id) else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            if e.is_panic() {
                error!(message_id = %message_id, "Relay worker panicked: {}", e);
            }
        }
        debug!(message_id = %message_id, "Relay worker stopped");
        true
    }

    /// 暂停并取消全部工作者，等待其退出；进行中的提交允许完成
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.inner.workers.lock();
            self.inner.accepting.store(false, Ordering::SeqCst);
            workers.drain().map(|(_, handle)| handle).collect()
        };
        let count = handles.len();
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.task.await {
                if e.is_panic() {
                    error!("Relay worker panicked during shutdown: {}", e);
                }
            }
        }
        info!(workers = count, "All relay workers stopped");
        count
    }

    pub fn is_active(&self, message_id: &MessageId) -> bool {
        self.inner.workers.lock().contains_key(message_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// 以终态移出待处理集合、停止工作者并发出通知。
    /// 消息已被其他路径终结时返回 None。
    pub fn retire(&self, message_id: &MessageId, status: MessageStatus, reason: Option<&str>) -> Option<Message> {
        self.inner.retire(message_id, status, reason)
    }

    /// 重试耗尽：标记失败，并通知来源链
    pub async fn mark_message_as_failed(&self, message_id: &MessageId, reason: &str) -> bool {
        self.inner.mark_message_as_failed(message_id, reason).await
    }
}

impl Inner {
    async fn run(self: Arc<Self>, message_id: MessageId, generation: u64, cancel: CancellationToken) {
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }

            delay = match self.relay_cycle(&message_id).await {
                CycleOutcome::Stop => break,
                CycleOutcome::Wait => Duration::from_secs(self.config.retry_interval),
                CycleOutcome::Retry(attempt) => self.config.delay_after(attempt),
            };
        }
        self.release(&message_id, generation);
    }

    /// 工作者自行退出时只移除属于自己的句柄
    fn release(&self, message_id: &MessageId, generation: u64) {
        let mut workers = self.workers.lock();
        if workers.get(message_id).map(|h| h.generation) == Some(generation) {
            workers.remove(message_id);
        }
    }

    async fn relay_cycle(&self, message_id: &MessageId) -> CycleOutcome {
        let message = match self
            .store
            .begin_attempt(message_id, self.config.require_zk_verification)
        {
            AttemptGate::Retired => {
                debug!(message_id = %message_id, "Message left pending set, worker exiting");
                return CycleOutcome::Stop;
            }
            AttemptGate::AwaitingConfirmation => return CycleOutcome::Wait,
            AttemptGate::AwaitingProof => {
                debug!(message_id = %message_id, "Waiting for proof verification");
                return CycleOutcome::Wait;
            }
            AttemptGate::Attempt(message) => message,
        };
        let attempt = message.retry_count;

        let signature = match self.signer.sign(message_id) {
            Ok(signature) => signature,
            Err(e) => {
                // 签名器可能稍后可用，不触发失败终态
                warn!(message_id = %message_id, attempt, "Cannot sign relay: {}", e);
                self.store.record_relay_failure(message_id, e.to_string());
                return CycleOutcome::Retry(attempt);
            }
        };

        let target = self.adapters.destination(message.direction);
        match target.submit_relay(&message, &signature).await {
            Ok(tx) => {
                if self.store.record_relay_success(message_id, tx.clone()) {
                    info!(
                        message_id = %message_id,
                        layer = %target.layer(),
                        tx = %tx,
                        attempt,
                        "Message relayed, awaiting confirmation"
                    );
                    self.notifications
                        .status_changed(*message_id, MessageStatus::Processing);
                } else {
                    debug!(message_id = %message_id, "Discarding stale relay result");
                }
                CycleOutcome::Wait
            }
            Err(e) => {
                if attempt >= self.config.max_retries {
                    error!(
                        message_id = %message_id,
                        max_retries = self.config.max_retries,
                        "Max retries reached for message relay. Last error: {}",
                        e
                    );
                    self.mark_message_as_failed(message_id, MAX_RETRIES_REASON).await;
                    return CycleOutcome::Stop;
                }
                warn!(
                    message_id = %message_id,
                    "Retry {}/{} for message relay. Error: {}",
                    attempt,
                    self.config.max_retries,
                    e
                );
                self.store.record_relay_failure(message_id, e.to_string());
                CycleOutcome::Retry(attempt)
            }
        }
    }

    fn retire(&self, message_id: &MessageId, status: MessageStatus, reason: Option<&str>) -> Option<Message> {
        let message = self.store.mark_processed(message_id, status)?;
        if let Some(handle) = self.workers.lock().remove(message_id) {
            handle.cancel.cancel();
        }

        self.notifications.status_changed(*message_id, status);
        match status {
            MessageStatus::Processed => self.notifications.processed(*message_id),
            MessageStatus::Failed => self
                .notifications
                .failed(*message_id, reason.unwrap_or("Failed")),
            _ => {}
        }
        info!(message_id = %message_id, status = %status, "Message retired");
        Some(message)
    }

    async fn mark_message_as_failed(&self, message_id: &MessageId, reason: &str) -> bool {
        let Some(failed) = self.retire(message_id, MessageStatus::Failed, Some(reason)) else {
            return false;
        };
        let origin = self.adapters.origin(failed.direction);
        if let Err(e) = origin.report_failure(&failed, reason).await {
            warn!(
                message_id = %message_id,
                layer = %origin.layer(),
                "Failed to report relay failure to origin layer: {}",
                e
            );
        }
        true
    }
}
