//! 消息存储
//!
//! 待处理集合 (Pending / Processing) 与已处理集合 (终态) 由同一把锁保护，
//! 插入去重与 "待处理 -> 已处理" 的迁移都是原子操作。

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::types::{Message, MessageId, MessageStatus, TxHandle};

#[derive(Default)]
struct Registry {
    pending: HashMap<MessageId, Message>,
    processed: HashMap<MessageId, Message>,
}

/// 一次中继尝试前的检查结果
#[derive(Debug, Clone)]
pub enum AttemptGate {
    /// 消息已离开待处理集合（或从未被跟踪）
    Retired,
    /// 中继已提交，等待状态监控器确认
    AwaitingConfirmation,
    /// 需要外部证明确认后才能中继
    AwaitingProof,
    /// 允许尝试，retry_count 已递增
    Attempt(Message),
}

#[derive(Default)]
pub struct MessageStore {
    registry: Mutex<Registry>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 原子的检查并插入；已跟踪（待处理或已处理）的消息返回 false
    pub fn put(&self, message: Message) -> bool {
        let mut registry = self.registry.lock();
        if registry.pending.contains_key(&message.id) || registry.processed.contains_key(&message.id) {
            debug!(message_id = %message.id, "Duplicate message ignored");
            return false;
        }
        if message.status.is_terminal() {
            registry.processed.insert(message.id, message);
        } else {
            registry.pending.insert(message.id, message);
        }
        true
    }

    pub fn get(&self, id: &MessageId) -> Option<Message> {
        let registry = self.registry.lock();
        registry
            .pending
            .get(id)
            .or_else(|| registry.processed.get(id))
            .cloned()
    }

    pub fn status(&self, id: &MessageId) -> Option<MessageStatus> {
        let registry = self.registry.lock();
        registry
            .pending
            .get(id)
            .or_else(|| registry.processed.get(id))
            .map(|m| m.status)
    }

    pub fn is_tracked(&self, id: &MessageId) -> bool {
        let registry = self.registry.lock();
        registry.pending.contains_key(id) || registry.processed.contains_key(id)
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.registry.lock().pending.contains_key(id)
    }

    /// 待处理消息快照，按来源时间排序
    pub fn all_pending(&self) -> Vec<Message> {
        let mut pending: Vec<Message> = self.registry.lock().pending.values().cloned().collect();
        pending.sort_by_key(|m| (m.timestamp, m.id));
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.registry.lock().pending.len()
    }

    pub fn processed_count(&self) -> usize {
        self.registry.lock().processed.len()
    }

    /// 将消息以终态移入已处理集合。
    ///
    /// 只有第一次调用成功；消息不在待处理集合时返回 None，
    /// 因此工作者与监控器不会重复迁移同一条消息。
    pub fn mark_processed(&self, id: &MessageId, status: MessageStatus) -> Option<Message> {
        if !status.is_terminal() {
            return None;
        }
        let mut registry = self.registry.lock();
        let mut message = registry.pending.remove(id)?;
        message.status = status;
        registry.processed.insert(*id, message.clone());
        Some(message)
    }

    pub(crate) fn begin_attempt(&self, id: &MessageId, require_proof: bool) -> AttemptGate {
        let mut registry = self.registry.lock();
        let Some(message) = registry.pending.get_mut(id) else {
            return AttemptGate::Retired;
        };
        if message.status == MessageStatus::Processing {
            return AttemptGate::AwaitingConfirmation;
        }
        if require_proof && message.awaiting_proof() {
            return AttemptGate::AwaitingProof;
        }
        message.retry_count += 1;
        AttemptGate::Attempt(message.clone())
    }

    /// 中继成功：Pending -> Processing。消息已离开待处理集合时丢弃结果。
    pub(crate) fn record_relay_success(&self, id: &MessageId, tx: TxHandle) -> bool {
        let mut registry = self.registry.lock();
        match registry.pending.get_mut(id) {
            Some(message) if message.status == MessageStatus::Pending => {
                message.status = MessageStatus::Processing;
                message.last_relayed = Some(Instant::now());
                message.tx_handle = Some(tx);
                message.last_error = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn record_relay_failure(&self, id: &MessageId, error: String) {
        if let Some(message) = self.registry.lock().pending.get_mut(id) {
            message.last_relayed = Some(Instant::now());
            message.last_error = Some(error);
        }
    }

    pub(crate) fn touch_checked(&self, id: &MessageId) {
        if let Some(message) = self.registry.lock().pending.get_mut(id) {
            message.last_checked = Some(Instant::now());
        }
    }

    /// 外部证明确认；已终结的消息不再变更
    pub fn mark_zk_verified(&self, id: &MessageId) -> bool {
        match self.registry.lock().pending.get_mut(id) {
            Some(message) => {
                message.zk_verified = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, MessageEnvelope, MessageType};

    fn message(nonce: u64) -> Message {
        let env = MessageEnvelope::new(
            Direction::L2ToL1,
            "0xsender",
            "0xtarget",
            MessageType::Generic,
            vec![nonce as u8],
            nonce,
            1_000 + nonce,
        )
        .unwrap();
        Message::from_envelope(env)
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = MessageStore::new();
        let m = message(1);
        assert!(store.put(m.clone()));
        assert!(!store.put(m.clone()));
        assert_eq!(store.pending_count(), 1);
        assert!(store.is_tracked(&m.id));
    }

    #[test]
    fn test_processed_message_is_never_reinserted() {
        let store = MessageStore::new();
        let m = message(1);
        store.put(m.clone());
        assert!(store.mark_processed(&m.id, MessageStatus::Processed).is_some());
        assert!(!store.put(m.clone()));
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.processed_count(), 1);
        assert_eq!(store.status(&m.id), Some(MessageStatus::Processed));
    }

    #[test]
    fn test_mark_processed_moves_exactly_once() {
        let store = MessageStore::new();
        let m = message(2);
        store.put(m.clone());
        assert!(store.mark_processed(&m.id, MessageStatus::Failed).is_some());
        assert!(store.mark_processed(&m.id, MessageStatus::Processed).is_none());
        assert_eq!(store.status(&m.id), Some(MessageStatus::Failed));
        assert!(!store.is_pending(&m.id));
    }

    #[test]
    fn test_mark_processed_rejects_non_terminal_status() {
        let store = MessageStore::new();
        let m = message(3);
        store.put(m.clone());
        assert!(store.mark_processed(&m.id, MessageStatus::Processing).is_none());
        assert!(store.is_pending(&m.id));
    }

    #[test]
    fn test_attempt_gate_transitions() {
        let store = MessageStore::new();
        let m = message(4);
        store.put(m.clone());

        match store.begin_attempt(&m.id, false) {
            AttemptGate::Attempt(msg) => assert_eq!(msg.retry_count, 1),
            other => panic!("unexpected gate: {other:?}"),
        }
        assert!(store.record_relay_success(&m.id, TxHandle("0xtx".into())));
        assert!(matches!(store.begin_attempt(&m.id, false), AttemptGate::AwaitingConfirmation));

        let current = store.get(&m.id).unwrap();
        assert_eq!(current.status, MessageStatus::Processing);
        assert_eq!(current.retry_count, 1);
        assert!(current.last_relayed.is_some());

        store.mark_processed(&m.id, MessageStatus::Processed);
        assert!(matches!(store.begin_attempt(&m.id, false), AttemptGate::Retired));
    }

    #[test]
    fn test_stale_relay_success_is_discarded() {
        let store = MessageStore::new();
        let m = message(5);
        store.put(m.clone());
        store.mark_processed(&m.id, MessageStatus::Canceled);
        assert!(!store.record_relay_success(&m.id, TxHandle("0xtx".into())));
        assert_eq!(store.status(&m.id), Some(MessageStatus::Canceled));
    }

    #[test]
    fn test_all_pending_snapshot_is_ordered() {
        let store = MessageStore::new();
        for nonce in [3, 1, 2] {
            store.put(message(nonce));
        }
        let done = message(9);
        store.put(done.clone());
        store.mark_processed(&done.id, MessageStatus::Processed);

        let timestamps: Vec<u64> = store.all_pending().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1_001, 1_002, 1_003]);
    }

    #[test]
    fn test_zk_verification_gate() {
        let store = MessageStore::new();
        let mut m = message(6);
        m.has_zk_proof = true;
        store.put(m.clone());

        assert!(matches!(store.begin_attempt(&m.id, true), AttemptGate::AwaitingProof));
        assert_eq!(store.get(&m.id).unwrap().retry_count, 0);
        assert!(store.mark_zk_verified(&m.id));
        assert!(matches!(store.begin_attempt(&m.id, true), AttemptGate::Attempt(_)));
    }
}
