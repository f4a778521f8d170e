#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use relay_core::{
    config::LayerConfig, Config, Direction, DomainEvent, Error, EventKind, Layer, LayerAdapter,
    LayerAdapters, Message, MessageEnvelope, MessageId, MessageStatus, MessageType, RelaySignature,
    Result, StatusReport, TxHandle,
};

#[derive(Default)]
struct LedgerState {
    statuses: HashMap<MessageId, StatusReport>,
    submissions: Vec<MessageId>,
    failing: bool,
    history: Vec<(u64, DomainEvent)>,
    pending_queue: Vec<MessageEnvelope>,
    head: u64,
    reported_failures: Vec<(MessageId, String)>,
    subscribed_from: Vec<Option<u64>>,
}

/// 内存中的脚本化账本
pub struct ScriptedLedger {
    layer: Layer,
    state: Mutex<LedgerState>,
    subscriber: Mutex<Option<mpsc::Sender<DomainEvent>>>,
}

impl ScriptedLedger {
    pub fn new(layer: Layer) -> Arc<Self> {
        Arc::new(Self {
            layer,
            state: Mutex::new(LedgerState::default()),
            subscriber: Mutex::new(None),
        })
    }

    pub fn set_status(&self, id: MessageId, status: MessageStatus) {
        self.state.lock().statuses.insert(
            id,
            StatusReport {
                status,
                confirmations: 1,
            },
        );
    }

    pub fn fail_submissions(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn record_history(&self, marker: u64, event: DomainEvent) {
        let mut state = self.state.lock();
        state.head = state.head.max(marker);
        state.history.push((marker, event));
    }

    pub fn enqueue_pending(&self, envelope: MessageEnvelope) {
        self.state.lock().pending_queue.push(envelope);
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    pub fn submissions_for(&self, id: &MessageId) -> usize {
        self.state.lock().submissions.iter().filter(|s| *s == id).count()
    }

    pub fn total_submissions(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// 每次订阅请求的起始标记
    pub fn subscriptions(&self) -> Vec<Option<u64>> {
        self.state.lock().subscribed_from.clone()
    }

    pub fn reported_failures(&self) -> Vec<(MessageId, String)> {
        self.state.lock().reported_failures.clone()
    }

    /// 通过订阅通道推送一个链上事件
    pub async fn emit(&self, event: DomainEvent) {
        let sender = self.subscriber.lock().clone();
        sender
            .expect("no subscriber attached")
            .send(event)
            .await
            .expect("subscriber dropped");
    }
}

#[async_trait]
impl LayerAdapter for ScriptedLedger {
    fn layer(&self) -> Layer {
        self.layer
    }

    async fn subscribe(&self, _kinds: &[EventKind], from: Option<u64>) -> Result<mpsc::Receiver<DomainEvent>> {
        self.state.lock().subscribed_from.push(from);
        let (tx, rx) = mpsc::channel(64);
        *self.subscriber.lock() = Some(tx);
        Ok(rx)
    }

    async fn query_status(&self, message_id: &MessageId) -> Result<StatusReport> {
        Ok(self
            .state
            .lock()
            .statuses
            .get(message_id)
            .copied()
            .unwrap_or(StatusReport {
                status: MessageStatus::Pending,
                confirmations: 0,
            }))
    }

    async fn submit_relay(&self, message: &Message, signature: &RelaySignature) -> Result<TxHandle> {
        signature.verify(&message.id)?;
        let mut state = self.state.lock();
        state.submissions.push(message.id);
        if state.failing {
            return Err(Error::Adapter(format!("{} rejected relay", self.layer)));
        }
        Ok(TxHandle(format!("0x{:04x}", state.submissions.len())))
    }

    async fn latest_marker(&self) -> Result<u64> {
        Ok(self.state.lock().head)
    }

    async fn query_events_in_range(&self, from: u64, to: u64) -> Result<Vec<DomainEvent>> {
        Ok(self
            .state
            .lock()
            .history
            .iter()
            .filter(|(marker, _)| (from..=to).contains(marker))
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn list_pending(&self) -> Result<Vec<MessageEnvelope>> {
        Ok(self.state.lock().pending_queue.clone())
    }

    async fn report_failure(&self, message: &Message, reason: &str) -> Result<()> {
        self.state
            .lock()
            .reported_failures
            .push((message.id, reason.to_string()));
        Ok(())
    }
}

pub fn adapters(l1: &Arc<ScriptedLedger>, l2: &Arc<ScriptedLedger>) -> LayerAdapters {
    LayerAdapters::new(l1.clone(), l2.clone()).expect("layers match")
}

pub fn config(max_retries: u32) -> Config {
    let mut config = Config::new(
        LayerConfig::new("ethereum", "http://127.0.0.1:8545", "0xbridge"),
        LayerConfig::new("rollup", "http://127.0.0.1:9545", "0xmessenger"),
    );
    config.relayer.max_retries = max_retries;
    config
}

pub fn envelope(direction: Direction, message_type: MessageType, nonce: u64) -> MessageEnvelope {
    MessageEnvelope::new(
        direction,
        "0x00000000000000000000000000000000000000aa",
        "0x00000000000000000000000000000000000000bb",
        message_type,
        nonce.to_be_bytes().to_vec(),
        nonce,
        1_700_000_000 + nonce,
    )
    .expect("envelope")
}
