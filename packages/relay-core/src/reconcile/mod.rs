//! 对账扫描
//!
//! 启动时（以及按需、周期性地）查询两条链上已存在但未被跟踪的消息，
//! 作为 Pending 写入消息存储并启动工作者。已处理过的消息永不重新写入。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    adapter::{LayerAdapter, LayerAdapters},
    config::ReconciliationConfig,
    notify::NotificationHub,
    relayer::RelayWorkerManager,
    store::MessageStore,
    types::{Layer, Message, MessageEnvelope},
    Result,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// 扫描到的候选消息（含已跟踪的）
    pub discovered: usize,
    /// 新写入存储的消息
    pub seeded: usize,
    pub failed_layers: Vec<Layer>,
}

pub struct ReconciliationScanner {
    store: Arc<MessageStore>,
    adapters: LayerAdapters,
    workers: RelayWorkerManager,
    notifications: NotificationHub,
    config: ReconciliationConfig,
    /// 每条链下一次扫描的起始标记
    cursors: Mutex<HashMap<Layer, u64>>,
}

impl ReconciliationScanner {
    pub fn new(
        store: Arc<MessageStore>,
        adapters: LayerAdapters,
        workers: RelayWorkerManager,
        notifications: NotificationHub,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            workers,
            notifications,
            config,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// 单条链的查询失败只记录日志，不影响另一条链
    pub async fn run_once(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();

        for layer in [Layer::L2, Layer::L1] {
            let adapter = self.adapters.get(layer);
            match self.discover(layer, adapter.as_ref()).await {
                Ok(envelopes) => {
                    report.discovered += envelopes.len();
                    for envelope in envelopes {
                        if self.seed(envelope) {
                            report.seeded += 1;
                        }
                    }
                }
                Err(e) => {
                    error!(layer = %layer, "Reconciliation query failed, skipping layer: {}", e);
                    report.failed_layers.push(layer);
                }
            }
        }

        info!(
            discovered = report.discovered,
            seeded = report.seeded,
            failed_layers = report.failed_layers.len(),
            "Reconciliation finished"
        );
        report
    }

    async fn discover(&self, layer: Layer, adapter: &dyn LayerAdapter) -> Result<Vec<MessageEnvelope>> {
        let latest = adapter.latest_marker().await?;
        let from = self
            .cursors
            .lock()
            .get(&layer)
            .copied()
            .unwrap_or_else(|| latest.saturating_sub(self.config.lookback));

        let mut envelopes: Vec<MessageEnvelope> = if from <= latest {
            adapter
                .query_events_in_range(from, latest)
                .await?
                .into_iter()
                .filter_map(|event| event.envelope().cloned())
                // 只认本链发出的消息
                .filter(|env| env.direction.origin() == layer)
                .collect()
        } else {
            Vec::new()
        };
        envelopes.extend(
            adapter
                .list_pending()
                .await?
                .into_iter()
                .filter(|env| env.direction.origin() == layer),
        );

        self.cursors.lock().insert(layer, latest + 1);
        debug!(layer = %layer, from, to = latest, found = envelopes.len(), "Scanned layer history");
        Ok(envelopes)
    }

    /// 上次成功扫描之后的第一个标记；该链从未扫描成功时为 None
    pub fn resume_marker(&self, layer: Layer) -> Option<u64> {
        self.cursors.lock().get(&layer).copied()
    }

    fn seed(&self, envelope: MessageEnvelope) -> bool {
        if self.store.is_tracked(&envelope.message_id) {
            return false;
        }
        let message = Message::from_envelope(envelope);
        let (id, direction) = (message.id, message.direction);
        if !self.store.put(message) {
            return false;
        }
        info!(message_id = %id, direction = %direction, "Recovered untracked message");
        self.notifications.new_message(id, direction);
        self.workers.spawn(id);
        true
    }

    /// 按配置周期性重新扫描；未配置周期时返回 None
    pub fn spawn_periodic(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = Duration::from_secs(self.config.rescan_interval?);
        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
        }))
    }
}
