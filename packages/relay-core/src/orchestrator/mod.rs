//! 编排器门面：组装消息存储、工作者管理、状态监控与对账扫描，
//! 对外提供 start / stop、事件入口与通知订阅。

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::LayerAdapters,
    config::Config,
    monitor::{StatusMonitor, SweepReport},
    notify::{Notification, NotificationHub},
    reconcile::{ReconciliationReport, ReconciliationScanner},
    relayer::RelayWorkerManager,
    signer::{Ed25519Signer, Signer},
    store::MessageStore,
    types::{Direction, DomainEvent, Layer, Message, MessageEnvelope, MessageId, MessageStatus},
    Error, Result,
};

/// 领域事件分发，处理过程只做插入与启动工作者，不阻塞
#[derive(Clone)]
struct Dispatcher {
    store: Arc<MessageStore>,
    workers: RelayWorkerManager,
    notifications: NotificationHub,
}

impl Dispatcher {
    fn dispatch(&self, event: DomainEvent) {
        match event {
            DomainEvent::L2MessageSent(envelope)
            | DomainEvent::RiskScoreUpdated(envelope)
            | DomainEvent::CollateralChanged(envelope)
            | DomainEvent::Liquidation(envelope) => {
                self.track(envelope);
            }
            DomainEvent::L2MessageProcessed { message_id } => self.confirm_on_l2(message_id),
            DomainEvent::ZkProofVerified { message_id } => {
                if self.store.mark_zk_verified(&message_id) {
                    info!(message_id = %message_id, "ZK proof verified");
                } else {
                    debug!(message_id = %message_id, "Proof verification for untracked or finished message");
                }
            }
        }
    }

    fn track(&self, envelope: MessageEnvelope) -> bool {
        let message = Message::from_envelope(envelope);
        let (id, direction) = (message.id, message.direction);
        if !self.store.put(message) {
            return false;
        }
        info!(message_id = %id, direction = %direction, "New cross-layer message");
        self.notifications.new_message(id, direction);
        self.workers.spawn(id);
        true
    }

    /// L2 上报已处理的 L1->L2 消息，无需等待下一轮状态扫描
    fn confirm_on_l2(&self, message_id: MessageId) {
        match self.store.get(&message_id) {
            Some(message) if message.direction == Direction::L1ToL2 => {
                self.workers.retire(&message_id, MessageStatus::Processed, None);
            }
            Some(message) => {
                warn!(
                    message_id = %message_id,
                    direction = %message.direction,
                    "L2 processed event for a message not addressed to L2"
                );
            }
            None => debug!(message_id = %message_id, "Processed event for untracked message"),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Orchestrator {
    config: Config,
    store: Arc<MessageStore>,
    adapters: LayerAdapters,
    notifications: NotificationHub,
    workers: RelayWorkerManager,
    monitor: Arc<StatusMonitor>,
    scanner: Arc<ReconciliationScanner>,
    dispatcher: Dispatcher,
    running: Mutex<Option<Running>>,
}

impl Orchestrator {
    pub fn new(config: Config, adapters: LayerAdapters, signer: Arc<dyn Signer>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(MessageStore::new());
        let notifications = NotificationHub::new(config.notification_capacity);
        let workers = RelayWorkerManager::new(
            store.clone(),
            adapters.clone(),
            signer,
            notifications.clone(),
            config.relayer.clone(),
        );
        // 未运行时只记录消息，工作者在 start() 时统一启动
        workers.pause();
        let monitor = Arc::new(StatusMonitor::new(
            store.clone(),
            adapters.clone(),
            workers.clone(),
            config.monitor.clone(),
        ));
        let scanner = Arc::new(ReconciliationScanner::new(
            store.clone(),
            adapters.clone(),
            workers.clone(),
            notifications.clone(),
            config.reconciliation.clone(),
        ));
        let dispatcher = Dispatcher {
            store: store.clone(),
            workers: workers.clone(),
            notifications: notifications.clone(),
        };

        Ok(Self {
            config,
            store,
            adapters,
            notifications,
            workers,
            monitor,
            scanner,
            dispatcher,
            running: Mutex::new(None),
        })
    }

    /// 使用 JSON-RPC 适配器与配置中的签名身份创建编排器
    pub fn from_config(config: Config) -> Result<Self> {
        let adapters = LayerAdapters::from_config(&config)?;
        let signer = Ed25519Signer::from_config(&config.signer)?;
        if signer.identity().is_none() {
            warn!("No signing identity configured, relays will be retried until one is available");
        }
        Self::new(config, adapters, Arc::new(signer))
    }

    /// 启动：先对账并为存储中所有待处理消息启动工作者，再从对账结束的位置
    /// 订阅两条链的事件，最后启动状态监控（及周期对账）。单条链订阅失败只记录日志。
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }
        info!(l1 = %self.config.l1.name, l2 = %self.config.l2.name, "Starting orchestrator");

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        self.workers.resume();
        self.scanner.run_once().await;
        self.resume_pending();

        for layer in [Layer::L2, Layer::L1] {
            let filters = &self.config.layer(layer).event_filters;
            let from = self.scanner.resume_marker(layer);
            if from.is_none() {
                warn!(layer = %layer, "No reconciled marker, subscribing from the current head");
            }
            match self.adapters.get(layer).subscribe(filters, from).await {
                Ok(events) => tasks.push(self.spawn_event_pump(layer, events, cancel.clone())),
                Err(e) => error!(layer = %layer, "Failed to subscribe to layer events: {}", e),
            }
        }

        tasks.push(Arc::clone(&self.monitor).spawn(cancel.clone()));
        if let Some(task) = Arc::clone(&self.scanner).spawn_periodic(cancel.clone()) {
            tasks.push(task);
        }

        *running = Some(Running { cancel, tasks });
        info!("Orchestrator started");
        Ok(())
    }

    /// 上次运行遗留或停止期间记录的待处理消息
    fn resume_pending(&self) -> usize {
        let resumed = self
            .store
            .all_pending()
            .iter()
            .filter(|message| self.workers.spawn(message.id))
            .count();
        if resumed > 0 {
            info!(workers = resumed, "Resumed workers for pending messages");
        }
        resumed
    }

    fn spawn_event_pump(
        &self,
        layer: Layer,
        mut events: mpsc::Receiver<DomainEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => dispatcher.dispatch(event),
                        None => {
                            warn!(layer = %layer, "Event subscription closed");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// 停止全部周期任务与工作者；未运行时为空操作
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        info!("Stopping orchestrator");
        self.workers.pause();
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Orchestrator task panicked: {}", e);
                }
            }
        }
        let stopped = self.workers.shutdown().await;
        info!(workers = stopped, "Orchestrator stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// 外部事件入口（同步、非阻塞）。未运行时只写入存储，不启动工作者。
    pub fn handle_event(&self, event: DomainEvent) {
        self.dispatcher.dispatch(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// 外部取消：Pending / Processing -> Canceled
    pub fn cancel_message(&self, message_id: &MessageId) -> bool {
        self.workers
            .retire(message_id, MessageStatus::Canceled, None)
            .is_some()
    }

    /// 按需对账；未运行时发现的消息只写入存储
    pub async fn reconcile(&self) -> ReconciliationReport {
        self.scanner.run_once().await
    }

    /// 立即执行一次状态扫描
    pub async fn sweep(&self) -> SweepReport {
        self.monitor.sweep().await
    }

    pub fn message(&self, message_id: &MessageId) -> Option<Message> {
        self.store.get(message_id)
    }

    pub fn pending(&self) -> Vec<Message> {
        self.store.all_pending()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn workers(&self) -> &RelayWorkerManager {
        &self.workers
    }
}
