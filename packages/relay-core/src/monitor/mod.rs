use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    adapter::LayerAdapters,
    config::MonitorConfig,
    relayer::RelayWorkerManager,
    store::MessageStore,
    types::{Message, MessageStatus, StatusReport},
};

pub const DESTINATION_REJECTED_REASON: &str = "Rejected by destination layer";

/// 一次扫描的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub retired: usize,
    pub errors: usize,
}

/// 周期性检查待处理消息在目标链上的状态
pub struct StatusMonitor {
    store: Arc<MessageStore>,
    adapters: LayerAdapters,
    workers: RelayWorkerManager,
    config: MonitorConfig,
}

impl StatusMonitor {
    pub fn new(
        store: Arc<MessageStore>,
        adapters: LayerAdapters,
        workers: RelayWorkerManager,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            workers,
            config,
        }
    }

    fn due(&self, message: &Message, now: Instant) -> bool {
        let min_recheck = Duration::from_secs(self.config.min_recheck_interval);
        match message.last_checked {
            Some(checked) => now.saturating_duration_since(checked) >= min_recheck,
            None => true,
        }
    }

    /// 对端确认数不足时仍视为未完成
    fn final_status(&self, report: &StatusReport) -> Option<MessageStatus> {
        match report.status {
            MessageStatus::Pending | MessageStatus::Processing => None,
            MessageStatus::Processed if report.confirmations < self.config.required_confirmations => None,
            status => Some(status),
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Instant::now();

        for message in self.store.all_pending() {
            if !self.due(&message, now) {
                continue;
            }
            report.checked += 1;

            let adapter = self.adapters.destination(message.direction);
            let result = adapter.query_status(&message.id).await;
            // 查询失败同样刷新检查时间，避免反复请求故障的适配器
            self.store.touch_checked(&message.id);

            let status_report = match result {
                Ok(status_report) => status_report,
                Err(e) => {
                    report.errors += 1;
                    warn!(
                        message_id = %message.id,
                        layer = %adapter.layer(),
                        "Status query failed, will retry later: {}",
                        e
                    );
                    continue;
                }
            };

            let Some(status) = self.final_status(&status_report) else {
                debug!(
                    message_id = %message.id,
                    status = %status_report.status,
                    confirmations = status_report.confirmations,
                    "Message not final yet"
                );
                continue;
            };

            let reason = (status == MessageStatus::Failed).then_some(DESTINATION_REJECTED_REASON);
            if self.workers.retire(&message.id, status, reason).is_some() {
                report.retired += 1;
            }
        }

        if report.checked > 0 {
            debug!(
                checked = report.checked,
                retired = report.retired,
                errors = report.errors,
                "Status sweep finished"
            );
        }
        report
    }

    /// 启动周期扫描任务，直到 cancel 被触发
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.poll_interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                poll_interval = self.config.poll_interval,
                min_recheck_interval = self.config.min_recheck_interval,
                "Status monitor started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            info!("Status monitor stopped");
        })
    }
}
