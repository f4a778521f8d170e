//! 对外通知（UI、指标等消费者）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{Direction, MessageId, MessageStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Notification {
    NewMessage {
        message_id: MessageId,
        direction: Direction,
        timestamp: DateTime<Utc>,
    },
    MessageStatusChanged {
        message_id: MessageId,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    },
    MessageProcessed {
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    MessageFailed {
        message_id: MessageId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Notification::NewMessage { message_id, .. }
            | Notification::MessageStatusChanged { message_id, .. }
            | Notification::MessageProcessed { message_id, .. }
            | Notification::MessageFailed { message_id, .. } => message_id,
        }
    }
}

/// 基于 broadcast 的通知分发；没有订阅者时通知直接丢弃
#[derive(Debug, Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn publish(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            trace!("No notification subscribers");
        }
    }

    pub fn new_message(&self, message_id: MessageId, direction: Direction) {
        self.publish(Notification::NewMessage {
            message_id,
            direction,
            timestamp: Utc::now(),
        });
    }

    pub fn status_changed(&self, message_id: MessageId, status: MessageStatus) {
        self.publish(Notification::MessageStatusChanged {
            message_id,
            status,
            timestamp: Utc::now(),
        });
    }

    pub fn processed(&self, message_id: MessageId) {
        self.publish(Notification::MessageProcessed {
            message_id,
            timestamp: Utc::now(),
        });
    }

    pub fn failed(&self, message_id: MessageId, reason: impl Into<String>) {
        self.publish(Notification::MessageFailed {
            message_id,
            reason: reason.into(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
