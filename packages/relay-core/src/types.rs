use blake2::{digest::consts::U32, Blake2b, Digest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

use crate::Error;

type Blake2b256 = Blake2b<U32>;

/// 两条账本之一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    L1,
    L2,
}

impl Layer {
    pub fn other(&self) -> Layer {
        match self {
            Layer::L1 => Layer::L2,
            Layer::L2 => Layer::L1,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::L1 => write!(f, "l1"),
            Layer::L2 => write!(f, "l2"),
        }
    }
}

/// 消息方向，创建后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "l2_to_l1")]
    L2ToL1,
    #[serde(rename = "l1_to_l2")]
    L1ToL2,
}

impl Direction {
    /// 消息产生的链
    pub fn origin(&self) -> Layer {
        match self {
            Direction::L2ToL1 => Layer::L2,
            Direction::L1ToL2 => Layer::L1,
        }
    }

    /// 消息需要被中继到的链
    pub fn destination(&self) -> Layer {
        self.origin().other()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::L2ToL1 => write!(f, "l2_to_l1"),
            Direction::L1ToL2 => write!(f, "l1_to_l2"),
        }
    }
}

/// 负载语义标签，中继器本身不解释负载内容
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    RiskScoreUpdate,
    CollateralChange,
    Liquidation,
    Generic,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::RiskScoreUpdate => write!(f, "risk_score_update"),
            MessageType::CollateralChange => write!(f, "collateral_change"),
            MessageType::Liquidation => write!(f, "liquidation"),
            MessageType::Generic => write!(f, "generic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// 创建时的状态
    Pending,
    /// 已提交中继交易，等待对端确认
    Processing,
    Processed,
    Failed,
    Canceled,
}

impl MessageStatus {
    /// 终态：不再允许任何状态转换
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(Error::Serialization(format!("Invalid message status: {s}"))),
        }
    }
}

/// 内容派生的消息标识 (blake2b-256)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 32]);

impl MessageId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// 对 (sender, target, type, nonce) 的 BCS 编码做哈希
    pub fn derive(
        sender: &str,
        target_address: &str,
        message_type: MessageType,
        nonce: u64,
    ) -> Result<Self, Error> {
        let encoded = bcs::to_bytes(&(sender, target_address, message_type, nonce))
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let digest = Blake2b256::digest(&encoded);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw)
            .map_err(|e| Error::Serialization(format!("Invalid message id {s}: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Serialization(format!("Message id must be 32 bytes: {s}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 负载字节在 JSON 中以十六进制表示
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

/// 零知识证明附件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkAttestation {
    pub commitment_hash: String,
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
}

/// 来源链事件中携带的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub direction: Direction,
    pub sender: String,
    pub target_address: String,
    pub message_type: MessageType,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub nonce: u64,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<ZkAttestation>,
}

impl MessageEnvelope {
    pub fn new(
        direction: Direction,
        sender: impl Into<String>,
        target_address: impl Into<String>,
        message_type: MessageType,
        payload: Vec<u8>,
        nonce: u64,
        timestamp: u64,
    ) -> Result<Self, Error> {
        let sender = sender.into();
        let target_address = target_address.into();
        let message_id = MessageId::derive(&sender, &target_address, message_type, nonce)?;
        Ok(Self {
            message_id,
            direction,
            sender,
            target_address,
            message_type,
            payload,
            nonce,
            timestamp,
            attestation: None,
        })
    }

    pub fn with_attestation(mut self, attestation: ZkAttestation) -> Self {
        self.attestation = Some(attestation);
        self
    }
}

/// 中继交易句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHandle(pub String);

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 跨层消息，消息存储中的唯一记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub direction: Direction,
    pub sender: String,
    pub target_address: String,
    pub message_type: MessageType,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub has_zk_proof: bool,
    pub zk_verified: bool,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_handle: Option<TxHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip)]
    pub last_checked: Option<Instant>,
    #[serde(skip)]
    pub last_relayed: Option<Instant>,
}

impl Message {
    pub fn from_envelope(envelope: MessageEnvelope) -> Self {
        Self {
            id: envelope.message_id,
            direction: envelope.direction,
            sender: envelope.sender,
            target_address: envelope.target_address,
            message_type: envelope.message_type,
            payload: envelope.payload,
            has_zk_proof: envelope.attestation.is_some(),
            zk_verified: false,
            status: MessageStatus::Pending,
            retry_count: 0,
            timestamp: envelope.timestamp,
            tx_handle: None,
            last_error: None,
            last_checked: None,
            last_relayed: None,
        }
    }

    /// 仍在待处理集合中 (Pending / Processing)
    pub fn is_pending(&self) -> bool {
        !self.status.is_terminal()
    }

    /// 携带证明但尚未被外部确认
    pub fn awaiting_proof(&self) -> bool {
        self.has_zk_proof && !self.zk_verified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    L2MessageSent,
    L2MessageProcessed,
    ZkProofVerified,
    RiskScoreUpdated,
    CollateralChanged,
    Liquidation,
}

/// 链上领域事件，封闭集合，由编排器统一 match 分发
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    L2MessageSent(MessageEnvelope),
    L2MessageProcessed { message_id: MessageId },
    ZkProofVerified { message_id: MessageId },
    RiskScoreUpdated(MessageEnvelope),
    CollateralChanged(MessageEnvelope),
    Liquidation(MessageEnvelope),
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::L2MessageSent(_) => EventKind::L2MessageSent,
            DomainEvent::L2MessageProcessed { .. } => EventKind::L2MessageProcessed,
            DomainEvent::ZkProofVerified { .. } => EventKind::ZkProofVerified,
            DomainEvent::RiskScoreUpdated(_) => EventKind::RiskScoreUpdated,
            DomainEvent::CollateralChanged(_) => EventKind::CollateralChanged,
            DomainEvent::Liquidation(_) => EventKind::Liquidation,
        }
    }

    /// 产生新消息的事件返回其信封
    pub fn envelope(&self) -> Option<&MessageEnvelope> {
        match self {
            DomainEvent::L2MessageSent(env)
            | DomainEvent::RiskScoreUpdated(env)
            | DomainEvent::CollateralChanged(env)
            | DomainEvent::Liquidation(env) => Some(env),
            DomainEvent::L2MessageProcessed { .. } | DomainEvent::ZkProofVerified { .. } => None,
        }
    }
}

/// 对端链上消息状态的时点快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: MessageStatus,
    #[serde(default)]
    pub confirmations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_is_deterministic() {
        let a = MessageId::derive("0xsender", "0xtarget", MessageType::Generic, 7).unwrap();
        let b = MessageId::derive("0xsender", "0xtarget", MessageType::Generic, 7).unwrap();
        let c = MessageId::derive("0xsender", "0xtarget", MessageType::Generic, 8).unwrap();
        let d = MessageId::derive("0xsender", "0xtarget", MessageType::Liquidation, 7).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_message_id_text_form() {
        let id = MessageId::derive("alice", "bob", MessageType::Generic, 1).unwrap();
        let text = id.to_string();
        assert!(text.starts_with("0x"));
        assert_eq!(text.len(), 66);
        assert_eq!(text.parse::<MessageId>().unwrap(), id);
        assert!("0x1234".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_direction_layers() {
        assert_eq!(Direction::L2ToL1.origin(), Layer::L2);
        assert_eq!(Direction::L2ToL1.destination(), Layer::L1);
        assert_eq!(Direction::L1ToL2.origin(), Layer::L1);
        assert_eq!(Direction::L1ToL2.destination(), Layer::L2);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Processing.is_terminal());
        assert!(MessageStatus::Processed.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(MessageStatus::Canceled.is_terminal());
        assert_eq!("cancelled".parse::<MessageStatus>().unwrap(), MessageStatus::Canceled);
    }

    #[test]
    fn test_domain_event_wire_format() {
        let env = MessageEnvelope::new(
            Direction::L2ToL1,
            "0xa",
            "0xb",
            MessageType::CollateralChange,
            vec![0xde, 0xad],
            3,
            1_700_000_000,
        )
        .unwrap();
        let event = DomainEvent::CollateralChanged(env.clone());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "collateral_changed");
        assert_eq!(value["payload"], "0xdead");
        assert_eq!(value["direction"], "l2_to_l1");

        let decoded: DomainEvent = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.envelope(), Some(&env));
        assert_eq!(decoded.kind(), EventKind::CollateralChanged);
    }

    #[test]
    fn test_message_from_attested_envelope() {
        let env = MessageEnvelope::new(Direction::L1ToL2, "a", "b", MessageType::Generic, vec![], 1, 0)
            .unwrap()
            .with_attestation(ZkAttestation {
                commitment_hash: "0xc0ffee".to_string(),
                proof: vec![1, 2, 3],
            });
        let message = Message::from_envelope(env);
        assert!(message.has_zk_proof);
        assert!(!message.zk_verified);
        assert!(message.awaiting_proof());
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.retry_count, 0);
    }
}
