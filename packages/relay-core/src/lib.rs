pub mod config;
pub mod types;
pub mod store;
pub mod signer;
pub mod adapter;
pub mod notify;
pub mod relayer;
pub mod reconcile;
pub mod monitor;
pub mod orchestrator;
pub mod telemetry;

pub use config::Config;
pub use types::{
    Direction, DomainEvent, EventKind, Layer, Message, MessageEnvelope, MessageId, MessageStatus,
    MessageType, StatusReport, TxHandle, ZkAttestation,
};
pub use store::MessageStore;
pub use signer::{Ed25519Signer, RelaySignature, Signer};
pub use adapter::{JsonRpcAdapter, LayerAdapter, LayerAdapters};
pub use notify::{Notification, NotificationHub};
pub use relayer::RelayWorkerManager;
pub use reconcile::{ReconciliationReport, ReconciliationScanner};
pub use monitor::{StatusMonitor, SweepReport};
pub use orchestrator::Orchestrator;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Orchestrator is already running")]
    AlreadyRunning,
}

impl Error {
    /// 链上/网络类的瞬时错误，下一个周期重试即可
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Adapter(_) | Error::Network(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
