use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{
    config::Config,
    signer::RelaySignature,
    types::{
        Direction, DomainEvent, EventKind, Layer, Message, MessageEnvelope, MessageId, StatusReport,
        TxHandle,
    },
    Error, Result,
};

/// 账本适配器，L1 与 L2 使用同一套接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LayerAdapter: Send + Sync {
    /// 适配器所在的层
    fn layer(&self) -> Layer;

    /// 订阅链上事件，kinds 为空表示订阅全部类型。
    /// from 为首个投递的标记高度，None 表示从当前高度之后开始。
    async fn subscribe(&self, kinds: &[EventKind], from: Option<u64>) -> Result<mpsc::Receiver<DomainEvent>>;

    /// 查询消息在本层的状态；错误只代表 "暂时未知"
    async fn query_status(&self, message_id: &MessageId) -> Result<StatusReport>;

    /// 将消息中继到本层
    async fn submit_relay(&self, message: &Message, signature: &RelaySignature) -> Result<TxHandle>;

    /// 当前最新的区块（标记）高度
    async fn latest_marker(&self) -> Result<u64>;

    /// 查询 [from, to] 范围内的历史事件
    async fn query_events_in_range(&self, from: u64, to: u64) -> Result<Vec<DomainEvent>>;

    /// 直接暴露待处理队列的链返回其中的消息
    async fn list_pending(&self) -> Result<Vec<MessageEnvelope>> {
        Ok(Vec::new())
    }

    /// 中继失败后通知来源链（释放托管资源等）
    async fn report_failure(&self, _message: &Message, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// 一对适配器，按消息方向选出来源链或目标链
#[derive(Clone)]
pub struct LayerAdapters {
    l1: Arc<dyn LayerAdapter>,
    l2: Arc<dyn LayerAdapter>,
}

impl LayerAdapters {
    pub fn new(l1: Arc<dyn LayerAdapter>, l2: Arc<dyn LayerAdapter>) -> Result<Self> {
        if l1.layer() != Layer::L1 || l2.layer() != Layer::L2 {
            return Err(Error::Config(format!(
                "Adapter layers mismatch: got ({}, {})",
                l1.layer(),
                l2.layer()
            )));
        }
        Ok(Self { l1, l2 })
    }

    /// 为两条链各创建一个 JSON-RPC 适配器
    pub fn from_config(config: &Config) -> Result<Self> {
        let l1 = JsonRpcAdapter::new(Layer::L1, config.l1.clone())?;
        let l2 = JsonRpcAdapter::new(Layer::L2, config.l2.clone())?;
        Self::new(Arc::new(l1), Arc::new(l2))
    }

    pub fn get(&self, layer: Layer) -> &Arc<dyn LayerAdapter> {
        match layer {
            Layer::L1 => &self.l1,
            Layer::L2 => &self.l2,
        }
    }

    pub fn origin(&self, direction: Direction) -> &Arc<dyn LayerAdapter> {
        self.get(direction.origin())
    }

    pub fn destination(&self, direction: Direction) -> &Arc<dyn LayerAdapter> {
        self.get(direction.destination())
    }
}

pub mod json_rpc;

pub use json_rpc::JsonRpcAdapter;
