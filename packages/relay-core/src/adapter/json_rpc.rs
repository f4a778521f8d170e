use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};

use super::LayerAdapter;
use crate::{
    config::LayerConfig,
    signer::RelaySignature,
    types::{DomainEvent, EventKind, Layer, Message, MessageEnvelope, MessageId, StatusReport, TxHandle},
    Error, Result,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    tx_hash: String,
}

/// 通过 JSON-RPC 访问账本的中继合约
#[derive(Clone)]
pub struct JsonRpcAdapter {
    layer: Layer,
    config: LayerConfig,
    client: reqwest::Client,
    request_id: Arc<AtomicU64>,
}

impl JsonRpcAdapter {
    pub fn new(layer: Layer, config: LayerConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            layer,
            config,
            client,
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    async fn retry_with_backoff<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.request_attempts {
                        return Err(e);
                    }
                    let delay = self.config.request_retry_delay_ms << (attempts - 1).min(16);
                    debug!(layer = %self.layer, attempt = attempts, "RPC call failed, retrying: {}", e);
                    sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    async fn call_once<T: DeserializeOwned>(&self, method: &str, params: &Value) -> Result<T> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": id
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: RpcResponse<T> = response.json().await?;
        if let Some(error) = body.error {
            return Err(Error::Adapter(format!(
                "{} failed on {}: [{}] {}",
                method, self.config.name, error.code, error.message
            )));
        }
        match body.result {
            Some(result) => Ok(result),
            // 无返回值的方法 (T = Value) 允许 null 结果
            None => serde_json::from_value(Value::Null)
                .map_err(|_| Error::Adapter(format!("{} returned no result", method))),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.retry_with_backoff(|| self.call_once(method, &params)).await
    }
}

fn accepts(kinds: &[EventKind], event: &DomainEvent) -> bool {
    kinds.is_empty() || kinds.contains(&event.kind())
}

#[async_trait]
impl LayerAdapter for JsonRpcAdapter {
    fn layer(&self) -> Layer {
        self.layer
    }

    async fn subscribe(&self, kinds: &[EventKind], from: Option<u64>) -> Result<mpsc::Receiver<DomainEvent>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let adapter = self.clone();
        let kinds = if kinds.is_empty() {
            self.config.event_filters.clone()
        } else {
            kinds.to_vec()
        };

        tokio::spawn(async move {
            let mut ticker = interval(adapter.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cursor = from;

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(layer = %adapter.layer, "Event subscriber dropped");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let latest = match adapter.latest_marker().await {
                    Ok(latest) => latest,
                    Err(e) => {
                        warn!(layer = %adapter.layer, "Failed to poll latest marker: {}", e);
                        continue;
                    }
                };
                let from = match cursor {
                    Some(from) => from,
                    None => {
                        cursor = Some(latest + 1);
                        continue;
                    }
                };
                if latest < from {
                    continue;
                }

                match adapter.query_events_in_range(from, latest).await {
                    Ok(events) => {
                        for event in events.into_iter().filter(|e| accepts(&kinds, e)) {
                            if tx.send(event).await.is_err() {
                                debug!(layer = %adapter.layer, "Event subscriber dropped");
                                return;
                            }
                        }
                        cursor = Some(latest + 1);
                    }
                    Err(e) => {
                        warn!(layer = %adapter.layer, from, to = latest, "Failed to poll events: {}", e);
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn query_status(&self, message_id: &MessageId) -> Result<StatusReport> {
        self.call(
            "relay_getMessageStatus",
            json!([{
                "contract": self.config.contract_address,
                "message_id": message_id
            }]),
        )
        .await
    }

    async fn submit_relay(&self, message: &Message, signature: &RelaySignature) -> Result<TxHandle> {
        let result: SubmitResult = self
            .call(
                "relay_submitMessage",
                json!([{
                    "contract": self.config.contract_address,
                    "message": message,
                    "signature": signature
                }]),
            )
            .await?;
        Ok(TxHandle(result.tx_hash))
    }

    async fn latest_marker(&self) -> Result<u64> {
        self.call("relay_blockNumber", json!([])).await
    }

    async fn query_events_in_range(&self, from: u64, to: u64) -> Result<Vec<DomainEvent>> {
        self.call(
            "relay_getEvents",
            json!([{
                "contract": self.config.contract_address,
                "from": from,
                "to": to
            }]),
        )
        .await
    }

    async fn list_pending(&self) -> Result<Vec<MessageEnvelope>> {
        self.call(
            "relay_getPendingMessages",
            json!([{ "contract": self.config.contract_address }]),
        )
        .await
    }

    async fn report_failure(&self, message: &Message, reason: &str) -> Result<()> {
        let _: Value = self
            .call(
                "relay_failMessage",
                json!([{
                    "contract": self.config.contract_address,
                    "message_id": message.id,
                    "reason": reason
                }]),
            )
            .await?;
        Ok(())
    }
}
