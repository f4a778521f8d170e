use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{EventKind, Layer};
use crate::Error;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LayerConfig {
    pub name: String,
    pub rpc_url: String,
    pub contract_address: String,
    /// 事件轮询间隔（秒）
    #[serde(default = "default_layer_poll_interval")]
    pub poll_interval: u64,
    /// 单次 RPC 调用的最大尝试次数
    #[serde(default = "default_request_attempts")]
    pub request_attempts: u32,
    /// RPC 重试基础延迟（毫秒）
    #[serde(default = "default_request_retry_delay_ms")]
    pub request_retry_delay_ms: u64,
    #[serde(default)]
    pub event_filters: Vec<EventKind>,
}

impl LayerConfig {
    pub fn new(name: &str, rpc_url: &str, contract_address: &str) -> Self {
        Self {
            name: name.to_string(),
            rpc_url: rpc_url.to_string(),
            contract_address: contract_address.to_string(),
            poll_interval: default_layer_poll_interval(),
            request_attempts: default_request_attempts(),
            request_retry_delay_ms: default_request_retry_delay_ms(),
            event_filters: Vec::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct SignerConfig {
    /// 32 字节 ed25519 种子（十六进制）
    #[serde(default)]
    pub secret_key: Option<String>,
    /// 存放种子的环境变量名
    #[serde(default)]
    pub secret_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed,
    /// 间隔按尝试次数翻倍，上限 max_interval 秒
    Exponential { max_interval: u64 },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Fixed
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RelayerConfig {
    /// 中继重试间隔（秒）
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// 携带零知识证明的消息需等待证明确认后才中继
    #[serde(default)]
    pub require_zk_verification: bool,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
            require_zk_verification: false,
        }
    }
}

impl RelayerConfig {
    /// 第 attempt 次尝试失败后的等待时间
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.retry_interval;
        let secs = match self.backoff {
            BackoffConfig::Fixed => base,
            BackoffConfig::Exponential { max_interval } => {
                let shift = attempt.saturating_sub(1).min(32);
                base.saturating_mul(1u64 << shift).min(max_interval.max(base))
            }
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MonitorConfig {
    /// 扫描周期（秒）
    #[serde(default = "default_monitor_poll_interval")]
    pub poll_interval: u64,
    /// 同一消息两次查询的最小间隔（秒）
    #[serde(default = "default_min_recheck_interval")]
    pub min_recheck_interval: u64,
    #[serde(default)]
    pub required_confirmations: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_monitor_poll_interval(),
            min_recheck_interval: default_min_recheck_interval(),
            required_confirmations: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReconciliationConfig {
    /// 首次扫描回溯的区块（标记）数量
    #[serde(default = "default_lookback")]
    pub lookback: u64,
    /// 周期性重新扫描（秒），None 表示只在启动时扫描
    #[serde(default)]
    pub rescan_interval: Option<u64>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            rescan_interval: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub l1: LayerConfig,
    pub l2: LayerConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Config {
    pub fn new(l1: LayerConfig, l2: LayerConfig) -> Self {
        Self {
            l1,
            l2,
            signer: SignerConfig::default(),
            relayer: RelayerConfig::default(),
            monitor: MonitorConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            notification_capacity: default_notification_capacity(),
        }
    }

    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
        let config: Config = if is_toml {
            toml::from_str(&config_str)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            serde_json::from_str(&config_str)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for layer in [&self.l1, &self.l2] {
            if layer.rpc_url.trim().is_empty() {
                return Err(Error::Config(format!("Layer {} has an empty rpc_url", layer.name)));
            }
            if layer.poll_interval == 0 {
                return Err(Error::Config(format!(
                    "Layer {} poll interval must be greater than 0",
                    layer.name
                )));
            }
            if layer.request_attempts == 0 {
                return Err(Error::Config(format!(
                    "Layer {} request attempts must be greater than 0",
                    layer.name
                )));
            }
        }

        if let Some(seed) = &self.signer.secret_key {
            let raw = seed.strip_prefix("0x").unwrap_or(seed);
            if hex::decode(raw).map(|b| b.len() != 32).unwrap_or(true) {
                return Err(Error::Config("Signer secret key must be 32 bytes of hex".to_string()));
            }
        }

        if self.relayer.retry_interval == 0 {
            return Err(Error::Config("Relayer retry interval must be greater than 0".to_string()));
        }
        if self.relayer.max_retries == 0 {
            return Err(Error::Config("Relayer max retries must be greater than 0".to_string()));
        }
        if let BackoffConfig::Exponential { max_interval } = self.relayer.backoff {
            if max_interval < self.relayer.retry_interval {
                return Err(Error::Config(
                    "Exponential backoff max interval must not be below the retry interval".to_string(),
                ));
            }
        }

        if self.monitor.poll_interval == 0 {
            return Err(Error::Config("Monitor poll interval must be greater than 0".to_string()));
        }
        if self.reconciliation.rescan_interval == Some(0) {
            return Err(Error::Config("Reconciliation rescan interval must be greater than 0".to_string()));
        }
        if self.notification_capacity == 0 {
            return Err(Error::Config("Notification capacity must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn layer(&self, layer: Layer) -> &LayerConfig {
        match layer {
            Layer::L1 => &self.l1,
            Layer::L2 => &self.l2,
        }
    }
}

fn default_layer_poll_interval() -> u64 {
    5
}

fn default_request_attempts() -> u32 {
    3
}

fn default_request_retry_delay_ms() -> u64 {
    500
}

fn default_retry_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_monitor_poll_interval() -> u64 {
    60
}

fn default_min_recheck_interval() -> u64 {
    30
}

fn default_lookback() -> u64 {
    10_000
}

fn default_notification_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> Config {
        Config::new(
            LayerConfig::new("ethereum", "http://localhost:8545", "0xbridge"),
            LayerConfig::new("rollup", "http://localhost:9545", "0xmessenger"),
        )
    }

    #[test]
    fn test_defaults() {
        let config = sample();
        assert_eq!(config.relayer.retry_interval, 30);
        assert_eq!(config.monitor.poll_interval, 60);
        assert_eq!(config.monitor.min_recheck_interval, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "l1": {{"name": "ethereum", "rpc_url": "http://l1", "contract_address": "0x1"}},
                "l2": {{"name": "rollup", "rpc_url": "http://l2", "contract_address": "0x2",
                        "event_filters": ["l2_message_sent", "zk_proof_verified"]}},
                "relayer": {{"max_retries": 3, "backoff": {{"strategy": "exponential", "max_interval": 300}}}}
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.relayer.max_retries, 3);
        assert_eq!(config.relayer.retry_interval, 30);
        assert_eq!(config.relayer.backoff, BackoffConfig::Exponential { max_interval: 300 });
        assert_eq!(
            config.l2.event_filters,
            vec![EventKind::L2MessageSent, EventKind::ZkProofVerified]
        );
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
notification_capacity = 16

[l1]
name = "ethereum"
rpc_url = "http://l1"
contract_address = "0x1"

[l2]
name = "rollup"
rpc_url = "http://l2"
contract_address = "0x2"

[monitor]
poll_interval = 10
min_recheck_interval = 5
required_confirmations = 2

[reconciliation]
lookback = 500
rescan_interval = 600
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.notification_capacity, 16);
        assert_eq!(config.monitor.required_confirmations, 2);
        assert_eq!(config.reconciliation.rescan_interval, Some(600));
        assert_eq!(config.layer(Layer::L2).name, "rollup");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = sample();
        config.relayer.max_retries = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = sample();
        config.signer.secret_key = Some("abcd".to_string());
        assert!(config.validate().is_err());

        let mut config = sample();
        config.l1.rpc_url = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.relayer.backoff = BackoffConfig::Exponential { max_interval: 1 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_delays() {
        let mut relayer = RelayerConfig::default();
        assert_eq!(relayer.delay_after(1), Duration::from_secs(30));
        assert_eq!(relayer.delay_after(4), Duration::from_secs(30));

        relayer.backoff = BackoffConfig::Exponential { max_interval: 100 };
        assert_eq!(relayer.delay_after(1), Duration::from_secs(30));
        assert_eq!(relayer.delay_after(2), Duration::from_secs(60));
        assert_eq!(relayer.delay_after(3), Duration::from_secs(100));
        assert_eq!(relayer.delay_after(40), Duration::from_secs(100));
    }
}
