use blake2::{digest::consts::U32, Blake2b, Digest};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{config::SignerConfig, types::MessageId, Error, Result};

/// 编排器身份对消息 ID 的签名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySignature {
    /// 签名者公钥（十六进制）
    pub signer: String,
    #[serde(with = "crate::types::hex_bytes")]
    pub signature: Vec<u8>,
}

impl RelaySignature {
    /// 校验签名是否绑定到给定消息
    pub fn verify(&self, message_id: &MessageId) -> Result<()> {
        let public_key: [u8; 32] = hex::decode(&self.signer)
            .map_err(|e| Error::Signature(format!("Invalid public key hex: {}", e)))?
            .try_into()
            .map_err(|_| Error::Signature("Public key must be 32 bytes".to_string()))?;
        let signature: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| Error::Signature("Signature must be 64 bytes".to_string()))?;

        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| Error::Signature(format!("Invalid public key: {}", e)))?;
        let digest = signing_digest(&public_key, message_id);

        verifying_key
            .verify(&digest, &Signature::from_bytes(&signature))
            .map_err(|e| Error::Signature(format!("Signature verification failed: {}", e)))
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Signer: Send + Sync {
    /// 当前签名身份，未配置时为 None
    fn identity(&self) -> Option<String>;

    /// 对消息 ID 签名，未配置身份时返回 SignerUnavailable
    fn sign(&self, message_id: &MessageId) -> Result<RelaySignature>;
}

/// 签名内容：blake2b-256(公钥 || 消息ID)
fn signing_digest(public_key: &[u8; 32], message_id: &MessageId) -> Vec<u8> {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(public_key);
    hasher.update(message_id.as_bytes());
    hasher.finalize().to_vec()
}

pub struct Ed25519Signer {
    signing_key: Option<SigningKey>,
}

impl Ed25519Signer {
    /// 随机生成新的密钥
    pub fn generate() -> Self {
        info!("Generating new relay signing key");
        Self {
            signing_key: Some(SigningKey::generate(&mut OsRng)),
        }
    }

    /// 从 32 字节十六进制种子创建
    pub fn from_hex(hex_seed: &str) -> Result<Self> {
        let bytes = hex::decode(hex_seed.strip_prefix("0x").unwrap_or(hex_seed)).map_err(|e| {
            error!("Failed to decode signer seed: {}", e);
            Error::Config(format!("Invalid signer key hex: {}", e))
        })?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("Signer key must be 32 bytes".to_string()))?;
        Ok(Self {
            signing_key: Some(SigningKey::from_bytes(&seed)),
        })
    }

    /// 没有签名身份的签名器，每次签名都会失败
    pub fn unconfigured() -> Self {
        Self { signing_key: None }
    }

    /// 配置中的明文种子优先，其次读取环境变量
    pub fn from_config(config: &SignerConfig) -> Result<Self> {
        if let Some(seed) = &config.secret_key {
            return Self::from_hex(seed);
        }
        if let Some(var) = &config.secret_key_env {
            return match std::env::var(var) {
                Ok(seed) => Self::from_hex(seed.trim()),
                Err(_) => {
                    debug!("Signer env var {} not set, starting without identity", var);
                    Ok(Self::unconfigured())
                }
            };
        }
        Ok(Self::unconfigured())
    }

    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.signing_key
            .as_ref()
            .map(|key| key.verifying_key().to_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn identity(&self) -> Option<String> {
        self.public_key().map(hex::encode)
    }

    fn sign(&self, message_id: &MessageId) -> Result<RelaySignature> {
        let key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| Error::SignerUnavailable("no signing identity configured".to_string()))?;
        let public_key = key.verifying_key().to_bytes();
        let signature = key.sign(&signing_digest(&public_key, message_id));

        debug!(message_id = %message_id, "Message signed");
        Ok(RelaySignature {
            signer: hex::encode(public_key),
            signature: signature.to_bytes().to_vec(),
        })
    }
}
