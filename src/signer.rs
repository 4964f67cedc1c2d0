use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng; // 用于生成私钥的安全随机数生成器
use serde::Serialize;
use tracing::info;

use crate::error::{Result, ResultExt as _, VerifyError};

/// 签名器模块
/// 负责对公证检查点 (root, mmr_size, timestamp) 进行签名，证明它出自本服务。
pub struct CheckpointSigner {
    keypair: SigningKey,
}

impl CheckpointSigner {
    /// 临时密钥，仅用于测试与基准。
    pub fn ephemeral() -> Self {
        // Ed25519 基于 Twisted Edwards Curve (Curve25519)
        Self { keypair: SigningKey::generate(&mut OsRng) }
    }

    /// 从文件加载私钥（hex 编码的 32 字节）；文件不存在则生成并写入。
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .ctx_config(&format!("read signing key {}", path.display()))?;
            let raw = hex::decode(text.trim()).ctx_config("decode signing key hex")?;
            let bytes: [u8; 32] = raw
                .try_into()
                .map_err(|_| VerifyError::Config("signing key must be 32 bytes".into()))?;
            return Ok(Self { keypair: SigningKey::from_bytes(&bytes) });
        }

        let signer = Self::ephemeral();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(signer.keypair.to_bytes()))?;
        info!(path = %path.display(), "generated new notary signing key");
        Ok(signer)
    }

    /// 获取公钥（分发给审计方验签）
    pub fn public_key(&self) -> VerifyingKey {
        self.keypair.verifying_key()
    }

    /// 用 BCS 定序编码后签名，避免 JSON 字段顺序不确定的问题。
    pub fn sign<T: Serialize>(&self, payload: &T) -> Result<Signature> {
        let bytes = bcs::to_bytes(payload).ctx_notary("encode checkpoint")?;
        Ok(self.keypair.sign(&bytes))
    }

    /// 静态验证函数（给外部验证者使用）
    pub fn verify<T: Serialize>(key: &VerifyingKey, payload: &T, signature: &Signature) -> Result<bool> {
        let bytes = bcs::to_bytes(payload).ctx_notary("encode checkpoint")?;
        Ok(key.verify(&bytes, signature).is_ok())
    }
}
