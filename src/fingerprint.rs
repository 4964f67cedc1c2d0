use img_hash::{HashAlg, HasherConfig}; // pHash 配置器和算法枚举
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::error::{Result, VerifyError};

/// 密码学哈希 (SHA-256)
///
/// 解决“原始完整性”：同一份字节永远得到同一个值，哪怕改一个字节也会雪崩式变化。
/// 这是公证和去重用的身份锚点，与文件名、存储路径无关。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64 字符小写 Hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| VerifyError::Decode(format!("content hash {s:?}: {e}")))?;
        let arr: [u8; 32] = raw
            .try_into()
            .map_err(|_| VerifyError::Decode(format!("content hash {s:?}: expected 32 bytes")))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Pure and deterministic: reads nothing but `bytes`.
pub fn hash(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash(hasher.finalize().into())
}

/// Same digest as [`hash`] over the file contents. Fails only if the file
/// cannot be read.
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    let bytes = std::fs::read(path)?;
    Ok(hash(&bytes))
}

/// 视觉感知哈希 (pHash)
///
/// 解决“内容同一性”：图片经过压缩、轻微裁剪后 SHA-256 会全变，但 pHash 依然相似。
/// Only a lookup aid, never an identity.
pub fn perceptual_hash(img: &image::DynamicImage) -> String {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient) // 梯度算法，比均值算法对明暗变化更鲁棒
        .hash_size(8, 8) // 8x8 = 64 位指纹
        .to_hasher();
    hasher.hash_image(img).to_base64()
}

/// Decode the submitted bytes. A failure here is the one fatal precondition
/// of a verification request.
pub fn decode(bytes: &[u8]) -> Result<image::DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| VerifyError::Decode(e.to_string()))
}
