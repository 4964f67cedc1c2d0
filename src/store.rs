use std::path::Path;

use crate::error::{Result, ResultExt as _, VerifyError};
use crate::evidence::EvidenceRecord;
use crate::fingerprint::ContentHash;

/// 证据库 (Evidence store)
///
/// 两棵 sled 树：
/// - `images`:  content hash -> 原始字节（内容寻址，重复上传只存一份）
/// - `records`: id (u64 大端) -> EvidenceRecord JSON
///
/// 所有错误都归为 `Storage`，由调用方直接上抛。
pub struct EvidenceStore {
    db: sled::Db,
    images: sled::Tree,
    records: sled::Tree,
}

impl EvidenceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).ctx_storage(&format!("open database {}", path.display()))?;
        Self::from_db(db)
    }

    /// Share an already opened database (the MMR notary lives in the same one).
    pub fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            images: db.open_tree("images").ctx_storage("open images")?,
            records: db.open_tree("records").ctx_storage("open records")?,
            db,
        })
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// 单调递增，重启后不回退
    pub fn next_id(&self) -> Result<u64> {
        self.db.generate_id().ctx_storage("generate record id")
    }

    /// Store image bytes under their content hash. Returns the image reference.
    pub fn put_image(&self, hash: &ContentHash, bytes: &[u8]) -> Result<String> {
        let key = hash.to_hex();
        if !self.images.contains_key(key.as_bytes()).ctx_storage("check image")? {
            self.images.insert(key.as_bytes(), bytes).ctx_storage("write image")?;
        }
        Ok(key)
    }

    pub fn get_image(&self, reference: &str) -> Result<Option<Vec<u8>>> {
        let raw = self.images.get(reference.as_bytes()).ctx_storage("read image")?;
        Ok(raw.map(|v| v.to_vec()))
    }

    pub fn put_record(&self, record: &EvidenceRecord) -> Result<()> {
        let json = serde_json::to_vec(record).ctx_storage("encode record")?;
        self.records
            .insert(record.id.to_be_bytes(), json)
            .ctx_storage("write record")?;
        self.db.flush().ctx_storage("flush")?;
        Ok(())
    }

    pub fn get_record(&self, id: u64) -> Result<Option<EvidenceRecord>> {
        let Some(raw) = self.records.get(id.to_be_bytes()).ctx_storage("read record")? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&raw)
            .map_err(|e| VerifyError::Storage(format!("record {id} is corrupt: {e}")))?;
        Ok(Some(record))
    }
}
