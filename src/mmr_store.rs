use std::path::Path;
use std::sync::{Arc, Mutex};

use ckb_merkle_mountain_range::{Merge, MerkleProof, MMRStoreReadOps, MMRStoreWriteOps, MMR};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ResultExt as _, VerifyError};
use crate::fingerprint::ContentHash;
use crate::notary::{write_artifact, StampReceipt, TimestampBackend, VerificationOutcome};
use crate::config::NotaryKind;
use crate::signer::CheckpointSigner;

/// 模块：MMR 锚定后端 (MMR anchor)
///
/// **职责**: 按时间顺序把每个内容哈希追加为一片叶子，并给出可离线验证的存在性证明。
///
/// - **追加优先 (Append-only)**: 只会往右添加叶子，不修改历史。
/// - **Bagging Peaks**: 所有山峰的山顶再合并一次得到唯一 Root。
/// - **签名检查点**: 每次追加后的 (Root, mmr_size, timestamp) 由本服务私钥签名，
///   验证者既能重放 Merkle 路径，也能确认该 Root 确实由本服务发布。

/// 合并策略：$H_{parent} = Blake3(H_{left} \ || \ H_{right})$
pub struct MergeBlake3;

impl Merge for MergeBlake3 {
    type Item = [u8; 32];

    fn merge(lhs: &Self::Item, rhs: &Self::Item) -> ckb_merkle_mountain_range::Result<Self::Item> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(lhs);
        hasher.update(rhs);
        Ok(*hasher.finalize().as_bytes())
    }
}

/// sled 持久化的节点存储：pos (u64 大端) -> 32 字节节点
pub struct SledNodes {
    nodes: sled::Tree,
}

impl MMRStoreReadOps<[u8; 32]> for &SledNodes {
    fn get_elem(&self, pos: u64) -> ckb_merkle_mountain_range::Result<Option<[u8; 32]>> {
        let raw = self
            .nodes
            .get(pos.to_be_bytes())
            .map_err(|e| ckb_merkle_mountain_range::Error::StoreError(e.to_string()))?;
        Ok(raw.and_then(|v| <[u8; 32]>::try_from(v.as_ref()).ok()))
    }
}

impl MMRStoreWriteOps<[u8; 32]> for &SledNodes {
    fn append(&mut self, pos: u64, elems: Vec<[u8; 32]>) -> ckb_merkle_mountain_range::Result<()> {
        for (i, elem) in elems.iter().enumerate() {
            self.nodes
                .insert((pos + i as u64).to_be_bytes(), elem.as_slice())
                .map_err(|e| ckb_merkle_mountain_range::Error::StoreError(e.to_string()))?;
        }
        Ok(())
    }
}

/// 叶子内容：哪个哈希，在哪个时间被锚定
#[derive(Debug, Clone, Serialize)]
struct StampLeaf {
    content_hash: [u8; 32],
    timestamp: i64,
}

/// 签名检查点
#[derive(Debug, Clone, Serialize)]
struct Checkpoint {
    root: [u8; 32],
    mmr_size: u64,
    timestamp: i64,
}

fn leaf_hash(content_hash: &ContentHash, timestamp: i64) -> Result<[u8; 32]> {
    let leaf = StampLeaf { content_hash: *content_hash.as_bytes(), timestamp };
    let payload = bcs::to_bytes(&leaf).ctx_notary("encode leaf")?;
    Ok(*blake3::hash(&payload).as_bytes())
}

/// 存证收据 (on-disk proof artefact)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmrProofArtifact {
    pub content_hash: ContentHash,
    pub timestamp: i64,
    pub leaf_pos: u64,
    pub mmr_size: u64,
    pub root: String,
    pub proof: Vec<String>,
    pub signature: String,
    pub public_key: String,
}

/// 证据锚定库
pub struct MmrStore {
    nodes: SledNodes,
    meta: sled::Tree,
    /// mmr_size -> root, every root this store ever published
    roots: sled::Tree,
    signer: Arc<CheckpointSigner>,
    // append is read-modify-write on mmr_size
    append_lock: Mutex<()>,
}

const SIZE_KEY: &[u8] = b"mmr_size";

impl MmrStore {
    pub fn open(db: &sled::Db, signer: Arc<CheckpointSigner>) -> Result<Self> {
        Ok(Self {
            nodes: SledNodes { nodes: db.open_tree("mmr_nodes").ctx_storage("open mmr_nodes")? },
            meta: db.open_tree("mmr_meta").ctx_storage("open mmr_meta")?,
            roots: db.open_tree("mmr_roots").ctx_storage("open mmr_roots")?,
            signer,
            append_lock: Mutex::new(()),
        })
    }

    /// MMR 树大小：位运算路由的坐标系，丢了它就找不到山顶。
    pub fn mmr_size(&self) -> Result<u64> {
        let raw = self.meta.get(SIZE_KEY).ctx_storage("read mmr_size")?;
        Ok(raw
            .and_then(|v| <[u8; 8]>::try_from(v.as_ref()).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0))
    }

    /// 追加叶子，返回 (root, leaf_pos, mmr_size, proof)
    pub fn append(&self, leaf: [u8; 32]) -> Result<([u8; 32], u64, u64, Vec<[u8; 32]>)> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| VerifyError::Storage("mmr append lock poisoned".into()))?;

        let size = self.mmr_size()?;
        let mut mmr = MMR::<[u8; 32], MergeBlake3, _>::new(size, &self.nodes);
        let pos = mmr.push(leaf).ctx_notary("mmr push")?;
        let root = mmr.get_root().ctx_notary("mmr root")?;
        let new_size = mmr.mmr_size();
        mmr.commit().ctx_notary("mmr commit")?;

        self.meta
            .insert(SIZE_KEY, new_size.to_be_bytes().to_vec())
            .ctx_storage("write mmr_size")?;
        self.roots
            .insert(new_size.to_be_bytes(), root.as_slice())
            .ctx_storage("write mmr root")?;
        self.roots.flush().ctx_storage("flush mmr")?;

        let proof = MMR::<[u8; 32], MergeBlake3, _>::new(new_size, &self.nodes)
            .gen_proof(vec![pos])
            .ctx_notary("mmr gen_proof")?;
        Ok((root, pos, new_size, proof.proof_items().to_vec()))
    }

    /// Root published when the tree had `mmr_size` nodes, if any.
    pub fn root_at(&self, mmr_size: u64) -> Result<Option<[u8; 32]>> {
        let raw = self.roots.get(mmr_size.to_be_bytes()).ctx_storage("read mmr root")?;
        Ok(raw.and_then(|v| <[u8; 32]>::try_from(v.as_ref()).ok()))
    }

    fn check(&self, hash: &ContentHash, a: &MmrProofArtifact) -> Result<std::result::Result<(), String>> {
        if a.content_hash != *hash {
            return Ok(Err("proof is for a different content hash".into()));
        }
        let Some(root) = decode32(&a.root) else {
            return Ok(Err("malformed root".into()));
        };
        let Some(items) = a.proof.iter().map(|p| decode32(p)).collect::<Option<Vec<_>>>() else {
            return Ok(Err("malformed proof path".into()));
        };

        let leaf = leaf_hash(hash, a.timestamp)?;
        let proof = MerkleProof::<[u8; 32], MergeBlake3>::new(a.mmr_size, items);
        if !proof.verify(root, vec![(a.leaf_pos, leaf)]).unwrap_or(false) {
            return Ok(Err("merkle path does not reach root".into()));
        }

        let key = hex::decode(&a.public_key)
            .ok()
            .and_then(|k| <[u8; 32]>::try_from(k).ok())
            .and_then(|k| ed25519_dalek::VerifyingKey::from_bytes(&k).ok());
        let sig = hex::decode(&a.signature)
            .ok()
            .and_then(|s| <[u8; 64]>::try_from(s).ok())
            .map(|s| ed25519_dalek::Signature::from_bytes(&s));
        let (Some(key), Some(sig)) = (key, sig) else {
            return Ok(Err("malformed signature or key".into()));
        };
        if key != self.signer.public_key() {
            return Ok(Err("checkpoint signed by an unknown key".into()));
        }
        let checkpoint = Checkpoint { root, mmr_size: a.mmr_size, timestamp: a.timestamp };
        if !CheckpointSigner::verify(&key, &checkpoint, &sig)? {
            return Ok(Err("checkpoint signature invalid".into()));
        }

        if self.root_at(a.mmr_size)? != Some(root) {
            return Ok(Err("root was never published by this ledger".into()));
        }
        Ok(Ok(()))
    }
}

fn decode32(s: &str) -> Option<[u8; 32]> {
    hex::decode(s).ok().and_then(|v| v.try_into().ok())
}

impl TimestampBackend for MmrStore {
    fn kind(&self) -> NotaryKind {
        NotaryKind::Mmr
    }

    fn extension(&self) -> &'static str {
        "mmr.json"
    }

    async fn stamp(&self, hash: &ContentHash, dest: &Path) -> Result<StampReceipt> {
        let notarized_at = crate::util::now_utc();
        let timestamp = notarized_at.timestamp();
        let leaf = leaf_hash(hash, timestamp)?;
        let (root, leaf_pos, mmr_size, items) = self.append(leaf)?;

        let signature = self.signer.sign(&Checkpoint { root, mmr_size, timestamp })?;
        let artifact = MmrProofArtifact {
            content_hash: *hash,
            timestamp,
            leaf_pos,
            mmr_size,
            root: hex::encode(root),
            proof: items.iter().map(hex::encode).collect(),
            signature: hex::encode(signature.to_bytes()),
            public_key: hex::encode(self.signer.public_key().to_bytes()),
        };
        let json = serde_json::to_vec_pretty(&artifact).ctx_notary("encode mmr proof")?;
        write_artifact(dest, &json).await?;

        info!(hash = %hash, leaf_pos, root = %artifact.root, "anchored in MMR");
        Ok(StampReceipt { txid: hex::encode(leaf), notarized_at })
    }

    async fn verify(&self, hash: &ContentHash, artifact: &Path) -> Result<VerificationOutcome> {
        let bytes = tokio::fs::read(artifact).await?;
        let parsed: MmrProofArtifact = match serde_json::from_slice(&bytes) {
            Ok(a) => a,
            Err(e) => return Ok(VerificationOutcome::invalid(format!("unreadable proof: {e}"))),
        };
        Ok(match self.check(hash, &parsed)? {
            Ok(()) => VerificationOutcome {
                valid: true,
                detail: format!(
                    "leaf {} under root {} (mmr_size {})",
                    parsed.leaf_pos, parsed.root, parsed.mmr_size
                ),
                notarized_at: chrono::DateTime::from_timestamp(parsed.timestamp, 0),
            },
            Err(why) => VerificationOutcome::invalid(why),
        })
    }
}
