//! 时间戳公证 (Timestamp notary)
//!
//! Anchors a content hash with a trusted timestamp and keeps the proof on disk
//! at a path derived from the hash alone, so it can be found again without
//! the evidence record. Three interchangeable backends sit behind
//! [`TimestampBackend`]:
//!
//! - `mmr`: local Merkle Mountain Range with signed checkpoints
//! - `ots`: OpenTimestamps command line client
//! - `tsa`: bearer-authenticated REST timestamping service
//!
//! Every stamping is also appended to the [`Ledger`].

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, NotaryKind};
use crate::error::{Result, VerifyError};
use crate::fingerprint::ContentHash;
use crate::ledger::{Ledger, LedgerEntry};
use crate::mmr_store::MmrStore;
use crate::ots::OtsNotary;
use crate::tsa::TsaNotary;

/// Where the proof for a content hash lives and how to check it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofReference {
    pub backend: NotaryKind,
    pub content_hash: ContentHash,
    /// Proof artefact path on disk.
    pub path: String,
    /// Backend-specific transaction id (MMR leaf, TSA id, OTS digest).
    pub txid: String,
    pub notarized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub valid: bool,
    pub detail: String,
    pub notarized_at: Option<DateTime<Utc>>,
}

impl VerificationOutcome {
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self { valid: false, detail: detail.into(), notarized_at: None }
    }

    /// `Err(NotarizationUnverified)` unless the proof checked out.
    pub fn into_result(self) -> Result<Self> {
        if self.valid {
            Ok(self)
        } else {
            Err(VerifyError::NotarizationUnverified(self.detail))
        }
    }
}

/// What a backend reports after writing its artefact.
#[derive(Debug, Clone)]
pub struct StampReceipt {
    pub txid: String,
    pub notarized_at: DateTime<Utc>,
}

/// A timestamping authority.
///
/// `stamp` must leave either a complete artefact at `dest` or nothing there.
pub trait TimestampBackend: Send + Sync {
    fn kind(&self) -> NotaryKind;

    /// File extension of the proof artefact, without the leading dot.
    fn extension(&self) -> &'static str;

    fn stamp(
        &self,
        hash: &ContentHash,
        dest: &Path,
    ) -> impl Future<Output = Result<StampReceipt>> + Send;

    fn verify(
        &self,
        hash: &ContentHash,
        artifact: &Path,
    ) -> impl Future<Output = Result<VerificationOutcome>> + Send;
}

/// Write to a private `<dest>.<nonce>.part` then rename, so a crash never
/// leaves a torn proof and concurrent writers never share a temp file.
pub async fn write_artifact(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = dest.as_os_str().to_owned();
    tmp.push(format!(".{:016x}.part", rand::random::<u64>()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

pub enum Backend {
    Mmr(MmrStore),
    Ots(OtsNotary),
    Tsa(TsaNotary),
}

impl TimestampBackend for Backend {
    fn kind(&self) -> NotaryKind {
        match self {
            Backend::Mmr(b) => b.kind(),
            Backend::Ots(b) => b.kind(),
            Backend::Tsa(b) => b.kind(),
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Backend::Mmr(b) => b.extension(),
            Backend::Ots(b) => b.extension(),
            Backend::Tsa(b) => b.extension(),
        }
    }

    async fn stamp(&self, hash: &ContentHash, dest: &Path) -> Result<StampReceipt> {
        match self {
            Backend::Mmr(b) => b.stamp(hash, dest).await,
            Backend::Ots(b) => b.stamp(hash, dest).await,
            Backend::Tsa(b) => b.stamp(hash, dest).await,
        }
    }

    async fn verify(&self, hash: &ContentHash, artifact: &Path) -> Result<VerificationOutcome> {
        match self {
            Backend::Mmr(b) => b.verify(hash, artifact).await,
            Backend::Ots(b) => b.verify(hash, artifact).await,
            Backend::Tsa(b) => b.verify(hash, artifact).await,
        }
    }
}

type HashLock = Arc<tokio::sync::Mutex<()>>;

pub struct Notary {
    backend: Backend,
    proof_dir: PathBuf,
    ledger: Ledger,
    // one stamping per content hash at a time; entries live while in use
    in_flight: Mutex<HashMap<ContentHash, HashLock>>,
}

impl Notary {
    pub fn new(backend: Backend, proof_dir: PathBuf, ledger: Ledger) -> Self {
        Self { backend, proof_dir, ledger, in_flight: Mutex::new(HashMap::new()) }
    }

    /// Build the backend named in `cfg.notary.backend`. The MMR store is only
    /// consulted when that backend is selected.
    pub fn from_config(cfg: &Config, mmr: MmrStore) -> Result<Self> {
        let backend = match cfg.notary.backend {
            NotaryKind::Mmr => Backend::Mmr(mmr),
            NotaryKind::Ots => Backend::Ots(OtsNotary::new(&cfg.notary)),
            NotaryKind::Tsa => Backend::Tsa(TsaNotary::new(&cfg.notary)?),
        };
        let ledger = Ledger::open(&cfg.storage.ledger_path)?;
        Ok(Self::new(backend, cfg.storage.proof_dir.clone(), ledger))
    }

    pub fn kind(&self) -> NotaryKind {
        self.backend.kind()
    }

    /// `<proof_dir>/<hex hash>.<ext>`; a pure function of the hash.
    pub fn proof_path(&self, hash: &ContentHash) -> PathBuf {
        self.proof_dir.join(format!("{}.{}", hash.to_hex(), self.backend.extension()))
    }

    /// Anchor `hash`. Stamping the same content twice, even concurrently,
    /// returns the existing proof instead of creating a second one.
    pub async fn stamp(&self, hash: &ContentHash) -> Result<ProofReference> {
        let lock = self.hash_lock(hash)?;
        let result = {
            let _guard = lock.lock().await;
            self.stamp_exclusive(hash).await
        };
        self.release_hash_lock(hash, lock);
        result
    }

    fn hash_lock(&self, hash: &ContentHash) -> Result<HashLock> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| VerifyError::NotarizationFailed("stamp lock table poisoned".into()))?;
        Ok(in_flight.entry(*hash).or_default().clone())
    }

    fn release_hash_lock(&self, hash: &ContentHash, lock: HashLock) {
        drop(lock);
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if in_flight.get(hash).is_some_and(|l| Arc::strong_count(l) == 1) {
                in_flight.remove(hash);
            }
        }
    }

    async fn stamp_exclusive(&self, hash: &ContentHash) -> Result<ProofReference> {
        let dest = self.proof_path(hash);
        let key = hash.to_hex();

        if let Some(entry) = self.ledger.find_by_hash(&key)? {
            if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                return Ok(self.reference(hash, &dest, entry.txid, entry.timestamp));
            }
            warn!(hash = %hash, "ledger entry without proof artefact; re-stamping");
        }

        let receipt = self.backend.stamp(hash, &dest).await.map_err(|e| match e {
            VerifyError::NotarizationFailed(_) => e,
            other => VerifyError::NotarizationFailed(other.to_string()),
        })?;

        self.ledger
            .append(LedgerEntry {
                txid: receipt.txid.clone(),
                hash: key,
                timestamp: receipt.notarized_at,
            })
            .map_err(|e| VerifyError::NotarizationFailed(format!("ledger: {e}")))?;

        info!(hash = %hash, backend = ?self.kind(), txid = %receipt.txid, "notarized");
        Ok(self.reference(hash, &dest, receipt.txid, receipt.notarized_at))
    }

    /// Check a previously issued proof. A missing artefact is reported as
    /// invalid, not as an error.
    pub async fn verify(&self, proof: &ProofReference) -> Result<VerificationOutcome> {
        let path = Path::new(&proof.path);
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(VerificationOutcome::invalid("proof artefact not found"));
        }
        if proof.backend != self.kind() {
            return Ok(VerificationOutcome::invalid(format!(
                "proof was issued by the {:?} backend, this notary runs {:?}",
                proof.backend,
                self.kind()
            )));
        }
        self.backend.verify(&proof.content_hash, path).await
    }

    /// Locate the proof for `hash` by its deterministic path and check it.
    pub async fn verify_hash(&self, hash: &ContentHash) -> Result<VerificationOutcome> {
        let Some(proof) = self.find_by_hash(hash).await? else {
            return Ok(VerificationOutcome::invalid("no proof recorded for this hash"));
        };
        self.verify(&proof).await
    }

    /// Rebuild the proof reference for `hash` from the ledger, if the
    /// artefact is still on disk.
    pub async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<ProofReference>> {
        let dest = self.proof_path(hash);
        let Some(entry) = self.ledger.find_by_hash(&hash.to_hex())? else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(self.reference(hash, &dest, entry.txid, entry.timestamp)))
    }

    /// Raw ledger entry for `hash`, whether or not the artefact survives.
    pub fn ledger_entry(&self, hash: &ContentHash) -> Result<Option<LedgerEntry>> {
        self.ledger.find_by_hash(&hash.to_hex())
    }

    fn reference(
        &self,
        hash: &ContentHash,
        dest: &Path,
        txid: String,
        notarized_at: DateTime<Utc>,
    ) -> ProofReference {
        ProofReference {
            backend: self.kind(),
            content_hash: *hash,
            path: dest.display().to_string(),
            txid,
            notarized_at,
        }
    }
}
