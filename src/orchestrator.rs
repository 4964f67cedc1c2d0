//! 核验编排 (Verification orchestrator)
//!
//! hash -> { classify, analyze metadata, stamp } -> one persisted record.
//!
//! Hashing is the only hard prerequisite. The three signal stages share
//! nothing but the bytes and the hash, so they run concurrently and each one
//! degrades on its own. Only an undecodable image or a storage failure aborts.

use std::sync::Arc;

use tracing::{info, warn};

use crate::classifier::Classifier;
use crate::error::{Result, VerifyError};
use crate::evidence::EvidenceRecord;
use crate::fingerprint::{self, ContentHash};
use crate::metadata::MetadataAnalyzer;
use crate::notary::{Notary, ProofReference, VerificationOutcome};
use crate::store::EvidenceStore;

pub struct Orchestrator {
    store: Arc<EvidenceStore>,
    classifier: Arc<Classifier>,
    metadata: Arc<MetadataAnalyzer>,
    notary: Arc<Notary>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<EvidenceStore>,
        classifier: Arc<Classifier>,
        metadata: Arc<MetadataAnalyzer>,
        notary: Arc<Notary>,
    ) -> Self {
        Self { store, classifier, metadata, notary }
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    pub fn notary(&self) -> &Notary {
        &self.notary
    }

    pub async fn verify_evidence(&self, image: Vec<u8>) -> Result<EvidenceRecord> {
        let bytes: Arc<[u8]> = image.into();

        // 1. 指纹 (CPU 密集型，放到 blocking 线程)
        let (hash, phash) = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || -> Result<(ContentHash, String)> {
                let img = fingerprint::decode(&bytes)?;
                Ok((fingerprint::hash(&bytes), fingerprint::perceptual_hash(&img)))
            })
            .await
            .map_err(|e| VerifyError::Decode(format!("fingerprint task: {e}")))??
        };

        // 2. 入库：先落一条只有哈希的记录，阶段结果随后补上
        let image_reference = self.store.put_image(&hash, &bytes)?;
        let mut record = EvidenceRecord::new(self.store.next_id()?, image_reference, hash);
        record.perceptual_hash = Some(phash);
        self.store.put_record(&record)?;

        // 3. 三路信号并发
        let (classification, metadata, proof) = tokio::join!(
            self.classifier.try_classify(bytes.clone()),
            self.metadata.analyze(&bytes),
            self.notary.stamp(&hash),
        );

        if let Err(e) = &classification {
            warn!(id = record.id, error = %e, "classifier stage degraded");
        }
        if let Err(e) = &metadata {
            warn!(id = record.id, error = %e, "metadata stage degraded");
        }
        if let Err(e) = &proof {
            warn!(id = record.id, error = %e, "notary stage degraded");
        }

        record.apply_classification(classification);
        record.apply_metadata(metadata);
        record.apply_proof(proof);
        self.store.put_record(&record)?;

        info!(
            id = record.id,
            hash = %hash,
            label = ?record.classification.label,
            confidence = record.classification.confidence,
            metadata = record.metadata.status.as_str(),
            notarized = record.timestamp_proof.is_some(),
            "evidence verified"
        );
        Ok(record)
    }

    pub fn get(&self, id: u64) -> Result<Option<EvidenceRecord>> {
        self.store.get_record(id)
    }

    pub fn image(&self, reference: &str) -> Result<Option<Vec<u8>>> {
        self.store.get_image(reference)
    }

    /// Find the proof for `hash` at its deterministic path and check it.
    pub async fn verify_proof(&self, hash: &ContentHash) -> Result<VerificationOutcome> {
        self.notary.verify_hash(hash).await
    }

    pub async fn find_proof(&self, hash: &ContentHash) -> Result<Option<ProofReference>> {
        self.notary.find_by_hash(hash).await
    }
}
