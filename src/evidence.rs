use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::ContentHash;
use crate::metadata::{MetadataReport, MetadataStatus};
use crate::notary::ProofReference;

/// 判决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticityLabel {
    Real,
    Fake,
    /// The classifier stage failed; always paired with confidence 0.0.
    Error,
}

/// Classifier output: confidence is the probability of the *reported* label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: AuthenticityLabel,
    pub confidence: f32,
}

impl Classification {
    pub const ERROR: Classification = Classification {
        label: AuthenticityLabel::Error,
        confidence: 0.0,
    };

    pub fn is_authentic(&self) -> bool {
        self.label == AuthenticityLabel::Real
    }
}

/// Per-stage failure markers. `None` means the stage succeeded (or has not
/// run yet).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageErrors {
    pub classifier: Option<String>,
    pub metadata: Option<String>,
    pub notary: Option<String>,
}

/// 证据记录 (Evidence Record)
///
/// 一次核验的持久化结果。`content_hash` 和 `created_at` 创建后不可变；
/// 其余字段按阶段各写一次，允许部分成功。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: u64,
    /// Handle into the image store; the store owns the bytes.
    pub image_reference: String,
    pub content_hash: ContentHash,
    pub perceptual_hash: Option<String>,
    pub classification: Classification,
    pub metadata: MetadataReport,
    pub timestamp_proof: Option<ProofReference>,
    pub stage_errors: StageErrors,
    pub created_at: DateTime<Utc>,
}

impl EvidenceRecord {
    /// A fresh record carries the stage sentinels until each stage reports.
    pub fn new(id: u64, image_reference: String, content_hash: ContentHash) -> Self {
        Self {
            id,
            image_reference,
            content_hash,
            perceptual_hash: None,
            classification: Classification::ERROR,
            metadata: MetadataReport::empty(),
            timestamp_proof: None,
            stage_errors: StageErrors::default(),
            created_at: crate::util::now_utc(),
        }
    }

    pub fn apply_classification(&mut self, result: crate::error::Result<Classification>) {
        match result {
            Ok(c) => {
                self.classification = c;
                self.stage_errors.classifier = None;
            }
            Err(e) => {
                self.classification = Classification::ERROR;
                self.stage_errors.classifier = Some(e.to_string());
            }
        }
    }

    pub fn apply_metadata(&mut self, result: crate::error::Result<MetadataReport>) {
        match result {
            Ok(report) => {
                self.metadata = report;
                self.stage_errors.metadata = None;
            }
            Err(e) => {
                self.metadata = MetadataReport::empty();
                self.stage_errors.metadata = Some(e.to_string());
            }
        }
    }

    /// A proof is only accepted for the hash this record was built from.
    pub fn apply_proof(&mut self, result: crate::error::Result<ProofReference>) {
        match result {
            Ok(proof) if proof.content_hash == self.content_hash => {
                self.timestamp_proof = Some(proof);
                self.stage_errors.notary = None;
            }
            Ok(proof) => {
                self.timestamp_proof = None;
                self.stage_errors.notary = Some(format!(
                    "proof for {} does not match record hash {}",
                    proof.content_hash, self.content_hash
                ));
            }
            Err(e) => {
                self.timestamp_proof = None;
                self.stage_errors.notary = Some(e.to_string());
            }
        }
    }

    pub fn to_response(&self) -> EvidenceResponse {
        let hash = self.content_hash.to_hex();
        EvidenceResponse {
            id: self.id,
            image_url: format!("/images/{}", self.image_reference),
            is_authentic: self.classification.is_authentic(),
            label: self.classification.label,
            confidence: self.classification.confidence,
            metadata_status: self.metadata.status.as_str().to_string(),
            metadata_details: self.metadata.details.clone(),
            image_hash: hash.clone(),
            blockchain_hash: self.timestamp_proof.as_ref().map(|_| hash),
            timestamp_proof: self.timestamp_proof.clone(),
            location: self.metadata.location.clone(),
            address: self.metadata.address.clone(),
            device: self.metadata.device.clone(),
            timestamp: self.metadata.timestamp.clone(),
            inconsistencies: self.metadata.inconsistencies.clone(),
            perceptual_hash: self.perceptual_hash.clone(),
            stage_errors: self.stage_errors.clone(),
            created_at: self.created_at,
        }
    }
}

/// 响应：核验回执
///
/// Field set is stable regardless of which stages failed; failed stages show
/// their sentinel instead of disappearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceResponse {
    pub id: u64,
    pub image_url: String,
    pub is_authentic: bool,
    pub label: AuthenticityLabel,
    pub confidence: f32,
    pub metadata_status: String,
    pub metadata_details: BTreeMap<String, String>,
    pub image_hash: String,
    pub blockchain_hash: Option<String>,
    pub timestamp_proof: Option<ProofReference>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub device: Option<String>,
    pub timestamp: Option<String>,
    pub inconsistencies: Vec<String>,
    pub perceptual_hash: Option<String>,
    pub stage_errors: StageErrors,
    pub created_at: DateTime<Utc>,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::Clean => "Clean",
            MetadataStatus::PhotoshopDetected => "Photoshop detected",
            MetadataStatus::NoMetadata => "No metadata",
        }
    }
}
