//! OpenTimestamps backend.
//!
//! The CLI stamps files, not digests, so the hex content hash is written to
//! `<proof_dir>/<hash>.digest` and that file is stamped. The digest file stays
//! next to the `.ots` proof; verification needs both.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{NotaryConfig, NotaryKind};
use crate::error::{Result, VerifyError};
use crate::fingerprint::ContentHash;
use crate::notary::{StampReceipt, TimestampBackend, VerificationOutcome};
use crate::util::with_retry;

pub struct OtsNotary {
    program: String,
    // leading arguments, e.g. `python3 -m otsclient`
    prefix: Vec<String>,
    timeout: Duration,
    max_retries: u32,
}

impl OtsNotary {
    pub fn new(cfg: &NotaryConfig) -> Self {
        let mut parts = cfg.ots_binary.split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_else(|| "ots".to_string());
        Self {
            program,
            prefix: parts.collect(),
            timeout: cfg.timeout(),
            max_retries: cfg.max_retries,
        }
    }

    fn digest_path(proof: &Path) -> PathBuf {
        // <hash>.ots -> <hash>.digest
        proof.with_extension("digest")
    }

    async fn run(&self, label: &str, args: &[&str]) -> Result<Output> {
        let (program, prefix) = (self.program.as_str(), &self.prefix);
        with_retry(label, self.timeout, self.max_retries, || async move {
            Command::new(program)
                .args(prefix)
                .args(args)
                .kill_on_drop(true)
                .output()
                .await
        })
        .await
        .map_err(|e| VerifyError::NotarizationFailed(format!("{label}: {e}")))
    }
}

/// `... attests existence as of 2023-07-24 UTC` -> that date at midnight.
fn parse_attested_date(text: &str) -> Option<DateTime<Utc>> {
    let start = text.find("as of ")? + "as of ".len();
    let date = text.get(start..start + 10)?;
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(day.and_hms_opt(0, 0, 0)?.and_utc())
}

impl TimestampBackend for OtsNotary {
    fn kind(&self) -> NotaryKind {
        NotaryKind::Ots
    }

    fn extension(&self) -> &'static str {
        "ots"
    }

    async fn stamp(&self, hash: &ContentHash, dest: &Path) -> Result<StampReceipt> {
        let digest = Self::digest_path(dest);
        if let Some(parent) = digest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&digest, hash.to_hex()).await?;

        let digest_arg = digest.to_string_lossy().into_owned();
        let out = self.run("ots stamp", &["stamp", digest_arg.as_str()]).await?;
        if !out.status.success() {
            return Err(VerifyError::NotarizationFailed(format!(
                "ots stamp exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        // the client writes <file>.ots beside its input
        let mut produced = digest.as_os_str().to_owned();
        produced.push(".ots");
        let produced = PathBuf::from(produced);
        if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            return Err(VerifyError::NotarizationFailed(
                "ots stamp succeeded but produced no proof file".into(),
            ));
        }
        tokio::fs::rename(&produced, dest).await?;

        info!(hash = %hash, proof = %dest.display(), "submitted to OpenTimestamps calendars");
        Ok(StampReceipt { txid: hash.to_hex(), notarized_at: crate::util::now_utc() })
    }

    async fn verify(&self, hash: &ContentHash, artifact: &Path) -> Result<VerificationOutcome> {
        let digest = Self::digest_path(artifact);
        match tokio::fs::read_to_string(&digest).await {
            Ok(text) if text.trim() == hash.to_hex() => {}
            Ok(_) => return Ok(VerificationOutcome::invalid("digest file does not match content hash")),
            Err(_) => return Ok(VerificationOutcome::invalid("digest file missing")),
        }

        let digest_arg = digest.to_string_lossy().into_owned();
        let proof_arg = artifact.to_string_lossy().into_owned();
        let out = self.run("ots verify", &["verify", "-f", digest_arg.as_str(), proof_arg.as_str()]).await?;
        // the client reports on stderr
        let mut text = String::from_utf8_lossy(&out.stderr).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stdout));
        let text = text.trim().to_string();
        debug!(status = %out.status, output = %text, "ots verify");

        if out.status.success() {
            Ok(VerificationOutcome { valid: true, notarized_at: parse_attested_date(&text), detail: text })
        } else {
            Ok(VerificationOutcome::invalid(text))
        }
    }
}
