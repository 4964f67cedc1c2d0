//! Centralized timestamping authority over REST.
//!
//! `POST {base}/timestamps {"hash"}` returns `{id, timestamp, proof}`; that
//! reply is stored verbatim as the proof artefact. Verification replays it to
//! `POST {base}/timestamps/verify`.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{NotaryConfig, NotaryKind};
use crate::error::{Result, ResultExt as _, VerifyError};
use crate::fingerprint::ContentHash;
use crate::notary::{write_artifact, StampReceipt, TimestampBackend, VerificationOutcome};
use crate::util::with_retry;

#[derive(Serialize)]
struct StampRequest<'a> {
    hash: &'a str,
}

/// Stored as `<hash>.tsa.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsaToken {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque signed token issued by the authority.
    pub proof: String,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    hash: &'a str,
    id: &'a str,
    proof: &'a str,
}

#[derive(Deserialize)]
struct VerifyReply {
    valid: bool,
    #[serde(default)]
    message: Option<String>,
}

pub struct TsaNotary {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    max_retries: u32,
}

impl TsaNotary {
    pub fn new(cfg: &NotaryConfig) -> Result<Self> {
        if cfg.tsa_url.is_empty() {
            return Err(VerifyError::Config("notary.tsa_url is required for the tsa backend".into()));
        }
        let client = reqwest::Client::builder()
            .user_agent(format!("jianzhen/{}", crate::util::VERSION))
            .build()
            .ctx_config("build TSA client")?;
        Ok(Self {
            client,
            base_url: cfg.tsa_url.trim_end_matches('/').to_string(),
            token: cfg.tsa_token.clone(),
            timeout: cfg.timeout(),
            max_retries: cfg.max_retries,
        })
    }

    async fn post<B: Serialize + Sync, R: for<'de> Deserialize<'de> + Send>(
        &self,
        label: &str,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let (client, url, token) = (&self.client, url.as_str(), self.token.as_deref());
        with_retry(label, self.timeout, self.max_retries, || async move {
            let mut req = client.post(url).json(body);
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            req.send().await?.error_for_status()?.json::<R>().await
        })
        .await
        .map_err(|e| VerifyError::NotarizationFailed(format!("{label}: {e}")))
    }
}

impl TimestampBackend for TsaNotary {
    fn kind(&self) -> NotaryKind {
        NotaryKind::Tsa
    }

    fn extension(&self) -> &'static str {
        "tsa.json"
    }

    async fn stamp(&self, hash: &ContentHash, dest: &Path) -> Result<StampReceipt> {
        let hex = hash.to_hex();
        let token: TsaToken = self
            .post("tsa stamp", "/timestamps", &StampRequest { hash: &hex })
            .await?;
        let json = serde_json::to_vec_pretty(&token).ctx_notary("encode tsa token")?;
        write_artifact(dest, &json).await?;
        info!(hash = %hash, id = %token.id, "timestamped by TSA");
        Ok(StampReceipt { txid: token.id, notarized_at: token.timestamp })
    }

    async fn verify(&self, hash: &ContentHash, artifact: &Path) -> Result<VerificationOutcome> {
        let bytes = tokio::fs::read(artifact).await?;
        let token: TsaToken = match serde_json::from_slice(&bytes) {
            Ok(t) => t,
            Err(e) => return Ok(VerificationOutcome::invalid(format!("unreadable token: {e}"))),
        };
        let hex = hash.to_hex();
        let reply: VerifyReply = self
            .post(
                "tsa verify",
                "/timestamps/verify",
                &VerifyRequest { hash: &hex, id: &token.id, proof: &token.proof },
            )
            .await?;
        Ok(if reply.valid {
            VerificationOutcome {
                valid: true,
                detail: reply.message.unwrap_or_else(|| format!("TSA token {}", token.id)),
                notarized_at: Some(token.timestamp),
            }
        } else {
            VerificationOutcome::invalid(reply.message.unwrap_or_else(|| "rejected by TSA".into()))
        })
    }
}
