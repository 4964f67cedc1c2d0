//! 错误分类 (Error taxonomy)
//!
//! Only [`VerifyError::Decode`] is fatal to a verification request. Every
//! other variant is caught by the orchestrator and recorded as a stage marker
//! on the evidence record, except [`VerifyError::Storage`] which belongs to the
//! storage collaborator and is propagated to the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    /// Image bytes could not be decoded. Aborts the whole request.
    #[error("decode: {0}")]
    Decode(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Classifier stage only; degrades to the `Error` label.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Preprocessing or inference failed on a ready model.
    #[error("inference: {0}")]
    Inference(String),

    /// Metadata stage only; degrades to a `NoMetadata` report.
    #[error("metadata parse: {0}")]
    MetadataParse(String),

    /// The notary could not be reached or refused the request.
    #[error("notarization failed: {0}")]
    NotarizationFailed(String),

    /// A proof exists but does not check out.
    #[error("notarization unverified: {0}")]
    NotarizationUnverified(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, VerifyError>;

impl VerifyError {
    /// Whether this error must abort the request instead of degrading a stage.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VerifyError::Decode(_) | VerifyError::Storage(_))
    }
}

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Tags a foreign error with the subsystem it came from.
///
/// ```ignore
/// tree.insert(key, value).ctx_storage("insert record")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_storage(self, msg: &str) -> Result<T>;
    fn ctx_notary(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_storage(self, msg: &str) -> Result<T> {
        self.map_err(|e| VerifyError::Storage(format!("{msg}: {e}")))
    }
    fn ctx_notary(self, msg: &str) -> Result<T> {
        self.map_err(|e| VerifyError::NotarizationFailed(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| VerifyError::Config(format!("{msg}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_decode_and_storage_are_fatal() {
        assert!(VerifyError::Decode("x".into()).is_fatal());
        assert!(VerifyError::Storage("x".into()).is_fatal());
        assert!(!VerifyError::ModelUnavailable("x".into()).is_fatal());
        assert!(!VerifyError::NotarizationFailed("x".into()).is_fatal());
        assert!(!VerifyError::MetadataParse("x".into()).is_fatal());
    }

    #[test]
    fn context_prefixes_message() {
        let r: std::result::Result<(), &str> = Err("boom");
        let err = r.ctx_notary("stamp").unwrap_err();
        assert_eq!(err.to_string(), "notarization failed: stamp: boom");
    }
}
