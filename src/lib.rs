//! 鉴真 (jianzhen): evidence verification pipeline.
//!
//! A submitted image is hashed, then three independent forensic signals are
//! gathered concurrently and merged into one persisted [`evidence::EvidenceRecord`]:
//!
//! - a learned tamper classifier ([`classifier`], [`model`], [`predictor`])
//! - EXIF metadata consistency ([`metadata`], [`geocode`])
//! - a trusted timestamp over the content hash ([`notary`] with the
//!   [`mmr_store`], [`ots`] and [`tsa`] backends)
//!
//! Only an undecodable image aborts a request; every other stage degrades to
//! a sentinel on the record.

pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod geocode;
pub mod ledger;
pub mod metadata;
pub mod mmr_store;
pub mod model;
pub mod notary;
pub mod orchestrator;
pub mod ots;
pub mod predictor;
pub mod signer;
pub mod store;
pub mod tsa;
pub mod util;
