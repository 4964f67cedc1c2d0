//! 配置加载 (Configuration)
//!
//! Loads from (in order):
//! 1. the TOML file named by `JIANZHEN_CONFIG`, else `jianzhen.toml` in the
//!    working directory (absent file means built-in defaults)
//! 2. environment variable overrides (`HOST`, `PORT`, `DB_PATH`, ...)

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ResultExt as _, VerifyError};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    pub metadata: MetadataConfig,
    pub notary: NotaryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sled database holding images and evidence records.
    pub db_path: PathBuf,
    /// Directory for notary proof artefacts, addressed by content hash.
    pub proof_dir: PathBuf,
    /// Append-only JSON ledger of stampings.
    pub ledger_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub url: String,
    /// Reference-architecture weights, used by the last loading fallback.
    pub weights_url: Option<String>,
    pub cache_dir: PathBuf,
    pub file_name: String,
    pub weights_file_name: String,
    pub input_size: u32,
    pub download_timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Tried in order; the first present tag names the device.
    pub device_tags: Vec<String>,
    pub timestamp_tags: Vec<String>,
    /// Substrings of the `Software` tag that identify a raster editor.
    pub editor_signatures: Vec<String>,
    pub geocoding: GeocodingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeocodingConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Decimal places kept when building the cache key.
    pub cache_precision: usize,
    /// Addresses kept in memory; the oldest is evicted first.
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotaryKind {
    /// Local Merkle Mountain Range anchor with signed checkpoints.
    Mmr,
    /// OpenTimestamps CLI.
    Ots,
    /// Centralized REST timestamping API.
    Tsa,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotaryConfig {
    pub backend: NotaryKind,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub key_path: PathBuf,
    pub ots_binary: String,
    pub tsa_url: String,
    pub tsa_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/db/evidence_db"),
            proof_dir: PathBuf::from("data/proofs"),
            ledger_path: PathBuf::from("data/ledger.jsonl"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: "https://models.jianzhen.dev/deepfake_detection_resnet50.onnx".to_string(),
            weights_url: None,
            cache_dir: PathBuf::from("data/models"),
            file_name: "deepfake_detection_resnet50.onnx".to_string(),
            weights_file_name: "deepfake_detection_reference.safetensors".to_string(),
            input_size: 224,
            download_timeout_secs: 120,
            max_retries: 1,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            device_tags: ["Model", "Make", "DeviceModel", "Manufacturer"]
                .into_iter()
                .map(String::from)
                .collect(),
            timestamp_tags: vec!["DateTimeOriginal".to_string()],
            editor_signatures: vec!["Photoshop".to_string()],
            geocoding: GeocodingConfig::default(),
        }
    }
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://nominatim.openstreetmap.org/reverse".to_string(),
            user_agent: format!("jianzhen/{}", crate::util::VERSION),
            timeout_secs: 5,
            cache_precision: 4,
            cache_capacity: 4096,
        }
    }
}

impl Default for NotaryConfig {
    fn default() -> Self {
        Self {
            backend: NotaryKind::Mmr,
            timeout_secs: 30,
            max_retries: 1,
            key_path: PathBuf::from("jianzhen.key"),
            ots_binary: "ots".to_string(),
            tsa_url: String::new(),
            tsa_token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ModelConfig {
    pub fn model_path(&self) -> PathBuf {
        self.cache_dir.join(&self.file_name)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.cache_dir.join(&self.weights_file_name)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl NotaryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Returns defaults if `path` does not exist, `Err` if it exists but is
    /// malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        toml::from_str(&text).ctx_config("parse config TOML")
    }

    /// File (if any) plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let path = env::var("JIANZHEN_CONFIG").unwrap_or_else(|_| "jianzhen.toml".to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        cfg.apply_env(|k| env::var(k).ok())?;
        Ok(cfg)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| VerifyError::Config(format!("PORT must be a number, got {port:?}")))?;
        }
        if let Some(db) = lookup("DB_PATH") {
            self.storage.db_path = PathBuf::from(db);
        }
        if let Some(key) = lookup("KEY_PATH") {
            self.notary.key_path = PathBuf::from(key);
        }
        if let Some(url) = lookup("MODEL_URL") {
            self.model.url = url;
        }
        if let Some(backend) = lookup("NOTARY_BACKEND") {
            self.notary.backend = match backend.to_ascii_lowercase().as_str() {
                "mmr" => NotaryKind::Mmr,
                "ots" => NotaryKind::Ots,
                "tsa" => NotaryKind::Tsa,
                other => {
                    return Err(VerifyError::Config(format!("unknown notary backend {other:?}")))
                }
            };
        }
        if let Some(token) = lookup("TSA_TOKEN") {
            self.notary.tsa_token = Some(token);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }
}
