//! Append-only JSON-lines ledger of stampings: one `{txid, hash, timestamp}`
//! object per line. Kept alongside any notary backend so a proof can be
//! discovered from the content hash alone.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, ResultExt as _, VerifyError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub txid: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

pub struct Ledger {
    path: PathBuf,
    // hash -> latest entry; rebuilt from the file on open
    index: Mutex<HashMap<String, LedgerEntry>>,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self> {
        let mut index = HashMap::new();
        if path.exists() {
            let raw = std::fs::read(path)?;
            for (lineno, line) in raw.split(|b| *b == b'\n').enumerate() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<LedgerEntry>(line) {
                    Ok(entry) => {
                        index.insert(entry.hash.clone(), entry);
                    }
                    // a torn last line must not make every earlier stamp undiscoverable
                    Err(e) => warn!(line = lineno + 1, error = %e, "skipping unreadable ledger line"),
                }
            }
            // terminate a torn tail so the next append starts on its own line
            if raw.last().is_some_and(|b| *b != b'\n') {
                let mut file = OpenOptions::new().append(true).open(path)?;
                file.write_all(b"\n")?;
                file.sync_data()?;
            }
        }
        Ok(Self { path: path.to_path_buf(), index: Mutex::new(index) })
    }

    pub fn append(&self, entry: LedgerEntry) -> Result<()> {
        let mut index = self
            .index
            .lock()
            .map_err(|_| VerifyError::Storage("ledger index poisoned".into()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&entry).ctx_storage("encode ledger entry")?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        index.insert(entry.hash.clone(), entry);
        Ok(())
    }

    pub fn find_by_hash(&self, hash: &str) -> Result<Option<LedgerEntry>> {
        let index = self
            .index
            .lock()
            .map_err(|_| VerifyError::Storage("ledger index poisoned".into()))?;
        Ok(index.get(hash).cloned())
    }
}
