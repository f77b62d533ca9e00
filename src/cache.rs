//! Disk-backed cache with per-entry TTL.
//!
//! One JSON file per key under the cache directory; the filename is the
//! sha256 of the key so arbitrary key strings stay filesystem-safe.
//! Expired or corrupted entries are deleted on read.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    expires_at: u64,
    value: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    default_ttl: Duration,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl DiskCache {
    pub fn open(dir: impl Into<PathBuf>, default_ttl: Duration) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, default_ttl })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{:x}.json", digest))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.entry_path(key);
        let text = std::fs::read_to_string(&path).ok()?;
        let entry: Entry = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(_) => {
                // Corrupted entry; drop it.
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };
        if now_secs() > entry.expires_at {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        serde_json::from_value(entry.value).ok()
    }

    /// Store a value; `ttl` of `None` uses the cache default.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let entry = Entry {
            expires_at: now_secs().saturating_add(ttl.as_secs()),
            value,
        };
        let path = self.entry_path(key);
        let tmp = path.with_extension("tmp");
        if let Ok(text) = serde_json::to_string(&entry) {
            if std::fs::write(&tmp, text).is_ok() {
                let _ = std::fs::rename(&tmp, &path);
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
