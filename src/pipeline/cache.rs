// Step output cache

use crate::error::Result;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Steps whose outputs are recomputed on every run.
pub const CACHE_EXEMPT_STEPS: [&str; 5] = [
    "deployment_trigger",
    "model_deployer",
    "dynamic_importer",
    "prediction_service_loader",
    "predictor",
];

/// Content-addressed store of step outputs.
///
/// Entries live in memory and, when a directory is given, as
/// `<dir>/<key>.json` so later processes can reuse them.
pub struct StepCache {
    dir: Option<PathBuf>,
    entries: RwLock<HashMap<String, serde_json::Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StepCache {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn is_exempt(step: &str) -> bool {
        CACHE_EXEMPT_STEPS.contains(&step)
    }

    /// Cache key for `step` run on `input`: hex SHA-256 of the step name and serialized input.
    pub fn key<I: Serialize + ?Sized>(step: &str, input: &I) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(step.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(input)?);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Cached output under `key`. An entry that does not decode as `T` is a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let cached = self.entries.read().get(key).cloned();
        let value = cached.or_else(|| self.load(key));

        let decoded = value.and_then(|v| match serde_json::from_value(v) {
            Ok(out) => Some(out),
            Err(e) => {
                debug!(key, error = %e, "Ignoring undecodable cache entry");
                None
            }
        });

        if decoded.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        decoded
    }

    pub fn put<T: Serialize>(&self, key: &str, output: &T) -> Result<()> {
        let value = serde_json::to_value(output)?;

        if let Some(dir) = &self.dir {
            std::fs::create_dir_all(dir)?;
            std::fs::write(entry_path(dir, key), serde_json::to_vec(&value)?)?;
        }

        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    /// Drops every entry, on disk too.
    pub fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        if let Some(dir) = &self.dir {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    fn load(&self, key: &str) -> Option<serde_json::Value> {
        let path = entry_path(self.dir.as_deref()?, key);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => {
                self.entries.write().insert(key.to_string(), value.clone());
                Some(value)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache file");
                None
            }
        }
    }
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.json", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScorePair;

    #[test]
    fn test_key_depends_on_step_and_input() {
        let a = StepCache::key("train_model", &("abc", 1)).unwrap();
        let b = StepCache::key("train_model", &("abc", 1)).unwrap();
        let c = StepCache::key("evaluate_model", &("abc", 1)).unwrap();
        let d = StepCache::key("train_model", &("abc", 2)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_exempt_steps() {
        assert!(StepCache::is_exempt("deployment_trigger"));
        assert!(StepCache::is_exempt("predictor"));
        assert!(!StepCache::is_exempt("train_model"));
    }

    #[test]
    fn test_memory_round_trip_and_miss() {
        let cache = StepCache::in_memory();
        let scores = ScorePair { r2: 0.4, rmse: 0.3 };

        assert!(cache.get::<ScorePair>("k").is_none());
        cache.put("k", &scores).unwrap();
        assert_eq!(cache.get::<ScorePair>("k"), Some(scores));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_undecodable_entry_is_miss() {
        let cache = StepCache::in_memory();
        cache.put("k", &"not a score").unwrap();
        assert!(cache.get::<ScorePair>("k").is_none());
    }

    #[test]
    fn test_disk_entries_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let scores = ScorePair { r2: 0.9, rmse: 0.1 };

        StepCache::new(Some(dir.path().to_path_buf())).put("k", &scores).unwrap();

        let reopened = StepCache::new(Some(dir.path().to_path_buf()));
        assert_eq!(reopened.get::<ScorePair>("k"), Some(scores));

        reopened.clear().unwrap();
        assert!(StepCache::new(Some(dir.path().to_path_buf())).get::<ScorePair>("k").is_none());
    }
}
