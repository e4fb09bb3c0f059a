use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TundraError};

/// Highest spill/repartition level the hash seed table supports.
pub const MAX_HASH_LEVEL: u8 = 16;

/// Engine-wide execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target rows per output batch.
    pub batch_size_rows: usize,
    /// Soft memory budget for one query fragment.
    pub mem_budget_bytes: usize,
    /// Number of scanner threads a scan node may start.
    pub scanner_threads: usize,
    /// Capacity of the scan node's batch queue.
    pub max_buffered_batches: usize,
    /// Upper bound for the aggregation hash level.
    pub max_hash_level: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 8192,
            mem_budget_bytes: 512 * 1024 * 1024,
            scanner_threads: 4,
            max_buffered_batches: 8,
            max_hash_level: MAX_HASH_LEVEL,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw).map_err(|e| {
            TundraError::Construction(format!("invalid config {}: {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `TUNDRA_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        self.batch_size_rows = env_usize_or("TUNDRA_BATCH_SIZE_ROWS", self.batch_size_rows);
        self.mem_budget_bytes = env_usize_or("TUNDRA_MEM_BUDGET_BYTES", self.mem_budget_bytes);
        self.scanner_threads = env_usize_or("TUNDRA_SCANNER_THREADS", self.scanner_threads);
        self.max_buffered_batches =
            env_usize_or("TUNDRA_MAX_BUFFERED_BATCHES", self.max_buffered_batches);
        self
    }

    /// Reject settings the scan and aggregation nodes cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size_rows == 0 {
            return Err(TundraError::Construction(
                "batch_size_rows must be > 0".to_string(),
            ));
        }
        if self.scanner_threads == 0 {
            return Err(TundraError::Construction(
                "scanner_threads must be > 0".to_string(),
            ));
        }
        if self.max_buffered_batches == 0 {
            return Err(TundraError::Construction(
                "max_buffered_batches must be > 0".to_string(),
            ));
        }
        if self.max_hash_level > MAX_HASH_LEVEL {
            return Err(TundraError::Construction(format!(
                "max_hash_level {} exceeds supported maximum {MAX_HASH_LEVEL}",
                self.max_hash_level
            )));
        }
        Ok(())
    }
}

fn env_usize_or(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().expect("default config");
    }

    #[test]
    fn zero_queue_capacity_is_a_construction_error() {
        let cfg = EngineConfig {
            max_buffered_batches: 0,
            ..EngineConfig::default()
        };
        let err = cfg.validate().expect_err("zero capacity");
        assert!(err.to_string().contains("max_buffered_batches"));
    }

    #[test]
    fn json_file_fills_missing_fields_with_defaults() {
        let path = std::env::temp_dir().join(format!(
            "tundra_cfg_{}.json",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock before epoch")
                .as_nanos()
        ));
        fs::write(&path, r#"{"scanner_threads": 2, "max_buffered_batches": 3}"#)
            .expect("write config");
        let cfg = EngineConfig::from_json_file(&path).expect("load config");
        assert_eq!(cfg.scanner_threads, 2);
        assert_eq!(cfg.max_buffered_batches, 3);
        assert_eq!(cfg.batch_size_rows, 8192);
        let _ = fs::remove_file(path);
    }
}
