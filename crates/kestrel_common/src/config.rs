use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Default tuple block size when `block_allocation_target_bytes` is zero.
pub const DEFAULT_BLOCK_TARGET_BYTES: usize = 2 * 1024 * 1024;

fn default_tuples_per_call() -> usize {
    1024
}

fn default_compaction_threshold_ratio() -> f64 {
    0.5
}

/// Per-table storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Target block size in bytes; zero means the engine default.
    /// Block capacity is `floor(target_bytes / tuple_width)` slots.
    #[serde(default)]
    pub block_allocation_target_bytes: usize,

    /// Permit variable-width string columns inlined in the tuple.
    #[serde(default)]
    pub allow_inline_strings: bool,

    /// Elastic index build throttle: tuples indexed per `stream_more` call.
    #[serde(default = "default_tuples_per_call")]
    pub tuples_per_call: usize,

    /// Fraction of a block's capacity that must be free before forced
    /// compaction considers the block a drain candidate.
    #[serde(default = "default_compaction_threshold_ratio")]
    pub compaction_threshold_ratio: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_allocation_target_bytes: 0,
            allow_inline_strings: false,
            tuples_per_call: default_tuples_per_call(),
            compaction_threshold_ratio: default_compaction_threshold_ratio(),
        }
    }
}

impl StorageConfig {
    /// Resolve the configured block size, applying the engine default for zero.
    pub fn effective_block_target_bytes(&self) -> usize {
        if self.block_allocation_target_bytes == 0 {
            DEFAULT_BLOCK_TARGET_BYTES
        } else {
            self.block_allocation_target_bytes
        }
    }

    /// Validate option ranges. Called once at table creation.
    pub fn validate(&self) -> StorageResult<()> {
        if self.tuples_per_call == 0 {
            return Err(StorageError::SchemaMismatch(
                "tuples_per_call must be positive".into(),
            ));
        }
        if !(self.compaction_threshold_ratio > 0.0 && self.compaction_threshold_ratio <= 1.0) {
            return Err(StorageError::SchemaMismatch(format!(
                "compaction_threshold_ratio {} outside (0, 1]",
                self.compaction_threshold_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = StorageConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.effective_block_target_bytes(), DEFAULT_BLOCK_TARGET_BYTES);
        assert!(!cfg.allow_inline_strings);
    }

    #[test]
    fn test_explicit_block_target_wins() {
        let cfg = StorageConfig {
            block_allocation_target_bytes: 4096,
            ..Default::default()
        };
        assert_eq!(cfg.effective_block_target_bytes(), 4096);
    }

    #[test]
    fn test_zero_tuples_per_call_rejected() {
        let cfg = StorageConfig {
            tuples_per_call: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_threshold_ratio_bounds() {
        let mut cfg = StorageConfig {
            compaction_threshold_ratio: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.compaction_threshold_ratio = 1.5;
        assert!(cfg.validate().is_err());
        cfg.compaction_threshold_ratio = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_partial_fields() {
        let cfg: StorageConfig =
            serde_json::from_str(r#"{"block_allocation_target_bytes": 8192}"#).unwrap();
        assert_eq!(cfg.block_allocation_target_bytes, 8192);
        assert_eq!(cfg.tuples_per_call, 1024);
    }
}
