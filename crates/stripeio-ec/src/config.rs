//! Engine configuration

use serde::{Deserialize, Serialize};

/// Configuration for the erasure-coding engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Plan reads per requested range instead of whole chunk-aligned
    /// stripes, when the codec supports partial reads
    pub partial_reads: bool,
    /// Skip growing every shard read to the superset of wanted extents.
    /// Unsafe with recovery: a retried shard is never re-read, so it must
    /// already hold the superset.
    pub partial_reads_experimental: bool,
    /// Maximum resident bytes in the shard-extent cache
    pub cache_max_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partial_reads: true,
            partial_reads_experimental: false,
            cache_max_bytes: 128 * 1024 * 1024, // 128 MB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.partial_reads);
        assert!(!config.partial_reads_experimental);
        assert_eq!(config.cache_max_bytes, 128 * 1024 * 1024);
    }
}
