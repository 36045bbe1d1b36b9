//! Per-run configuration.
//!
//! Every knob has a default; the CLI overrides them from flags or the
//! environment and hands the finished [`RunSpec`] to the orchestrator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hard cap on concurrent KV chunk writers, whatever the configured hint.
pub const MAX_KV_CHUNK_WRITERS: usize = 8;

/// Capacity of the shared row channels feeding the chunker and the enricher.
pub const ROW_CHANNEL_CAPACITY: usize = 1000;

/// Entries per KV write transaction.
pub const KV_CHUNK_SIZE: usize = 1000;

/// Complete specification of one transformation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Directory holding the downloaded CSV drop and the `updated_at.txt`
    /// sidecar.
    pub data_dir: PathBuf,

    /// Connection string of the relational target.
    pub database_url: String,

    /// Concurrent batch-write workers against the database.
    #[serde(default = "default_max_parallel_db_queries")]
    pub max_parallel_db_queries: usize,

    /// Hint for the KV writer pool size; effectively capped at
    /// [`MAX_KV_CHUNK_WRITERS`] chunk workers.
    #[serde(default = "default_max_parallel_kv_writes")]
    pub max_parallel_kv_writes: usize,

    /// Companies per write transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Drop and recreate the output schema before Phase B.
    #[serde(default)]
    pub clean_up: bool,

    /// Strip personally identifying fields from emitted records.
    #[serde(default = "default_true")]
    pub privacy: bool,

    /// Write to structured venue/partner tables instead of the JSON column.
    #[serde(default)]
    pub structured: bool,
}

impl RunSpec {
    pub fn new(data_dir: impl Into<PathBuf>, database_url: impl Into<String>) -> Self {
        RunSpec {
            data_dir: data_dir.into(),
            database_url: database_url.into(),
            max_parallel_db_queries: default_max_parallel_db_queries(),
            max_parallel_kv_writes: default_max_parallel_kv_writes(),
            batch_size: default_batch_size(),
            clean_up: false,
            privacy: default_true(),
            structured: false,
        }
    }

    /// Effective number of KV chunk writers for this run.
    pub fn kv_writers(&self) -> usize {
        self.max_parallel_kv_writes.clamp(1, MAX_KV_CHUNK_WRITERS)
    }

    /// Effective number of database batch workers for this run.
    pub fn db_writers(&self) -> usize {
        self.max_parallel_db_queries.max(1)
    }
}

fn default_max_parallel_db_queries() -> usize {
    4
}

fn default_max_parallel_kv_writes() -> usize {
    256
}

fn default_batch_size() -> usize {
    512
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_knobs() {
        let spec = RunSpec::new("/data", "postgres://localhost/cnpj");
        assert_eq!(spec.max_parallel_db_queries, 4);
        assert_eq!(spec.max_parallel_kv_writes, 256);
        assert_eq!(spec.batch_size, 512);
        assert!(!spec.clean_up);
        assert!(spec.privacy);
        assert!(!spec.structured);
    }

    #[test]
    fn kv_writer_pool_is_capped() {
        let mut spec = RunSpec::new("/data", "postgres://localhost/cnpj");
        assert_eq!(spec.kv_writers(), MAX_KV_CHUNK_WRITERS);
        spec.max_parallel_kv_writes = 3;
        assert_eq!(spec.kv_writers(), 3);
        spec.max_parallel_kv_writes = 0;
        assert_eq!(spec.kv_writers(), 1);
    }
}
