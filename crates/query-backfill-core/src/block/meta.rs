//! Sub-block metadata (`meta.json`) and the read-only block inspector.

use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    block::layout::{META_FILE_NAME, is_builder_private},
    storage::{self, StorageError},
};

/// Current `meta.json` format version.
pub const META_VERSION: u32 = 1;

/// Metadata describing one finished sub-block.
///
/// JSON layout example:
///
/// ```json
/// {
///   "ulid": "0190a6c3-5b7e-7c4a-9d2e-3f1b2a4c5d6e",
///   "minTime": 1700000000000,
///   "maxTime": 1700007199000,
///   "stats": { "numSamples": 7200, "numSeries": 3, "numChunks": 1 },
///   "version": 1
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    /// Unique, time-ordered block id; also the directory name.
    pub ulid: String,
    /// Smallest sample timestamp (inclusive).
    pub min_time: i64,
    /// Largest sample timestamp (inclusive).
    pub max_time: i64,
    /// Content statistics.
    pub stats: BlockStats,
    /// Format version.
    pub version: u32,
}

/// Counters recorded in [`BlockMeta`].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    /// Number of samples.
    pub num_samples: u64,
    /// Number of distinct series.
    pub num_series: u64,
    /// Number of chunk files.
    pub num_chunks: u64,
}

/// Errors raised while inspecting a block directory.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MetaError {
    /// Filesystem failure while listing or reading.
    #[snafu(display("Failed to inspect block: {source}"))]
    Inspect {
        /// Underlying storage error.
        source: StorageError,
    },

    /// A sub-block has no `meta.json`.
    #[snafu(display("Sub-block {path} has no meta.json"))]
    MissingMeta {
        /// Sub-block directory.
        path: String,
    },

    /// `meta.json` could not be read.
    #[snafu(display("Failed to read {path}: {source}"))]
    ReadMeta {
        /// Path of the metadata file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// `meta.json` is not valid.
    #[snafu(display("Malformed block metadata at {path}: {source}"))]
    DecodeMeta {
        /// Path of the metadata file.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// List the sub-blocks of the block directory `dir` without modifying it.
///
/// Builder-private entries (`wal`, `chunks_head`) are ignored. Every other
/// child must be a sub-block carrying a readable `meta.json`; anything else
/// is an error, so an unknown directory is never merged blindly.
pub async fn read_block_metas(dir: &Path) -> Result<Vec<BlockMeta>, MetaError> {
    let mut metas = Vec::new();
    for name in storage::list_children(dir).await.context(InspectSnafu)? {
        if is_builder_private(&name) {
            continue;
        }

        let child = dir.join(&name);
        let meta_path = child.join(META_FILE_NAME);
        let present = storage::exists(&meta_path).await.context(InspectSnafu)?;
        ensure!(
            present,
            MissingMetaSnafu {
                path: child.display().to_string(),
            }
        );

        let raw = tokio::fs::read(&meta_path).await.context(ReadMetaSnafu {
            path: meta_path.display().to_string(),
        })?;
        let meta: BlockMeta = serde_json::from_slice(&raw).context(DecodeMetaSnafu {
            path: meta_path.display().to_string(),
        })?;
        metas.push(meta);
    }
    Ok(metas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::write_atomic_blocking;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn meta(id: &str, series: u64) -> BlockMeta {
        BlockMeta {
            ulid: id.to_string(),
            min_time: 0,
            max_time: 10,
            stats: BlockStats {
                num_samples: 11,
                num_series: series,
                num_chunks: 1,
            },
            version: META_VERSION,
        }
    }

    #[test]
    fn json_layout_uses_camel_case() -> TestResult {
        let json = serde_json::to_value(meta("b1", 3))?;
        assert_eq!(json["minTime"], 0);
        assert_eq!(json["stats"]["numSeries"], 3);
        let back: BlockMeta = serde_json::from_value(json)?;
        assert_eq!(back, meta("b1", 3));
        Ok(())
    }

    #[tokio::test]
    async fn reads_sub_blocks_and_skips_private_dirs() -> TestResult {
        let tmp = TempDir::new()?;
        std::fs::create_dir_all(tmp.path().join("wal"))?;
        std::fs::create_dir_all(tmp.path().join("chunks_head/7"))?;
        for (id, series) in [("b1", 2), ("b2", 5)] {
            let path = tmp.path().join(id).join(META_FILE_NAME);
            write_atomic_blocking(&path, &serde_json::to_vec(&meta(id, series))?)?;
        }

        let metas = read_block_metas(tmp.path()).await?;
        let series: Vec<u64> = metas.iter().map(|m| m.stats.num_series).collect();
        assert_eq!(series, vec![2, 5]);
        assert!(tmp.path().join("wal").exists());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_child_without_meta_is_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        std::fs::create_dir_all(tmp.path().join("stray"))?;
        let err = read_block_metas(tmp.path()).await.expect_err("no meta");
        assert!(matches!(err, MetaError::MissingMeta { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_meta_is_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        write_atomic_blocking(&tmp.path().join("b1").join(META_FILE_NAME), b"{not json")?;
        let err = read_block_metas(tmp.path()).await.expect_err("bad json");
        assert!(matches!(err, MetaError::DecodeMeta { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn missing_block_dir_is_an_error() {
        let err = read_block_metas(Path::new("/definitely/not/here"))
            .await
            .expect_err("missing");
        assert!(matches!(
            err,
            MetaError::Inspect {
                source: StorageError::NotFound { .. }
            }
        ));
    }
}
