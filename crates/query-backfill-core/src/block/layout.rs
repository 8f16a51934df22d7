//! Path conventions for block directories.
//!
//! All functions here are pure; they never touch the filesystem.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Write-ahead-log directory of a live builder.
pub const WAL_DIR_NAME: &str = "wal";

/// In-progress head directory of a live builder.
pub const CHUNKS_HEAD_DIR_NAME: &str = "chunks_head";

/// Metadata file inside every sub-block.
pub const META_FILE_NAME: &str = "meta.json";

/// Directory holding a sub-block's chunk files.
pub const CHUNKS_DIR_NAME: &str = "chunks";

/// Number of digits used in zero-padded chunk file names.
pub const CHUNK_FILENAME_DIGITS: usize = 6;

/// Whether `name` is a builder-private entry that must never be merged.
pub fn is_builder_private(name: &str) -> bool {
    name == WAL_DIR_NAME || name == CHUNKS_HEAD_DIR_NAME
}

/// File name of the `seq`-th chunk: `000001.parquet`, `000002.parquet`, ...
pub fn chunk_file_name(seq: usize) -> String {
    format!("{:0width$}.parquet", seq, width = CHUNK_FILENAME_DIGITS)
}

/// Temporary directory of the cycle of `query` that started in the interval
/// beginning at `slot`: `<tmp_root>/<query>_<YYYYmmdd_HHMMSS>`.
pub fn cycle_dir(tmp_root: &Path, query: &str, slot: DateTime<Utc>) -> PathBuf {
    tmp_root.join(format!("{query}_{}", slot.format("%Y%m%d_%H%M%S")))
}
