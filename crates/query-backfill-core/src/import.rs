//! Decide whether a freshly built block may enter the destination store, and
//! merge or discard it.
//!
//! The destination store is append-only from this module's point of view:
//! children of the temporary block directory are moved in under their own
//! names, and nothing already present is ever replaced or removed.

use std::path::Path;

use log::{info, warn};
use snafu::prelude::*;

use crate::{
    block::{BlockMeta, MetaError, layout::is_builder_private, read_block_metas},
    storage::{self, StorageError},
};

/// Outcome of [`evaluate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportDecision {
    /// The block may be merged.
    Merge,
    /// A sub-block exceeds the series limit; the block must be discarded.
    Skip {
        /// Largest series count found.
        max_series_seen: u64,
        /// Configured limit.
        limit: u64,
    },
}

/// What [`import_block`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Sub-blocks were moved into the destination.
    Merged {
        /// Names of the moved children, in the order they were moved.
        moved: Vec<String>,
    },
    /// The block was discarded by the series guard.
    Skipped {
        /// Largest series count found.
        max_series_seen: u64,
        /// Configured limit.
        limit: u64,
    },
}

/// Errors raised while importing a block.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ImportError {
    /// The block could not be inspected.
    #[snafu(display("Failed to inspect block {path}: {source}"))]
    Inspect {
        /// Temporary block directory.
        path: String,
        /// Underlying inspection error.
        source: MetaError,
    },

    /// The destination store does not exist or is not a directory.
    #[snafu(display("Destination store {path} is not available: {source}"))]
    MissingDestination {
        /// Destination path.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// Checking the destination for an existing child failed.
    #[snafu(display("Failed to check {path} in the destination store: {source}"))]
    InspectDestination {
        /// Destination path of the child.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// A child of the block already exists in the destination store.
    #[snafu(display("Refusing to merge: {name} already exists in {destination}"))]
    Collision {
        /// Conflicting child name.
        name: String,
        /// Destination path.
        destination: String,
    },

    /// Moving a child failed. Children listed in `moved` are already merged.
    #[snafu(display(
        "Failed to move {name} into the destination store after {} successful move(s): {source}",
        moved.len()
    ))]
    Move {
        /// Child that failed to move.
        name: String,
        /// Children merged before the failure.
        moved: Vec<String>,
        /// Underlying storage error.
        source: StorageError,
    },

    /// Listing or removing the temporary directory failed.
    #[snafu(display("Failed to clean up block directory: {source}"))]
    Cleanup {
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Apply the series guard to the sub-blocks of a built block.
///
/// `max_series` of `None` (or `Some(0)`) disables the guard.
pub fn evaluate(blocks: &[BlockMeta], max_series: Option<u64>) -> ImportDecision {
    let Some(limit) = max_series.filter(|&m| m > 0) else {
        return ImportDecision::Merge;
    };
    let max_series_seen = blocks
        .iter()
        .map(|b| b.stats.num_series)
        .max()
        .unwrap_or(0);
    if max_series_seen > limit {
        ImportDecision::Skip {
            max_series_seen,
            limit,
        }
    } else {
        ImportDecision::Merge
    }
}

/// Move every non-private child of `src` into `dst`, then remove `src`.
///
/// Fails before touching `dst` if it is missing or if any child name already
/// exists there.
pub async fn merge_block(src: &Path, dst: &Path) -> Result<Vec<String>, ImportError> {
    storage::ensure_dir_exists(dst)
        .await
        .context(MissingDestinationSnafu {
            path: dst.display().to_string(),
        })?;

    let children: Vec<String> = storage::list_children(src)
        .await
        .context(CleanupSnafu)?
        .into_iter()
        .filter(|name| !is_builder_private(name))
        .collect();

    for name in &children {
        let target = dst.join(name);
        let present = storage::exists(&target)
            .await
            .context(InspectDestinationSnafu {
                path: target.display().to_string(),
            })?;
        ensure!(
            !present,
            CollisionSnafu {
                name: name.clone(),
                destination: dst.display().to_string(),
            }
        );
    }

    let mut moved = Vec::with_capacity(children.len());
    for name in children {
        if let Err(source) = storage::move_no_clobber(&src.join(&name), &dst.join(&name)).await {
            warn!(
                "Merge into {} stopped after {} sub-block(s)",
                dst.display(),
                moved.len()
            );
            return Err(source).context(MoveSnafu { name, moved });
        }
        moved.push(name);
    }

    storage::remove_tree(src).await.context(CleanupSnafu)?;
    Ok(moved)
}

/// Remove a block directory without merging anything.
pub async fn discard_block(src: &Path) -> Result<(), ImportError> {
    storage::remove_tree(src).await.context(CleanupSnafu)
}

/// Inspect the block at `src`, then merge it into `dst` or discard it.
pub async fn import_block(
    src: &Path,
    dst: &Path,
    max_series: Option<u64>,
) -> Result<ImportOutcome, ImportError> {
    let blocks = read_block_metas(src).await.context(InspectSnafu {
        path: src.display().to_string(),
    })?;

    match evaluate(&blocks, max_series) {
        ImportDecision::Skip {
            max_series_seen,
            limit,
        } => {
            info!(
                "Skipping block {}: a sub-block has {max_series_seen} series, limit is {limit}",
                src.display()
            );
            discard_block(src).await?;
            Ok(ImportOutcome::Skipped {
                max_series_seen,
                limit,
            })
        }
        ImportDecision::Merge => {
            let moved = merge_block(src, dst).await?;
            info!(
                "Merged {} sub-block(s) from {} into {}",
                moved.len(),
                src.display(),
                dst.display()
            );
            Ok(ImportOutcome::Merged { moved })
        }
    }
}
