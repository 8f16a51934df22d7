//! Local filesystem helpers shared by the block builder and the importer.
//!
//! Every helper attaches the offending path to its error so that a failed
//! cycle can be diagnosed from the log alone. Async helpers run on
//! `tokio::fs`; the `*_blocking` variants are for code that already runs on
//! a blocking thread (the block builder).

use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};

use snafu::{Backtrace, IntoError, prelude::*};
use tokio::fs;

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by the storage backend implementation.
///
/// Only the local filesystem is supported; backend-specific I/O errors are
/// wrapped here so [`StorageError`] variants can add path context.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The target of a move or create-new already exists.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Any other local I/O error.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Path the failed operation was acting on.
    pub fn path(&self) -> &str {
        match self {
            StorageError::NotFound { path, .. }
            | StorageError::AlreadyExists { path, .. }
            | StorageError::OtherIo { path, .. } => path,
        }
    }
}

fn classify(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    match e.kind() {
        io::ErrorKind::NotFound => NotFoundSnafu { path }.into_error(BackendError::Local(e)),
        _ => OtherIoSnafu { path }.into_error(BackendError::Local(e)),
    }
}

/// Fail with [`StorageError::NotFound`] unless `path` is an existing directory.
pub async fn ensure_dir_exists(path: &Path) -> StorageResult<()> {
    let meta = fs::metadata(path).await.map_err(|e| classify(path, e))?;
    if !meta.is_dir() {
        return Err(classify(
            path,
            io::Error::new(io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    Ok(())
}

/// Whether anything exists at `path`.
pub async fn exists(path: &Path) -> StorageResult<bool> {
    fs::try_exists(path).await.map_err(|e| classify(path, e))
}

/// Names of the immediate children of directory `dir`, sorted.
pub async fn list_children(dir: &Path) -> StorageResult<Vec<String>> {
    let mut entries = fs::read_dir(dir).await.map_err(|e| classify(dir, e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| classify(dir, e))? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Rename `src` to `dst`, refusing to replace an existing `dst`.
///
/// The existence check and the rename are not one atomic step; callers own
/// `dst`'s parent for the duration of the call.
pub async fn move_no_clobber(src: &Path, dst: &Path) -> StorageResult<()> {
    if exists(dst).await? {
        return AlreadyExistsSnafu {
            path: dst.display().to_string(),
        }
        .fail();
    }
    fs::rename(src, dst).await.map_err(|e| classify(src, e))
}

/// Recursively remove `path`. A missing path is not an error.
pub async fn remove_tree(path: &Path) -> StorageResult<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(path, e)),
    }
}

/// Create `path` and all missing parents.
pub fn create_dir_all_blocking(path: &Path) -> StorageResult<()> {
    std::fs::create_dir_all(path).map_err(|e| classify(path, e))
}

/// Rename on a blocking thread.
pub fn rename_blocking(src: &Path, dst: &Path) -> StorageResult<()> {
    std::fs::rename(src, dst).map_err(|e| classify(src, e))
}

/// Recursively remove `path` on a blocking thread. A missing path is fine.
pub fn remove_tree_blocking(path: &Path) -> StorageResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(path, e)),
    }
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm the guard so the file is NOT removed on drop.
    /// Call this after a successful rename.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are already returning another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `path` with write-then-rename semantics.
///
/// The payload goes to a sibling `.tmp` file which is synced and then renamed
/// over `path`, so readers never observe a half-written file.
pub fn write_atomic_blocking(path: &Path, contents: &[u8]) -> StorageResult<()> {
    use std::io::Write as _;

    if let Some(parent) = path.parent() {
        create_dir_all_blocking(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = std::fs::File::create(&tmp_path).map_err(|e| classify(&tmp_path, e))?;
        file.write_all(contents)
            .map_err(|e| classify(&tmp_path, e))?;
        file.sync_all().map_err(|e| classify(&tmp_path, e))?;
    }

    std::fs::rename(&tmp_path, path).map_err(|e| classify(path, e))?;
    guard.disarm();
    Ok(())
}
