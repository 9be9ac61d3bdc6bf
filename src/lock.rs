//! File-based locking to prevent concurrent execution.
//!
//! Uses flock-style advisory locking so that two `antiscan` runs never
//! reconcile the same chains or rewrite the same files at once.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::AntiscanError;

/// A guard that holds an exclusive lock on an antiscan lock file.
/// The lock is released when the guard is dropped.
pub struct LockGuard {
    _file: File,
}

impl LockGuard {
    /// Attempt to acquire an exclusive lock on `lock_path` without blocking.
    /// Returns an error if another instance is already holding it.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).ok();
        }

        // create+read+write without truncate: no race between create and lock
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

        fs::set_permissions(lock_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive()
            .map_err(|_| AntiscanError::Locked(lock_path.display().to_string()))
            .context(
                "Another instance of antiscan is already running. \
                 Wait for it to complete before starting a new run.",
            )?;

        Ok(Self { _file: file })
    }
}
