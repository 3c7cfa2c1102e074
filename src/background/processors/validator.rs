//! Package validation - runs before an artifact is touched
//!
//! Includes:
//! - Archive extension check
//! - Size-stability wait for artifacts still being written

use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::common::ARCHIVE_EXTENSION;
use crate::common::errors::JobError;
use crate::utils::PathExt;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageError {
    #[error("File {} must have .{} extension", .0.display(), ARCHIVE_EXTENSION)]
    InvalidExtension(PathBuf),
    #[error("File {} wasn't ready after {} seconds.", .path.display(), .waited.as_secs())]
    Timeout { path: PathBuf, waited: Duration },
    #[error("File {} disappeared before it could be processed: {reason}", .path.display())]
    Vanished { path: PathBuf, reason: String },
}

impl From<PackageError> for JobError {
    fn from(err: PackageError) -> Self {
        match err {
            PackageError::Timeout { .. } => JobError::Timeout(err.to_string()),
            _ => JobError::Validation(err.to_string()),
        }
    }
}

// ────────────────────────────────────────────────────────────────
// Extension Check
// ────────────────────────────────────────────────────────────────

/// Accept only archive artifacts. Pure: looks at the name, never the bytes.
pub fn validate(path: &Path) -> Result<(), PackageError> {
    if path.ext_lower() == ARCHIVE_EXTENSION {
        Ok(())
    } else {
        Err(PackageError::InvalidExtension(path.to_path_buf()))
    }
}

// ────────────────────────────────────────────────────────────────
// Stability Wait
// ────────────────────────────────────────────────────────────────

/// Block until two consecutive size samples taken `interval` apart agree.
///
/// Returns the settled size. Fails with [`PackageError::Timeout`] once
/// `timeout` has passed without two matching samples.
pub fn wait_until_stable(
    path: &Path,
    timeout: Duration,
    interval: Duration,
) -> Result<u64, PackageError> {
    let expiry = Instant::now() + timeout;
    let mut previous_size: Option<u64> = None;

    loop {
        if Instant::now() > expiry {
            return Err(PackageError::Timeout {
                path: path.to_path_buf(),
                waited: timeout,
            });
        }

        let current_size = fs::metadata(path)
            .map_err(|e| PackageError::Vanished {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .len();

        if previous_size == Some(current_size) {
            debug!("{:?} settled at {} bytes", path, current_size);
            return Ok(current_size);
        }
        previous_size = Some(current_size);
        sleep(interval);
    }
}
