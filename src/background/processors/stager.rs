//! Archive staging - unpacks a validated archive into its job working directory
//!
//! Includes:
//! - Flattened extraction with a bounded retry loop for half-written archives
//! - Manifest reading
//! - Image discovery

use log::{error, info, warn};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;
use zip::ZipArchive;

use crate::common::errors::JobError;
use crate::common::{EXTRACT_RETRY_DELAY, MANIFEST_FILE_NAME};
use crate::models::dto::manifest::{Manifest, ManifestError};
use crate::utils::PathExt;
use crate::utils::fs_utils::delete_file_with_retry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Failed to extract {}: {reason}", .path.display())]
    ExtractionFailed { path: PathBuf, reason: String },
    #[error("Archive {} could not be read after {} seconds.", .path.display(), .waited.as_secs())]
    Timeout { path: PathBuf, waited: Duration },
    #[error("no job file")]
    MissingManifest,
    #[error("no model name")]
    MissingModelField,
    #[error("malformed job file: {0}")]
    MalformedManifest(String),
}

impl StageError {
    pub fn into_job_error(self, job_id: &str) -> JobError {
        match self {
            StageError::Timeout { .. } => JobError::Timeout(self.to_string()),
            StageError::ExtractionFailed { .. } => JobError::Extraction(self.to_string()),
            StageError::MissingManifest
            | StageError::MissingModelField
            | StageError::MalformedManifest(_) => {
                JobError::Validation(format!("Job {} has {}", job_id, self))
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────
// Extraction
// ────────────────────────────────────────────────────────────────

enum Attempt {
    /// The archive is not readable yet; try again until the deadline.
    Unreadable(String),
    Fatal(String),
}

/// Create `working_dir` and extract every file entry of `artifact` into it.
///
/// Unreadable archives are retried until `timeout` passes; the artifact is
/// then deleted so a poisoned input cannot be picked up again.
pub fn stage(artifact: &Path, working_dir: &Path, timeout: Duration) -> Result<PathBuf, StageError> {
    fs::create_dir_all(working_dir).map_err(|e| StageError::ExtractionFailed {
        path: artifact.to_path_buf(),
        reason: format!("cannot create working directory {:?}: {}", working_dir, e),
    })?;

    let expiry = Instant::now() + timeout;
    loop {
        if Instant::now() > expiry {
            if let Err(e) = delete_file_with_retry(artifact) {
                error!("Failed to delete unreadable archive {:?}: {:?}", artifact, e);
            }
            return Err(StageError::Timeout {
                path: artifact.to_path_buf(),
                waited: timeout,
            });
        }

        match extract_flat(artifact, working_dir) {
            Ok(count) => {
                info!("Extracted {} files to {:?}", count, working_dir);
                return Ok(working_dir.to_path_buf());
            }
            Err(Attempt::Unreadable(reason)) => {
                warn!("Failed to extract {:?}: {}", artifact, reason);
                sleep(EXTRACT_RETRY_DELAY);
            }
            Err(Attempt::Fatal(reason)) => {
                return Err(StageError::ExtractionFailed {
                    path: artifact.to_path_buf(),
                    reason,
                });
            }
        }
    }
}

fn extract_flat(artifact: &Path, dest: &Path) -> Result<usize, Attempt> {
    let file = File::open(artifact).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Attempt::Fatal(format!("archive is gone: {}", e)),
        _ => Attempt::Unreadable(e.to_string()),
    })?;
    let mut archive = ZipArchive::new(file).map_err(|e| Attempt::Unreadable(e.to_string()))?;

    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| Attempt::Unreadable(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        // Entries are flattened onto the working directory root.
        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_owned()))
        else {
            warn!("Skipping unsafe archive entry {:?} in {:?}", entry.name(), artifact);
            continue;
        };

        let target = dest.join(file_name);
        let mut out = File::create(&target)
            .map_err(|e| Attempt::Fatal(format!("cannot create {:?}: {}", target, e)))?;
        io::copy(&mut entry, &mut out).map_err(|e| Attempt::Unreadable(e.to_string()))?;
        extracted += 1;
    }
    Ok(extracted)
}

// ────────────────────────────────────────────────────────────────
// Manifest & Images
// ────────────────────────────────────────────────────────────────

pub fn read_manifest(working_dir: &Path) -> Result<Manifest, StageError> {
    let path = working_dir.join(MANIFEST_FILE_NAME);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StageError::MissingManifest),
        Err(e) => return Err(StageError::MalformedManifest(e.to_string())),
    };
    Manifest::parse(&bytes).map_err(|e| match e {
        ManifestError::MissingModelField => StageError::MissingModelField,
        ManifestError::Malformed(reason) => StageError::MalformedManifest(reason),
    })
}

/// Image files at the root of `working_dir`, sorted by name.
///
/// A missing or unreadable directory yields an empty list; the caller
/// decides what emptiness means.
pub fn find_images(working_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(working_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Directory not readable: {:?}: {}", working_dir, e);
            return Vec::new();
        }
    };

    let mut images: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.is_image())
        .collect();
    images.sort();
    images
}

/// Prefer the image the manifest names; otherwise take the first one.
pub fn select_image<'a>(images: &'a [PathBuf], manifest: &Manifest) -> Option<&'a PathBuf> {
    manifest
        .input_image_filename
        .as_deref()
        .and_then(|wanted| {
            images
                .iter()
                .find(|path| path.file_name().is_some_and(|name| name == wanted))
        })
        .or_else(|| images.first())
}
