use anyhow::{Context, Result};
use log::{info, warn};
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime},
};
use walkdir::WalkDir;

use crate::common::MAX_DELETE_ATTEMPTS;

/// Remove a file, retrying transient failures. A file that is already gone
/// counts as deleted.
pub fn delete_file_with_retry(path: &Path) -> Result<()> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match fs::remove_file(path) {
            Ok(_) => {
                info!("Deleted file: {:?}", path);
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) if attempts < MAX_DELETE_ATTEMPTS => {
                warn!(
                    "Failed deleting {:?} (attempt {}), retrying in {}ms: {}",
                    path,
                    attempts,
                    100 * attempts,
                    err
                );
                thread::sleep(Duration::from_millis(100 * attempts));
            }
            Err(err) => {
                return Err(err).context(format!(
                    "Failed deleting {:?} after {} attempts",
                    path, attempts
                ));
            }
        }
    }
}

/// `remove_dir_all` that treats a missing directory as success.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).context(format!("failed to remove directory {:?}", path)),
    }
}

/// Direct subdirectories of `path`; empty when `path` does not exist.
pub fn list_directories(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {:?}", path))?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

/// Regular files directly inside `path`, oldest modification time first.
pub fn list_files_sorted_by_oldest(path: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {:?}", path))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .with_context(|| format!("failed to stat {:?}", entry.path()))?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((modified, entry.into_path()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::TempDir;

    #[test]
    fn files_come_back_oldest_first() {
        let tmp = TempDir::new().unwrap();
        for (name, secs) in [("new.zip", 3_000), ("old.zip", 1_000), ("mid.zip", 2_000)] {
            let path = tmp.path().join(name);
            fs::write(&path, b"x").unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(secs, 0)).unwrap();
        }
        fs::create_dir(tmp.path().join("subdir")).unwrap();

        let names: Vec<_> = list_files_sorted_by_oldest(tmp.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["old.zip", "mid.zip", "new.zip"]);
    }

    #[test]
    fn deleting_missing_things_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        delete_file_with_retry(&tmp.path().join("nope.zip")).unwrap();
        assert!(!remove_dir_if_exists(&tmp.path().join("nope")).unwrap());
        assert!(list_directories(&tmp.path().join("nope")).unwrap().is_empty());
    }
}
