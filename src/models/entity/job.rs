use log::debug;
use path_clean::PathClean;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::common::errors::JobError;
use crate::models::dto::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Discovered,
    Validating,
    Staging,
    Dispatching,
    Finalizing,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Discovered => "discovered",
            JobState::Validating => "validating",
            JobState::Staging => "staging",
            JobState::Dispatching => "dispatching",
            JobState::Finalizing => "finalizing",
            JobState::Done => "done",
        };
        f.write_str(name)
    }
}

/// One unit of work derived from one inbound artifact.
///
/// Only the in-memory view is state-tagged; on disk a job is still just the
/// artifact, its working directory and (at the end) its result document.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source_path: PathBuf,
    pub working_dir: PathBuf,
    pub manifest: Option<Manifest>,
    pub state: JobState,
    pub last_error: Option<JobError>,
    pub tags: Option<Vec<String>>,
    discovered_at: Instant,
}

impl Job {
    pub fn discover(source_path: impl Into<PathBuf>, working_root: &Path) -> Self {
        let source_path = source_path.into().clean();
        let id = job_id_from_path(&source_path);
        let working_dir = working_root.join(&id);
        Self {
            id,
            source_path,
            working_dir,
            manifest: None,
            state: JobState::Discovered,
            last_error: None,
            tags: None,
            discovered_at: Instant::now(),
        }
    }

    pub fn advance(&mut self, next: JobState) {
        debug!("Job {}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    pub fn fail(&mut self, err: JobError) {
        debug!("Job {} failed while {}: {}", self.id, self.state, err);
        self.last_error = Some(err);
    }

    /// False when the id would resolve to the working root itself, or
    /// outside of it.
    pub fn has_safe_id(&self) -> bool {
        is_safe_job_id(&self.id)
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }

    pub fn elapsed(&self) -> Duration {
        self.discovered_at.elapsed()
    }
}

/// The artifact's base filename without its extension.
pub fn job_id_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A job id must be a single normal path component.
pub fn is_safe_job_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_derives_id_and_working_dir() {
        let job = Job::discover(
            "data/input/./f47ac10b-58cc-4372-a567-0e02b2c3d479.zip",
            Path::new("data/working"),
        );
        assert_eq!(job.id, "f47ac10b-58cc-4372-a567-0e02b2c3d479");
        assert_eq!(
            job.source_path,
            PathBuf::from("data/input/f47ac10b-58cc-4372-a567-0e02b2c3d479.zip")
        );
        assert_eq!(
            job.working_dir,
            PathBuf::from("data/working/f47ac10b-58cc-4372-a567-0e02b2c3d479")
        );
        assert_eq!(job.state, JobState::Discovered);
    }

    #[test]
    fn id_ignores_only_the_last_extension() {
        assert_eq!(job_id_from_path(Path::new("in/report.tar.gz")), "report.tar");
        assert_eq!(job_id_from_path(Path::new("in/noext")), "noext");
    }

    #[test]
    fn ids_that_are_not_one_component_are_unsafe() {
        assert!(is_safe_job_id("f47ac10b"));
        assert!(is_safe_job_id(".hidden"));
        assert!(is_safe_job_id("report.tar"));
        assert!(!is_safe_job_id(""));
        assert!(!is_safe_job_id("."));
        assert!(!is_safe_job_id(".."));
        assert!(!is_safe_job_id("a/b"));
        assert!(!is_safe_job_id("a\\b"));

        let job = Job::discover("in/..zip", Path::new("w"));
        assert_eq!(job.id, ".");
        assert!(!job.has_safe_id());
    }

    #[test]
    fn failure_is_recorded_without_changing_state() {
        let mut job = Job::discover("in/a.zip", Path::new("w"));
        job.advance(JobState::Validating);
        job.fail(JobError::Validation("bad".into()));
        assert_eq!(job.state, JobState::Validating);
        assert_eq!(job.last_error, Some(JobError::Validation("bad".into())));
        assert!(!job.is_done());
    }
}
