//! Job lifecycle - one artifact in, exactly one result document out
//!
//! `Discovered → Validating → Staging → Dispatching → Finalizing → Done`.
//! Every error path still passes through `Finalizing`, so neither the source
//! artifact nor the working directory outlives the job.

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::Semaphore, task::JoinSet, task::spawn_blocking};

use crate::background::processors::{
    stager::{find_images, read_manifest, select_image, stage},
    validator::{validate, wait_until_stable},
};
use crate::background::types::InProgress;
use crate::common::errors::{JobError, handle_error};
use crate::config::{AppConfig, JobTimings};
use crate::models::dto::result_document::ResultDocument;
use crate::models::entity::job::{Job, JobState};
use crate::residency::{ResidencyError, ResidencyManager};
use crate::utils::fs_utils::{
    delete_file_with_retry, list_directories, list_files_sorted_by_oldest, remove_dir_if_exists,
};

pub struct JobController {
    output_path: PathBuf,
    working_path: PathBuf,
    timings: JobTimings,
    residency: Arc<ResidencyManager>,
    permits: Semaphore,
    in_progress: InProgress,
}

impl JobController {
    pub fn new(config: &AppConfig, residency: Arc<ResidencyManager>) -> Self {
        Self::with_paths(
            &config.output_path,
            &config.working_path,
            config.timings(),
            config.max_concurrent_jobs,
            residency,
        )
    }

    pub fn with_paths(
        output_path: impl Into<PathBuf>,
        working_path: impl Into<PathBuf>,
        timings: JobTimings,
        max_concurrent_jobs: usize,
        residency: Arc<ResidencyManager>,
    ) -> Self {
        Self {
            output_path: output_path.into(),
            working_path: working_path.into(),
            timings,
            residency,
            permits: Semaphore::new(max_concurrent_jobs.max(1)),
            in_progress: InProgress::default(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn residency(&self) -> &Arc<ResidencyManager> {
        &self.residency
    }

    // ────────────────────────────────────────────────────────────────
    // Startup Recovery
    // ────────────────────────────────────────────────────────────────

    /// Remove everything a previous run left under the working root.
    pub fn clean_start(&self) -> Result<()> {
        fs::create_dir_all(&self.working_path)
            .with_context(|| format!("failed to create working root {:?}", self.working_path))?;

        for dir in list_directories(&self.working_path)? {
            remove_dir_if_exists(&dir)?;
        }
        for file in list_files_sorted_by_oldest(&self.working_path)? {
            delete_file_with_retry(&file)?;
        }
        info!("Deleted all contents of {:?}", self.working_path);
        Ok(())
    }

    /// Queue every artifact already sitting in `watch_dir`, oldest first.
    ///
    /// Jobs run concurrently, so the order is a hint for the permit queue,
    /// not a completion order.
    pub fn reprocess_unhandled_jobs(
        self: &Arc<Self>,
        watch_dir: &Path,
        tasks: &mut JoinSet<Option<Job>>,
    ) -> Result<usize> {
        let files = list_files_sorted_by_oldest(watch_dir)?;
        let count = files.len();
        for path in files {
            info!("Recovering unhandled job: {:?}", path);
            let controller = self.clone();
            tasks.spawn(async move { controller.process(path).await });
        }
        Ok(count)
    }

    // ────────────────────────────────────────────────────────────────
    // Per-Job Pipeline
    // ────────────────────────────────────────────────────────────────

    /// Run one artifact through the whole lifecycle.
    ///
    /// Returns `None` when the same job id is already being processed, or
    /// when the artifact is already gone (a late duplicate arrival). No
    /// result document is written in either case.
    pub async fn process(&self, path: impl Into<PathBuf>) -> Option<Job> {
        let mut job = Job::discover(path, &self.working_path);

        let _guard = match self.in_progress.try_acquire(&job.id) {
            Some(guard) => guard,
            None => {
                warn!(
                    "Processing already in progress for path: {:?}, job: {}",
                    job.source_path, job.id
                );
                return None;
            }
        };
        // Only a run holding this id's guard deletes the artifact, so a
        // missing file here means an earlier run already answered the job.
        if !job.source_path.exists() {
            info!(
                "Skipping {:?}: already processed, job: {}",
                job.source_path, job.id
            );
            return None;
        }
        // The semaphore is never closed, so acquire only fails on a bug.
        let _permit = self.permits.acquire().await.ok();

        let outcome = self.drive(&mut job).await;
        self.finalize(&mut job, outcome).await;
        Some(job)
    }

    /// `Validating` through `Dispatching`. `Ok(None)` means dispatch ended
    /// without anything to report.
    async fn drive(&self, job: &mut Job) -> Result<Option<Vec<String>>, JobError> {
        job.advance(JobState::Validating);
        if !job.has_safe_id() {
            return Err(JobError::Validation(format!(
                "File {} does not name a usable job id: {:?}",
                job.source_path.display(),
                job.id
            )));
        }
        validate(&job.source_path)?;
        let source = job.source_path.clone();
        let timings = self.timings;
        spawn_blocking(move || {
            wait_until_stable(&source, timings.stability_timeout, timings.stability_interval)
        })
        .await??;

        job.advance(JobState::Staging);
        info!("Handling zip file: {:?}", job.source_path);
        let (source, working_dir) = (job.source_path.clone(), job.working_dir.clone());
        spawn_blocking(move || stage(&source, &working_dir, timings.extraction_timeout))
            .await?
            .map_err(|e| e.into_job_error(&job.id))?;

        let images = find_images(&job.working_dir);
        if images.is_empty() {
            return Err(JobError::Validation(format!("Job {} has no images", job.id)));
        }
        let manifest = read_manifest(&job.working_dir).map_err(|e| e.into_job_error(&job.id))?;
        if !self.residency.supports(&manifest.model_name) {
            return Err(JobError::Validation(format!(
                "Job {} has invalid model name: {}",
                job.id, manifest.model_name
            )));
        }
        let image_path = select_image(&images, &manifest)
            .cloned()
            .ok_or_else(|| JobError::Internal(format!("Job {} lost its images", job.id)))?;
        let model_name = manifest.model_name.clone();
        job.manifest = Some(manifest);

        job.advance(JobState::Dispatching);
        let residency = self.residency.clone();
        match spawn_blocking(move || residency.run(&image_path, &model_name)).await? {
            Ok(tags) => {
                info!("got tags: {:?}", tags);
                Ok(Some(tags))
            }
            Err(ResidencyError::InvalidModel(model)) => {
                // Unreachable while `supports` checks the manager's own
                // registry; kept so a rejected model still writes nothing.
                warn!(
                    "Job {}: model {} rejected at dispatch, no result document written",
                    job.id, model
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize(&self, job: &mut Job, outcome: Result<Option<Vec<String>>, JobError>) {
        job.advance(JobState::Finalizing);

        let document = match outcome {
            Ok(Some(tags)) => {
                let model = job
                    .manifest
                    .as_ref()
                    .map(|m| m.model_name.clone())
                    .unwrap_or_default();
                let document = ResultDocument::success(job.id.clone(), model, tags.clone());
                job.tags = Some(tags);
                Some(document)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Job {} failed ({}): {}", job.id, e.kind(), e);
                let document = ResultDocument::failure(&e);
                job.fail(e);
                Some(document)
            }
        };

        // An id with a separator would place the document outside the
        // output directory.
        let document = document.filter(|_| !job.id.contains(['/', '\\']));
        if let Some(document) = document {
            match document.write(&self.output_path, &job.id) {
                Ok(path) => info!("Wrote {:?}", path),
                Err(e) => {
                    handle_error(e.context(format!("Failed to write result for job {}", job.id)));
                }
            }
        }

        let (source, working_dir) = (job.source_path.clone(), job.working_dir.clone());
        let safe_id = job.has_safe_id();
        let cleanup = spawn_blocking(move || -> Result<()> {
            delete_file_with_retry(&source)?;
            if !safe_id {
                return Ok(());
            }
            if remove_dir_if_exists(&working_dir)? {
                info!("deleted working dir: {:?}", working_dir);
            }
            Ok(())
        })
        .await;
        match cleanup {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                handle_error(e.context(format!("Failed to clean up job {}", job.id)));
            }
            Err(e) => error!("Cleanup task for job {} panicked: {}", job.id, e),
        }

        job.advance(JobState::Done);
        info!(
            duration = &*format!("{:?}", job.elapsed());
            "finished job {} ({})",
            job.id,
            if job.last_error.is_some() { "failed" } else { "ok" }
        );
    }
}
