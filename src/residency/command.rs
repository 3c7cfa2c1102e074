//! Worker-process backend - one external process per resident model
//!
//! The worker is started as
//! `<program> [args] --model <id> --family <captioning|tagging> --size <n>`
//! and speaks newline-delimited JSON:
//! - after loading it prints `{"ready": true}`
//! - for each `{"image": "<png path>"}` request it answers with
//!   `{"caption": "..."}`, `{"scores": {"label": 0.9}}` or `{"error": "..."}`
//!
//! Unloading kills and reaps the process, which returns its memory (and any
//! accelerator context) to the system.

use anyhow::{Context, Result, anyhow, bail};
use image::{DynamicImage, ImageFormat};
use log::{info, warn};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};
use uuid::Uuid;

use crate::residency::backend::{LoadedModel, ModelLoader, Prediction};
use crate::residency::registry::ModelSpec;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WorkerReply {
    Ready { ready: bool },
    Caption { caption: String },
    Scores { scores: BTreeMap<String, f32> },
    Error { error: String },
}

#[derive(Debug, Clone)]
pub struct CommandLoader {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLoader {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_for(&self, spec: &ModelSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).args([
            "--model",
            spec.name,
            "--family",
            spec.family.as_str(),
            "--size",
            &spec.input_size.to_string(),
        ]);
        cmd
    }
}

impl ModelLoader for CommandLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LoadedModel>> {
        let mut child = self
            .command_for(spec)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Fail to spawn worker {:?}", self.program))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout unavailable"))?;

        // From here on dropping `model` reaps the process.
        let mut model = CommandModel {
            name: spec.name,
            child: Some(child),
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        };

        match model.read_reply()? {
            WorkerReply::Ready { ready: true } => {
                info!("Worker for {} is ready", spec.name);
                Ok(Box::new(model))
            }
            WorkerReply::Error { error } => bail!("worker failed to load {}: {}", spec.name, error),
            other => bail!("unexpected worker greeting: {:?}", other),
        }
    }
}

pub struct CommandModel {
    name: &'static str,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl CommandModel {
    fn read_reply(&mut self) -> Result<WorkerReply> {
        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .context("failed to read from worker")?;
        if read == 0 {
            bail!("worker for {} exited unexpectedly", self.name);
        }
        serde_json::from_str(line.trim())
            .with_context(|| format!("worker sent an unreadable reply: {:?}", line.trim()))
    }

    fn send_request(&mut self, image_path: &std::path::Path) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("worker for {} is shut down", self.name))?;
        let request = serde_json::json!({ "image": image_path.to_string_lossy() });
        writeln!(stdin, "{}", request).context("failed to write to worker")?;
        stdin.flush().context("failed to flush worker stdin")?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        // Closing stdin lets a well-behaved worker exit on its own.
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                child.kill().context("failed to kill worker")?;
            }
            let status = child.wait().context("failed to reap worker")?;
            info!("Worker for {} stopped ({})", self.name, status);
        }
        Ok(())
    }
}

impl LoadedModel for CommandModel {
    fn infer(&mut self, image: &DynamicImage) -> Result<Prediction> {
        let input_path = std::env::temp_dir().join(format!("tagwatch-{}.png", Uuid::new_v4()));
        image
            .save_with_format(&input_path, ImageFormat::Png)
            .with_context(|| format!("failed to write model input {:?}", input_path))?;

        let reply = self
            .send_request(&input_path)
            .and_then(|_| self.read_reply());
        if let Err(e) = fs::remove_file(&input_path) {
            warn!("Failed to remove model input {:?}: {}", input_path, e);
        }

        match reply? {
            WorkerReply::Caption { caption } => Ok(Prediction::Caption(caption)),
            WorkerReply::Scores { scores } => Ok(Prediction::Scores(scores.into_iter().collect())),
            WorkerReply::Error { error } => bail!("worker error: {}", error),
            WorkerReply::Ready { .. } => bail!("worker sent a second greeting"),
        }
    }

    fn unload(mut self: Box<Self>) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for CommandModel {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Failed to stop worker for {}: {:#}", self.name, e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::residency::registry::BackendFamily;
    use image::{Rgb, RgbImage};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn input() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])))
    }

    #[test]
    fn captioning_worker_round_trip() {
        let tmp = TempDir::new().unwrap();
        let program = script(
            tmp.path(),
            "caption.sh",
            r#"echo '{"ready": true}'
while read line; do echo '{"caption": "A Cat on a Sofa"}'; done"#,
        );
        let spec = ModelSpec::new("modelA", BackendFamily::Captioning, 8);

        let mut model = CommandLoader::new(program, vec![]).load(&spec).unwrap();
        assert_eq!(
            model.infer(&input()).unwrap(),
            Prediction::Caption("A Cat on a Sofa".into())
        );
        assert_eq!(
            model.infer(&input()).unwrap(),
            Prediction::Caption("A Cat on a Sofa".into())
        );
        model.unload().unwrap();
    }

    #[test]
    fn tagging_worker_scores_are_collected() {
        let tmp = TempDir::new().unwrap();
        let program = script(
            tmp.path(),
            "tagger.sh",
            r#"echo '{"ready": true}'
while read line; do echo '{"scores": {"long_hair": 0.8, "sky": 0.1}}'; done"#,
        );
        let spec = ModelSpec::new("modelB", BackendFamily::Tagging, 8);

        let mut model = CommandLoader::new(program, vec![]).load(&spec).unwrap();
        assert_eq!(
            model.infer(&input()).unwrap(),
            Prediction::Scores(vec![("long_hair".into(), 0.8), ("sky".into(), 0.1)])
        );
    }

    #[test]
    fn worker_that_dies_during_load_is_a_load_error() {
        let tmp = TempDir::new().unwrap();
        let program = script(tmp.path(), "dead.sh", "exit 3");
        let spec = ModelSpec::new("modelA", BackendFamily::Captioning, 8);
        assert!(CommandLoader::new(program, vec![]).load(&spec).is_err());
    }

    #[test]
    fn worker_error_reply_is_an_inference_error() {
        let tmp = TempDir::new().unwrap();
        let program = script(
            tmp.path(),
            "err.sh",
            r#"echo '{"ready": true}'
while read line; do echo '{"error": "CUDA out of memory"}'; done"#,
        );
        let spec = ModelSpec::new("modelA", BackendFamily::Captioning, 8);
        let mut model = CommandLoader::new(program, vec![]).load(&spec).unwrap();
        let err = model.infer(&input()).unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    #[test]
    fn missing_program_fails_to_load() {
        let spec = ModelSpec::new("modelA", BackendFamily::Captioning, 8);
        let loader = CommandLoader::new("/nonexistent/tagwatch-worker", vec![]);
        assert!(loader.load(&spec).is_err());
    }
}
