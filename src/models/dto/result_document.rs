use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The one document written per job into the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultDocument {
    Success {
        job_id: String,
        model: String,
        tags: Vec<String>,
    },
    Failure {
        error: String,
    },
}

impl ResultDocument {
    pub fn success(job_id: impl Into<String>, model: impl Into<String>, tags: Vec<String>) -> Self {
        ResultDocument::Success {
            job_id: job_id.into(),
            model: model.into(),
            tags,
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        ResultDocument::Failure {
            error: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultDocument::Success { .. })
    }

    /// Write `<output_dir>/<job_id>.json` as a whole-file replacement.
    ///
    /// The body goes to a hidden sibling first and is renamed into place, so a
    /// reader never observes a half-written document.
    pub fn write(&self, output_dir: &Path, job_id: &str) -> Result<PathBuf> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create output directory {:?}", output_dir))?;

        let final_path = result_path(output_dir, job_id);
        let temp_path = output_dir.join(format!(".{}.json.partial", job_id));

        let body = serde_json::to_vec_pretty(self).context("failed to serialize result document")?;
        fs::write(&temp_path, body)
            .with_context(|| format!("failed to write result document {:?}", temp_path))?;
        fs::rename(&temp_path, &final_path).with_context(|| {
            format!("failed to move {:?} into place at {:?}", temp_path, final_path)
        })?;

        Ok(final_path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {:?}", path))
    }
}

pub fn result_path(output_dir: &Path, job_id: &str) -> PathBuf {
    output_dir.join(format!("{}.json", job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn wire_shapes_match_the_output_contract() {
        let ok = ResultDocument::success("f47ac10b", "modelA", vec!["cat".into(), "sofa".into()]);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"job_id": "f47ac10b", "model": "modelA", "tags": ["cat", "sofa"]})
        );

        let err = ResultDocument::failure("Job f47ac10b has no images");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"error": "Job f47ac10b has no images"})
        );
    }

    #[test]
    fn write_creates_output_dir_and_leaves_no_partial_file() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("nested/output");

        let doc = ResultDocument::failure("boom");
        let path = doc.write(&output, "job-1").unwrap();

        assert_eq!(path, output.join("job-1.json"));
        assert_eq!(ResultDocument::read(&path).unwrap(), doc);
        let names: Vec<_> = fs::read_dir(&output)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["job-1.json"]);
    }
}
