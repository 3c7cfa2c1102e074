use serde::Deserialize;

/// Parsed `job.json` embedded in every job archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub model_name: String,
    pub job_id: Option<String>,
    pub input_image_filename: Option<String>,
}

/// Wire shape; every key is optional so a missing field is reported
/// precisely instead of as a generic decode failure.
#[derive(Debug, Default, Deserialize)]
struct ManifestWire {
    model_name: Option<String>,
    job_id: Option<String>,
    input_image_filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    MissingModelField,
    Malformed(String),
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let wire: ManifestWire =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        let model_name = wire.model_name.ok_or(ManifestError::MissingModelField)?;
        Ok(Self {
            model_name,
            job_id: wire.job_id,
            input_image_filename: wire.input_image_filename,
        })
    }
}
