use std::fmt;

/// Class of algorithm behind a model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    /// Sequence generation: one caption, split into tags.
    Captioning,
    /// Multi-label classification: confidence-scored labels.
    Tagging,
}

impl BackendFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendFamily::Captioning => "captioning",
            BackendFamily::Tagging => "tagging",
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub family: BackendFamily,
    /// Side of the square the input image is letterboxed into.
    pub input_size: u32,
}

impl ModelSpec {
    pub const fn new(name: &'static str, family: BackendFamily, input_size: u32) -> Self {
        Self {
            name,
            family,
            input_size,
        }
    }
}

pub const SUPPORTED_MODELS: &'static [ModelSpec] = &[
    ModelSpec::new(
        "Salesforce/blip-image-captioning-base",
        BackendFamily::Captioning,
        224,
    ),
    ModelSpec::new("Salesforce/blip2-opt-2.7b", BackendFamily::Captioning, 224),
    ModelSpec::new("Salesforce/blip2-flan-t5-xl", BackendFamily::Captioning, 224),
    ModelSpec::new(
        "SmilingWolf/wd-v1-4-vit-tagger-v2",
        BackendFamily::Tagging,
        448,
    ),
    ModelSpec::new("SmilingWolf/wd-swinv2-tagger-v3", BackendFamily::Tagging, 448),
];

/// The set of model ids a job may ask for.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: models.into_iter().collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(SUPPORTED_MODELS.iter().cloned())
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|spec| spec.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.models.iter().map(|spec| spec.name)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
