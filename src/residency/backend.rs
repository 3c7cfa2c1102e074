use anyhow::{Result, bail};
use image::DynamicImage;

use crate::common::TAG_CONFIDENCE_THRESHOLD;
use crate::residency::registry::{BackendFamily, ModelSpec};

/// Raw output of one inference, before normalization into tags.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Caption(String),
    Scores(Vec<(String, f32)>),
}

/// Acquires a backend configured for exactly one model.
///
/// A load either returns a fully usable handle or an error; there is no
/// half-initialized state for the caller to track.
pub trait ModelLoader: Send + Sync {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LoadedModel>>;
}

pub trait LoadedModel: Send {
    /// `image` is already letterboxed to the model's input geometry.
    fn infer(&mut self, image: &DynamicImage) -> Result<Prediction>;

    /// Free everything the handle holds.
    fn unload(self: Box<Self>) -> Result<()>;
}

/// Turn a prediction into the lowercase tag list written to the result.
pub fn normalize(family: BackendFamily, prediction: Prediction) -> Result<Vec<String>> {
    match (family, prediction) {
        (BackendFamily::Captioning, Prediction::Caption(caption)) => Ok(caption
            .split_whitespace()
            .map(|word| word.to_lowercase())
            .collect()),
        (BackendFamily::Tagging, Prediction::Scores(mut scores)) => {
            scores.retain(|(_, score)| *score > TAG_CONFIDENCE_THRESHOLD);
            scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            Ok(scores
                .into_iter()
                .map(|(label, _)| label.replace('_', " ").to_lowercase())
                .collect())
        }
        (family, Prediction::Caption(_)) => bail!("{} backend returned a caption", family),
        (family, Prediction::Scores(_)) => bail!("{} backend returned label scores", family),
    }
}
