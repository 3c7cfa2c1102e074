//! Single-resident model slot
//!
//! Structure:
//! - `registry`: Static model id → {backend family, input geometry} mapping
//! - `backend`: Load/infer/unload capability and tag normalization
//! - `command`: Backend driving an external worker process per loaded model
//! - `manager`: The serialized `run` operation owning the loaded backend

pub mod backend;
pub mod command;
pub mod manager;
pub mod registry;

pub use backend::{LoadedModel, ModelLoader, Prediction};
pub use command::CommandLoader;
pub use manager::{Residence, ResidencyManager, ResidencyStats};
pub use registry::{BackendFamily, ModelRegistry, ModelSpec};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResidencyError {
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    #[error("{0}")]
    Backend(String),
}
