//! Per-stage processing logic
//!
//! - `validator`: extension check and size-stability wait
//! - `stager`: extraction, manifest reading, image discovery
//! - `image`: decoding and letterboxing for model input
//! - `setup`: logger and folder initialization

pub mod image;
pub mod setup;
pub mod stager;
pub mod validator;
