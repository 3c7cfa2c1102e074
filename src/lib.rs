//! Watch-folder tagging service
//!
//! Job archives dropped into the watch directory are validated, unpacked,
//! tagged by the one resident model backend and answered with a
//! `<job_id>.json` document in the output directory.

pub mod background;
pub mod common;
pub mod config;
pub mod models;
pub mod residency;
pub mod utils;
