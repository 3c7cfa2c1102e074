//! Background pipeline - watches for job archives and drives them to a result
//!
//! Structure:
//! - `types`: Core data structures (ProcessingGuard)
//! - `processors`: Stage-specific logic (validator, stager, image, setup)
//! - `flows`: The job lifecycle (JobController)
//! - `watcher`: Filesystem subscription and the event loop

pub mod flows;
pub mod processors;
pub mod types;
pub mod watcher;
