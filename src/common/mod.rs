pub mod errors;

use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

pub const ARCHIVE_EXTENSION: &str = "zip";

pub const MANIFEST_FILE_NAME: &str = "job.json";

pub const VALID_IMAGE_EXTENSIONS: &'static [&'static str] = &["jpg", "jpeg", "png"];

/// Confidence cut-off applied to multi-label taggers.
pub const TAG_CONFIDENCE_THRESHOLD: f32 = 0.35;

pub const EXTRACT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub const MAX_DELETE_ATTEMPTS: u64 = 5;

pub static CURRENT_NUM_THREADS: LazyLock<usize> = LazyLock::new(|| {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
});

// Background Worker-specific Tokio Runtime
// Drives the watch loop, startup recovery and every per-job task.
pub static INDEX_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .worker_threads(*CURRENT_NUM_THREADS)
        .thread_name("background-task-worker")
        .enable_all()
        .build()
        .expect("Failed to build Worker Tokio runtime")
});
