use anyhow::{Context, Result};
use dotenv::dotenv;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PREFIX: &str = "TAGWATCH_";

/// How the watch adapter learns about new artifacts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native notifications, falling back to polling when unavailable.
    #[default]
    Auto,
    Native,
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Directory receiving job archives
    pub watch_path: PathBuf,
    /// Directory receiving `<job_id>.json` result documents
    pub output_path: PathBuf,
    /// Root of the per-job extraction directories
    pub working_path: PathBuf,
    pub watch_mode: WatchMode,
    pub poll_interval_ms: u64,
    /// Upper bound on jobs running at once
    pub max_concurrent_jobs: usize,
    pub stability_timeout_secs: u64,
    pub stability_interval_ms: u64,
    pub extraction_timeout_secs: u64,
    /// Worker program spawned once per resident model
    pub backend_command: PathBuf,
    pub backend_args: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            watch_path: PathBuf::from("data/input"),
            output_path: PathBuf::from("data/output"),
            working_path: PathBuf::from("data/working"),
            watch_mode: WatchMode::Auto,
            poll_interval_ms: 1000,
            max_concurrent_jobs: 2,
            stability_timeout_secs: 5,
            stability_interval_ms: 1000,
            extraction_timeout_secs: 5,
            backend_command: PathBuf::from("tagwatch-worker"),
            backend_args: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Read `.env` (if any) and then `TAGWATCH_*` variables over the defaults.
    pub fn from_env() -> Result<Self> {
        if dotenv().is_ok() {
            info!("Loaded environment overrides from .env");
        }
        envy::prefixed(ENV_PREFIX)
            .from_env::<AppConfig>()
            .context("failed to read TAGWATCH_* configuration from environment")
    }

    pub fn timings(&self) -> JobTimings {
        JobTimings {
            stability_timeout: Duration::from_secs(self.stability_timeout_secs),
            stability_interval: Duration::from_millis(self.stability_interval_ms),
            extraction_timeout: Duration::from_secs(self.extraction_timeout_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Deadlines applied while an artifact is validated and unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimings {
    pub stability_timeout: Duration,
    pub stability_interval: Duration,
    pub extraction_timeout: Duration,
}

impl Default for JobTimings {
    fn default() -> Self {
        AppConfig::default().timings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.watch_mode, WatchMode::Auto);
        assert_eq!(config.max_concurrent_jobs, 2);

        let timings = config.timings();
        assert_eq!(timings.stability_timeout, Duration::from_secs(5));
        assert_eq!(timings.stability_interval, Duration::from_secs(1));
        assert_eq!(timings.extraction_timeout, Duration::from_secs(5));
    }

    #[test]
    fn overrides_are_read_from_prefixed_variables() {
        let vars = vec![
            ("TAGWATCH_WATCH_PATH".to_string(), "/srv/in".to_string()),
            ("TAGWATCH_WATCH_MODE".to_string(), "poll".to_string()),
            ("TAGWATCH_MAX_CONCURRENT_JOBS".to_string(), "8".to_string()),
            ("TAGWATCH_BACKEND_ARGS".to_string(), "--device,cuda".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let config: AppConfig = envy::prefixed(ENV_PREFIX).from_iter(vars).unwrap();

        assert_eq!(config.watch_path, PathBuf::from("/srv/in"));
        assert_eq!(config.watch_mode, WatchMode::Poll);
        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.backend_args, vec!["--device", "cuda"]);
        assert_eq!(config.output_path, PathBuf::from("data/output"));
    }
}
