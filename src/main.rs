use anyhow::Result;
use log::info;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

use tagwatch::background::flows::JobController;
use tagwatch::background::processors::setup::{initialize_folder, initialize_logger};
use tagwatch::background::watcher::{run_event_loop, watch_directory};
use tagwatch::common::INDEX_RUNTIME;
use tagwatch::common::errors::handle_error;
use tagwatch::config::AppConfig;
use tagwatch::residency::{CommandLoader, ModelRegistry, ResidencyManager};

fn main() -> Result<()> {
    initialize_logger();
    let config = AppConfig::from_env().map_err(handle_error)?;
    initialize_folder(&config).map_err(handle_error)?;

    let registry = ModelRegistry::builtin();
    info!("Supported models: {}", registry.names().collect::<Vec<_>>().join(", "));
    let loader = CommandLoader::new(config.backend_command.clone(), config.backend_args.clone());
    let residency = Arc::new(ResidencyManager::new(registry, loader));
    let controller = Arc::new(JobController::new(&config, residency.clone()));

    INDEX_RUNTIME.block_on(async {
        controller.clean_start().map_err(handle_error)?;

        // Subscribe before recovery so nothing dropped in between is missed;
        // the in-progress guard absorbs the overlap.
        let (watcher, events) =
            watch_directory(&config.watch_path, config.watch_mode, config.poll_interval())
                .map_err(handle_error)?;

        let start_time = Instant::now();
        let mut tasks = JoinSet::new();
        let recovered = controller
            .reprocess_unhandled_jobs(&config.watch_path, &mut tasks)
            .map_err(handle_error)?;
        info!(
            duration = &*format!("{:?}", start_time.elapsed());
            "Queued {} unhandled jobs", recovered
        );

        let completed = run_event_loop(controller.clone(), events, tasks, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;
        drop(watcher);
        info!("Processed {} jobs this session", completed);
        anyhow::Ok(())
    })?;

    residency.evict();
    let stats = residency.stats();
    info!(
        "Model loads: {}, unloads: {}, warm hits: {}",
        stats.loads, stats.unloads, stats.warm_hits
    );
    Ok(())
}
