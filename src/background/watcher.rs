//! Watch adapter - turns filesystem notifications into job arrivals
//!
//! Includes:
//! - Native (`RecommendedWatcher`) and polling (`PollWatcher`) sources
//! - Arrival filtering (creation and rename-into-place)
//! - The event loop that spawns one job task per arrival and drains them on shutdown

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{
    Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RenameMode},
};
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinSet,
};

use crate::background::flows::JobController;
use crate::config::WatchMode;
use crate::models::entity::job::Job;

// ────────────────────────────────────────────────────────────────
// Watch Sources
// ────────────────────────────────────────────────────────────────

/// A live subscription on the watch directory. Dropping it stops delivery.
pub enum DirectoryWatcher {
    Native(RecommendedWatcher),
    Poll(PollWatcher),
}

impl DirectoryWatcher {
    fn native(dir: &Path, tx: UnboundedSender<PathBuf>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(arrival_handler(tx), Config::default())
            .context("failed to create native watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {:?}", dir))?;
        Ok(DirectoryWatcher::Native(watcher))
    }

    fn poll(dir: &Path, tx: UnboundedSender<PathBuf>, interval: Duration) -> Result<Self> {
        let mut watcher = PollWatcher::new(
            arrival_handler(tx),
            Config::default().with_poll_interval(interval),
        )
        .context("failed to create poll watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to poll {:?}", dir))?;
        Ok(DirectoryWatcher::Poll(watcher))
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, DirectoryWatcher::Poll(_))
    }
}

/// Subscribe to arrivals in `dir`.
///
/// `WatchMode::Auto` prefers native notifications and falls back to polling
/// when the platform (or the filesystem, e.g. a network mount) refuses them.
pub fn watch_directory(
    dir: &Path,
    mode: WatchMode,
    poll_interval: Duration,
) -> Result<(DirectoryWatcher, UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = unbounded_channel();
    let watcher = match mode {
        WatchMode::Native => DirectoryWatcher::native(dir, tx)?,
        WatchMode::Poll => DirectoryWatcher::poll(dir, tx, poll_interval)?,
        WatchMode::Auto => match DirectoryWatcher::native(dir, tx.clone()) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Native watcher unavailable, falling back to polling: {:#}", e);
                DirectoryWatcher::poll(dir, tx, poll_interval)?
            }
        },
    };
    info!(
        "Watching {:?} ({})",
        dir,
        if watcher.is_polling() { "poll" } else { "native" }
    );
    Ok((watcher, rx))
}

fn arrival_handler(tx: UnboundedSender<PathBuf>) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |result: notify::Result<Event>| match result {
        Ok(event) => {
            for path in arrivals(event) {
                if tx.send(path).is_err() {
                    debug!("Event loop is gone, dropping arrival");
                }
            }
        }
        Err(e) => error!("Watch error: {:?}", e),
    }
}

/// Paths in `event` that count as a new artifact.
///
/// A rename into the directory is treated like a creation, so producers that
/// write to a temporary name and then move the file are picked up.
pub fn arrivals(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        _ => Vec::new(),
    }
}

// ────────────────────────────────────────────────────────────────
// Event Loop
// ────────────────────────────────────────────────────────────────

/// Dispatch arrivals to `controller` until `shutdown` resolves, then wait
/// for every job already started. Returns how many jobs ran to completion.
///
/// `tasks` may already hold jobs queued by startup recovery.
pub async fn run_event_loop(
    controller: Arc<JobController>,
    mut events: UnboundedReceiver<PathBuf>,
    mut tasks: JoinSet<Option<Job>>,
    shutdown: impl Future<Output = ()>,
) -> usize {
    let mut completed = 0;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting jobs");
                break;
            }
            arrival = events.recv() => {
                let Some(path) = arrival else {
                    warn!("Watcher closed its channel");
                    break;
                };
                if !path.is_file() {
                    debug!("Ignoring {:?}: no longer a file", path);
                    continue;
                }
                if let Err(e) = tokio::fs::create_dir_all(controller.output_path()).await {
                    error!("Failed to create output directory {:?}: {}", controller.output_path(), e);
                }
                info!("New job: {:?}", path);
                let controller = controller.clone();
                tasks.spawn(async move { controller.process(path).await });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                completed += count_finished(joined);
            }
        }
    }

    if !tasks.is_empty() {
        info!("Waiting for {} in-flight jobs", tasks.len());
    }
    while let Some(joined) = tasks.join_next().await {
        completed += count_finished(joined);
    }
    completed
}

fn count_finished(joined: Result<Option<Job>, tokio::task::JoinError>) -> usize {
    match joined {
        Ok(Some(_)) => 1,
        Ok(None) => 0,
        Err(e) => {
            error!("Job task failed: {}", e);
            0
        }
    }
}
