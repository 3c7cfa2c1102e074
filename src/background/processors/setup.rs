//! Setup/initialization module - handles application startup tasks
//!
//! Includes:
//! - Logger initialization
//! - Folder structure initialization

use anstyle::{AnsiColor, Style};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::kv::Key;
use std::{fs, io::Write};

use crate::config::AppConfig;

// ────────────────────────────────────────────────────────────────
// Folder Initialization
// ────────────────────────────────────────────────────────────────

/// Create the watch, output and working roots if they are missing.
pub fn initialize_folder(config: &AppConfig) -> Result<()> {
    for dir in [&config.watch_path, &config.output_path, &config.working_path] {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────
// Logger Initialization
// ────────────────────────────────────────────────────────────────

const DIM: Style = AnsiColor::BrightBlack.on_default();
const DURATION: Style = AnsiColor::Cyan.on_default();

/// `"1.234567ms"` → `"1.23 ms"`; anything unparseable is passed through.
fn format_duration(raw: &str) -> String {
    if let Some(idx) = raw.find(|c: char| c.is_alphabetic()) {
        let (num, unit) = (&raw[..idx], &raw[idx..]);
        if let Ok(val) = num.parse::<f32>() {
            return format!("{:.2} {}", val, unit);
        }
    }
    raw.to_string()
}

/// Install the process-wide logger on stderr.
///
/// INFO and above by default, `RUST_LOG` overrides. Records carrying a
/// `duration` key get it printed in a right-aligned column.
pub fn initialize_logger() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder
        .format(|buf, record| {
            let ts = buf.timestamp();
            let level_style = buf.default_level_style(record.level());

            let dur_raw = record
                .key_values()
                .get(Key::from("duration"))
                .map(|v| format_duration(&v.to_string()))
                .unwrap_or_default();
            let dur = if dur_raw.is_empty() {
                " ".repeat(10)
            } else {
                format!("{DURATION}{:>10}{DURATION:#}", dur_raw)
            };

            writeln!(
                buf,
                "{DIM}{ts}{DIM:#} {level_style}{}{level_style:#} {DIM}{}{DIM:#}",
                record.level(),
                record.target()
            )?;

            let message = format!("{}", record.args());
            let subsequent_indent = " ".repeat(11);
            let mut lines = message.lines();
            if let Some(first_line) = lines.next() {
                writeln!(buf, "{} {}", dur, first_line)?;
            }
            for line in lines {
                writeln!(buf, "{}{}", subsequent_indent, line)?;
            }
            Ok(())
        })
        .target(Target::Stderr)
        // The watcher backends are chatty at debug level.
        .filter(Some("notify"), log::LevelFilter::Warn);

    // A second initialization (e.g. from tests) keeps the first logger.
    let _ = builder.try_init();
}
