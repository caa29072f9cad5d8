use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use retouch::controller::EditController;
use retouch::memory::MemoryMonitor;
use retouch::session::{ExecMode, SessionStore};
use retouch::settings::{resolve_settings_path, SessionConfig, Settings};
use retouch::view::ViewRenderer;
use retouch::{codec, logging, ops};

/// Load an image, apply a chain of edits and save the result.
#[derive(Debug, Parser)]
#[command(name = "retouch", version)]
struct Cli {
    /// Image to edit (PNG, JPEG or BMP).
    input: PathBuf,

    /// Where to write the result; defaults to a timestamped PNG next to the input.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Operation to apply, in order. Repeatable.
    #[arg(long = "op", value_name = "NAME")]
    ops: Vec<String>,

    /// Settings file; defaults to the one next to the executable.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Run edits on the background worker.
    #[arg(long)]
    queued: bool,

    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = match &cli.settings {
        Some(path) => path.clone(),
        None => resolve_settings_path()?,
    };
    let settings = Settings::load(&settings_path)?;
    logging::init(cli.debug || settings.debug_logging, settings.log_file.as_deref())?;
    tracing::debug!(path = %settings_path.display(), "settings loaded");

    let transforms = cli
        .ops
        .iter()
        .map(|spec| ops::parse(spec))
        .collect::<Result<Vec<_>>>()?;

    let config = Arc::new(SessionConfig::resolve(&settings));
    let session = SessionStore::shared(config.clone());
    let renderer = ViewRenderer::from_config(&config);

    let mut monitor = MemoryMonitor::new(config.clone());
    monitor.register_session(&session);
    monitor.register_cache(renderer.cache());
    monitor.start()?;

    {
        let mut store = session
            .lock()
            .map_err(|_| anyhow::anyhow!("session lock poisoned"))?;
        store
            .load(&cli.input)
            .with_context(|| format!("failed to load {}", cli.input.display()))?;
    }

    let mode = if cli.queued {
        ExecMode::Queued
    } else {
        ExecMode::Synchronous
    };
    let mut controller = EditController::new(session.clone()).with_mode(mode);
    for transform in &transforms {
        controller
            .apply(transform)
            .with_context(|| format!("operation {} failed", transform.name()))?;
    }

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| codec::default_output_path(&cli.input, chrono::Local::now()));
    let mut store = session
        .lock()
        .map_err(|_| anyhow::anyhow!("session lock poisoned"))?;
    if let Some(current) = store.current() {
        let thumbnail = renderer.scaled(current, 0.25)?;
        tracing::debug!(
            width = thumbnail.width(),
            height = thumbnail.height(),
            "rendered thumbnail"
        );
    }
    store
        .save(&output)
        .with_context(|| format!("failed to save {}", output.display()))?;
    tracing::info!(
        output = %output.display(),
        edits = store.history_len().saturating_sub(1),
        "done"
    );
    drop(store);

    monitor.stop();
    Ok(())
}
