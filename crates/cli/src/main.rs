//! fsbridge CLI - watch a path and print change notifications

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use watcher::{BackendKind, EventLoop, WatchConfig};

mod output;

use output::{write_event, EventLine, Format};

/// fsbridge - relay file system notifications onto a single event loop
#[derive(Parser)]
#[command(name = "fsbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to watch
    path: PathBuf,

    /// Report changes anywhere below the path, not just immediate children
    #[arg(short, long)]
    recursive: bool,

    /// Coalescing window in milliseconds (overrides the config file)
    #[arg(long)]
    latency_ms: Option<u64>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Notification backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Fail instead of degrading when the path cannot be resolved
    #[arg(long)]
    strict: bool,

    /// Print one JSON object per event
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Native,
    Null,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendKind::Auto,
            BackendArg::Native => BackendKind::Native,
            BackendArg::Null => BackendKind::Null,
        }
    }
}

impl Cli {
    fn watch_config(&self) -> Result<WatchConfig> {
        let mut config = match &self.config {
            Some(path) => WatchConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => WatchConfig::default(),
        };

        if let Some(latency_ms) = self.latency_ms {
            config.latency_ms = latency_ms;
        }
        if let Some(backend) = self.backend {
            config.backend = backend.into();
        }
        if self.strict {
            config.strict_paths = true;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.watch_config()?;
    let format = if cli.json { Format::Json } else { Format::Human };

    let event_loop = EventLoop::with_config(config).context("Failed to create event loop")?;

    let stdout = std::io::stdout();
    let output_failed = Rc::new(Cell::new(false));
    let failed = output_failed.clone();
    let watch = event_loop
        .watch(&cli.path, cli.recursive, move |handle, path, kind, _status| {
            let line = EventLine::new(handle.path(), path, kind);
            if let Err(err) = write_event(&mut stdout.lock(), &line, format) {
                error!("cannot write to stdout: {}", err);
                failed.set(true);
                if let Err(err) = handle.close() {
                    warn!("cannot close watch: {}", err);
                }
            }
        })
        .with_context(|| format!("Failed to watch {}", cli.path.display()))?;

    info!(path = %cli.path.display(), recursive = cli.recursive, "watching");

    let idle = event_loop.idle();
    let interrupted = event_loop.run_until(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            _ = idle => false,
        }
    });

    if output_failed.get() {
        anyhow::bail!("Output closed; stopped watching {}", cli.path.display());
    }

    if interrupted {
        debug!("interrupted");
        if watch.is_active() {
            watch.close().context("Failed to close watch")?;
        }
    } else {
        eprintln!("{} is gone; stopped watching", cli.path.display());
    }

    Ok(())
}
