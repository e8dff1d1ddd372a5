use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use ruleloom_config::paths::data_dir_or_local;

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Counts warnings about rule files and expansions
#[derive(Clone, Default)]
pub struct WarningCounter {
    count: Arc<AtomicUsize>,
}

impl WarningCounter {
    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

impl<S: Subscriber> Layer<S> for WarningCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() == Level::WARN && matches!(meta.target(), "rules" | "expansions") {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Keeps the file writer alive and exposes the warning count
pub struct LogGuard {
    _file: Option<WorkerGuard>,
    warnings: WarningCounter,
}

impl LogGuard {
    pub fn warnings(&self) -> &WarningCounter {
        &self.warnings
    }
}

fn env_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    })
}

/// Initialize logging to stderr, and to `<data dir>/logs/{component}.log`
/// when `to_file` is set.
///
/// The returned guard must be kept alive for the duration of the program.
pub fn init_logging(component: &str, to_file: bool, verbose: u8) -> io::Result<LogGuard> {
    let warnings = WarningCounter::default();
    let console = fmt::layer().with_writer(io::stderr).with_target(false);

    if !to_file {
        tracing_subscriber::registry()
            .with(env_filter(verbose))
            .with(console)
            .with(warnings.clone())
            .init();
        return Ok(LogGuard {
            _file: None,
            warnings,
        });
    }

    let log_path = log_directory().join(format!("{}.log", component));
    let file = open_log_file(&log_path)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(console)
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true),
        )
        .with(warnings.clone())
        .init();

    tracing::info!("Logging to file: {}", log_path.display());

    Ok(LogGuard {
        _file: Some(guard),
        warnings,
    })
}

fn log_directory() -> PathBuf {
    data_dir_or_local().join("logs")
}

/// Open a log file for appending, starting over once it grows past 1 MiB
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if fs::metadata(path).map(|m| m.len() > MAX_LOG_SIZE).unwrap_or(false) {
        File::create(path)?.set_len(0)?;
    }

    OpenOptions::new().create(true).append(true).open(path)
}
