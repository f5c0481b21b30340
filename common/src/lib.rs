pub mod bandwidth;
pub mod error;

pub use bandwidth::{BandwidthLedger, DestinationStats, LedgerSnapshot, LedgerStore};
pub use error::{CommonError, Result};

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Installs the global subscriber.
///
/// With a `log_dir` the output goes to a daily rolling file through a
/// non-blocking writer and the returned guard must be kept alive until exit;
/// otherwise logs go to stdout. `RUST_LOG` takes precedence over `log_level`.
/// Calling this twice is a no-op for the second call.
pub fn init_tracing(log_dir: Option<&Path>, log_file: &str, log_level: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let (file_layer, guard) = match log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_file);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = guard.is_none().then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_ansi(true)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init();

    guard
}
