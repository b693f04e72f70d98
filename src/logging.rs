use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes the logging system with both console and file output.
///
/// Console output is human readable; the rolling file under `log_dir` gets
/// one JSON object per event so stage runs can be audited afterwards.
pub fn init_logging(log_dir: &str) {
    let _ = fs::create_dir_all(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, "pipeline.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    // RUST_LOG wins; otherwise info for this crate and warnings elsewhere
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("episode_pipeline=info,warn"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    // The guard flushes the file writer on drop; the process owns it until exit.
    std::mem::forget(guard);
}
