use anyhow::{Context, Result};
use clap::Parser;
use proxy::cli::CliArgs;
use proxy::config::ProxyConfig;
use proxy::lifecycle;
use std::path::Path;
use tracing::info;

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ProxyConfig::default(),
    };
    args.apply(&mut config);

    let _log_guard = common::init_tracing(
        config.log_dir.as_deref().map(Path::new),
        &config.log_file,
        &config.log_level,
    );

    info!("Starting proxy with configuration: {:?}", config);

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = config.runtime_threads {
        runtime.worker_threads(threads);
    }
    let runtime = runtime.build().context("Failed to build Tokio runtime")?;

    runtime.block_on(lifecycle::run(config))
}
