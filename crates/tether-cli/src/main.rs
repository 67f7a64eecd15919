mod cli;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tether::{ERROR_LINE_PREFIX, LogConfig, Supervisor, init_tracing};

use crate::cli::Cli;

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            // Logging may not be up yet, so this goes straight to stderr.
            eprintln!("{ERROR_LINE_PREFIX}{e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    init_tracing(LogConfig {
        level: cli.log_level,
        format: cli.log_format,
    });
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tether starting");

    let config = cli.into_config();
    // Few workers: the address-space ceiling also covers per-thread stacks
    // and allocator arenas.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let code = runtime.block_on(Supervisor::new(config).run());
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(code)
}
