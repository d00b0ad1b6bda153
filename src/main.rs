use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use flowsynth::builder;
use flowsynth::cli::Cli;
use flowsynth::config::SynthConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Starting flowsynth v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&cli.config).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(config_path: &Path) -> Result<()> {
    let config = SynthConfig::from_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let (mut synthesizer, start, end) = builder::build(&config)?;

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current window");
            interrupt.cancel();
        }
    });

    synthesizer.start_outputs(shutdown.clone()).await?;
    synthesizer.synthesize(start, end, &shutdown).await?;
    synthesizer.stop_outputs().await?;
    shutdown.cancel();

    info!("flowsynth finished");
    Ok(())
}
