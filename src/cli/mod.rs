use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "flowsynth")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Synthetic network flow log generator for anomaly-detection pipelines", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        default_value = "./config.yaml",
        help = "Path to the YAML configuration file"
    )]
    pub config: PathBuf,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,
}
