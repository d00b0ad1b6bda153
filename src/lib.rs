pub mod aggregator;
pub mod apps;
pub mod builder;
pub mod cli;
pub mod config;
pub mod error;
pub mod ipam;
pub mod output;
pub mod scaler;
pub mod synth;

pub use error::{Result, SynthError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
