//! Output sinks for synthesized flow logs
//!
//! Outputs are started once before synthesis, written to from the driver
//! loop only, and stopped (flushing anything buffered) when the run ends.
//! The cancellation token handed to `start` releases any background
//! workers an output spawned.

pub mod elastic;
pub mod file;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use flowsynth_common::FlowLog;

use crate::error::Result;

pub use elastic::ElasticOutput;
pub use file::{FileOutput, StdoutOutput};

/// A sink for flow log records.
#[async_trait]
pub trait Output: Send {
    /// Called once before synthesis begins.
    async fn start(&mut self, shutdown: CancellationToken) -> Result<()>;

    /// Write one record. Only ever called from the driver loop.
    async fn write(&mut self, log: &FlowLog) -> Result<()>;

    /// Flush buffered records and release resources.
    async fn stop(&mut self) -> Result<()>;
}
