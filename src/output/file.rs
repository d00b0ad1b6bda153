//! Line-delimited JSON sinks: file and stdout

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flowsynth_common::FlowLog;

use crate::error::{Result, SynthError};
use crate::output::Output;

/// Writes one JSON record per line to a file.
pub struct FileOutput {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileOutput {
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }
}

#[async_trait]
impl Output for FileOutput {
    async fn start(&mut self, _shutdown: CancellationToken) -> Result<()> {
        info!("writing flow logs to {}", self.path.display());
        let file = File::create(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    async fn write(&mut self, log: &FlowLog) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SynthError::Output("file output not started".to_string()))?;
        let line = serde_json::to_string(&log.to_record())?;
        writeln!(writer, "{line}")?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Writes one JSON record per line to stdout.
pub struct StdoutOutput;

impl StdoutOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdoutOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Output for StdoutOutput {
    async fn start(&mut self, _shutdown: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, log: &FlowLog) -> Result<()> {
        let line = serde_json::to_string(&log.to_record())?;
        println!("{line}");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsynth_common::{
        EndpointMetadata, FlowAction, FlowMeta, FlowReporter, FlowTuple, ReportedStats,
        PROTO_TCP,
    };
    use std::net::Ipv4Addr;

    fn sample_log(sport: i32) -> FlowLog {
        FlowLog {
            meta: FlowMeta {
                tuple: FlowTuple::new(
                    Ipv4Addr::new(35, 32, 0, 1).into(),
                    Ipv4Addr::new(10, 10, 1, 5).into(),
                    PROTO_TCP,
                    sport,
                    80,
                ),
                src_meta: EndpointMetadata::public_net(),
                dst_meta: EndpointMetadata::workload("default", "web-aaaaa", "web-*"),
                action: FlowAction::Allow,
                reporter: FlowReporter::Dst,
            },
            labels: None,
            policies: None,
            stats: ReportedStats {
                num_flows: 1,
                ..ReportedStats::default()
            },
            start_time: 1262476800,
            end_time: 1262477100,
            host: "synth-node-00".to_string(),
        }
    }

    #[tokio::test]
    async fn test_file_output_writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.json");

        let mut output = FileOutput::new(path.clone());
        output.start(CancellationToken::new()).await.unwrap();
        output.write(&sample_log(40000)).await.unwrap();
        output.write(&sample_log(40001)).await.unwrap();
        output.stop().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["dest_ip"], "10.10.1.5");
            assert_eq!(value["action"], "allow");
            assert_eq!(value["host"], "synth-node-00");
        }
    }

    #[tokio::test]
    async fn test_file_output_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = FileOutput::new(dir.path().join("flows.json"));
        assert!(output.write(&sample_log(40000)).await.is_err());
    }
}
