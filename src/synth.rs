//! The synthesizer: steps fixed windows over simulated time
//!
//! Per window it opens one update channel per node, spawns a fan-out worker
//! that owns that node's allow/deny aggregator pair, drives every app
//! concurrently, closes the channels, joins the workers to get the
//! aggregators back, and emits the drained flow logs to every output. The
//! single-writer-per-aggregator invariant is enforced by ownership: the
//! aggregator pair moves into its worker for the window and comes back out
//! through the join handle.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Local};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flowsynth_common::{FlowAction, FlowUpdate};

use crate::aggregator::{AggregationKind, FlowAggregator};
use crate::apps::{App, NodeChannels};
use crate::error::{Result, SynthError};
use crate::output::Output;

/// Fixed synthesis window width.
const WINDOW_MINUTES: i64 = 5;

/// Channel capacity per node per window.
const CHANNEL_DEPTH: usize = 1024;

struct NodeAggregators {
    allow: FlowAggregator,
    deny: FlowAggregator,
}

impl NodeAggregators {
    fn new() -> Self {
        Self {
            allow: FlowAggregator::new(AggregationKind::SourcePort)
                .with_action(FlowAction::Allow),
            deny: FlowAggregator::new(AggregationKind::SourcePort).with_action(FlowAction::Deny),
        }
    }

    fn feed(&mut self, update: &FlowUpdate) {
        self.allow.feed_update(update);
        self.deny.feed_update(update);
    }
}

/// Owns the aggregator table, the registered apps and outputs, and the step
/// loop.
pub struct Synthesizer {
    aggregators: HashMap<String, NodeAggregators>,
    apps: Vec<Box<dyn App>>,
    outputs: Vec<Box<dyn Output>>,
}

impl Synthesizer {
    /// Build the per-node allow/deny aggregator pairs up front; they live
    /// for the whole run so long-lived flows carry across windows.
    pub fn new(nodes: &[String]) -> Self {
        let aggregators = nodes
            .iter()
            .map(|node| (node.clone(), NodeAggregators::new()))
            .collect();
        Self {
            aggregators,
            apps: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn register_app(&mut self, app: Box<dyn App>) {
        self.apps.push(app);
    }

    pub fn register_output(&mut self, output: Box<dyn Output>) {
        self.outputs.push(output);
    }

    /// Start every output once, before the step loop runs.
    pub async fn start_outputs(&mut self, shutdown: CancellationToken) -> Result<()> {
        for output in &mut self.outputs {
            output.start(shutdown.clone()).await?;
        }
        Ok(())
    }

    /// Flush and stop every output.
    pub async fn stop_outputs(&mut self) -> Result<()> {
        for output in &mut self.outputs {
            output.stop().await?;
        }
        Ok(())
    }

    /// Step fixed windows from `start` to `end`, emitting each window's
    /// records to every output. Cancelling `shutdown` stops the loop at the
    /// next window boundary.
    pub async fn synthesize(
        &mut self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        info!(
            "synthesizing {} -> {} over {} nodes, {} apps",
            start,
            end,
            self.aggregators.len(),
            self.apps.len()
        );

        let mut t = start;
        while t < end {
            if shutdown.is_cancelled() {
                info!("shutdown requested, stopping at window boundary {}", t);
                break;
            }
            let window_end = t + Duration::minutes(WINDOW_MINUTES);
            self.step(t, window_end).await?;
            t = window_end;
        }

        Ok(())
    }

    async fn step(&mut self, start: DateTime<Local>, end: DateTime<Local>) -> Result<()> {
        // Fan-out workers take ownership of their node's aggregator pair
        // for the window. They must be running before any app sends.
        let mut senders: NodeChannels = HashMap::new();
        let mut workers = Vec::with_capacity(self.aggregators.len());
        for (node, mut aggregators) in std::mem::take(&mut self.aggregators) {
            let (tx, mut rx) = mpsc::channel::<FlowUpdate>(CHANNEL_DEPTH);
            senders.insert(node.clone(), tx);
            workers.push(tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    aggregators.feed(&update);
                }
                (node, aggregators)
            }));
        }

        // Drive every app concurrently; each task gives the app back.
        let mut app_tasks = Vec::with_capacity(self.apps.len());
        for mut app in std::mem::take(&mut self.apps) {
            let channels = senders.clone();
            app_tasks.push(tokio::spawn(async move {
                let result = app.generate(start, end, &channels).await;
                (app, result)
            }));
        }
        let mut app_error = None;
        for joined in futures::future::join_all(app_tasks).await {
            let (app, result) = joined.map_err(|e| SynthError::Task(e.to_string()))?;
            self.apps.push(app);
            if let (Err(e), None) = (result, &app_error) {
                app_error = Some(e);
            }
        }

        // Closing the channels lets the fan-out workers drain and finish;
        // joining them re-establishes single-threaded access before the
        // drain below.
        drop(senders);

        let mut records = 0usize;
        for worker in workers {
            let (node, mut aggregators) = worker
                .await
                .map_err(|e| SynthError::Task(e.to_string()))?;

            if app_error.is_none() {
                for aggregator in [&mut aggregators.allow, &mut aggregators.deny] {
                    for mut log in aggregator.get(start, end) {
                        log.host = node.clone();
                        records += 1;
                        for output in &mut self.outputs {
                            output.write(&log).await?;
                        }
                    }
                }
            }

            self.aggregators.insert(node, aggregators);
        }

        if let Some(e) = app_error {
            return Err(e);
        }

        debug!("window {} -> {}: {} records", start, end, records);
        Ok(())
    }
}
