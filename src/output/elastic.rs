//! Bulk-indexed store output
//!
//! Records are grouped into one index per calendar day, derived from the
//! record's end time. A pool of bulk workers drains a bounded queue and
//! posts ND-JSON `_bulk` bodies; the day index is created on first write.
//! Write failures are retried once inside the worker; the synthesis core
//! never reattempts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, TimeZone};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowsynth_common::FlowLog;

use crate::error::{Result, SynthError};
use crate::output::Output;

pub const DEFAULT_BULK_WORKERS: usize = 16;
pub const DEFAULT_FLUSH_BYTES: usize = 4 * 1024 * 1024;

const QUEUE_DEPTH: usize = 4096;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Index name for the day the record's window ended in.
pub(crate) fn day_index(prefix: &str, end_time: i64) -> String {
    let day = Local
        .timestamp_opt(end_time, 0)
        .single()
        .map(|t| t.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "00000000".to_string());
    format!("{prefix}_{day}")
}

/// Bulk-indexing sink backed by a worker pool.
pub struct ElasticOutput {
    url: String,
    index_prefix: String,
    workers: usize,
    flush_bytes: usize,
    tx: Option<mpsc::Sender<(String, String)>>,
    handles: Vec<JoinHandle<()>>,
}

impl ElasticOutput {
    pub fn new(url: String, index_prefix: String, workers: usize, flush_bytes: usize) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            index_prefix,
            workers,
            flush_bytes,
            tx: None,
            handles: Vec::new(),
        }
    }
}

#[async_trait]
impl Output for ElasticOutput {
    async fn start(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "elastic output: {} workers against {}",
            self.workers, self.url
        );

        let client = reqwest::Client::new();
        let (tx, rx) = mpsc::channel::<(String, String)>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let created = Arc::new(Mutex::new(HashSet::new()));

        for _ in 0..self.workers {
            self.handles.push(tokio::spawn(bulk_worker(
                client.clone(),
                self.url.clone(),
                rx.clone(),
                created.clone(),
                shutdown.clone(),
                self.flush_bytes,
            )));
        }

        self.tx = Some(tx);
        Ok(())
    }

    async fn write(&mut self, log: &FlowLog) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SynthError::Output("elastic output not started".to_string()))?;

        let index = day_index(&self.index_prefix, log.end_time);
        let line = serde_json::to_string(&log.to_record())?;
        tx.send((index, line))
            .await
            .map_err(|_| SynthError::Output("elastic bulk workers stopped".to_string()))
    }

    async fn stop(&mut self) -> Result<()> {
        // Dropping the sender lets workers drain the queue and exit.
        self.tx = None;
        for handle in self.handles.drain(..) {
            handle
                .await
                .map_err(|e| SynthError::Task(e.to_string()))?;
        }
        Ok(())
    }
}

async fn bulk_worker(
    client: reqwest::Client,
    url: String,
    rx: Arc<Mutex<mpsc::Receiver<(String, String)>>>,
    created: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
    flush_bytes: usize,
) {
    let mut batches: HashMap<String, String> = HashMap::new();
    let mut pending = 0usize;

    loop {
        let item = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                item = rx.recv() => item,
            }
        };

        let (index, line) = match item {
            Some(item) => item,
            None => break,
        };

        ensure_index(&client, &url, &index, &created).await;

        let body = batches.entry(index).or_default();
        body.push_str("{\"index\":{}}\n");
        body.push_str(&line);
        body.push('\n');
        pending += line.len();

        if pending >= flush_bytes {
            flush_all(&client, &url, &mut batches).await;
            pending = 0;
        }
    }

    flush_all(&client, &url, &mut batches).await;
}

/// Create the day index on first write, remembering what already exists.
async fn ensure_index(
    client: &reqwest::Client,
    url: &str,
    index: &str,
    created: &Arc<Mutex<HashSet<String>>>,
) {
    let mut created = created.lock().await;
    if created.contains(index) {
        return;
    }

    // An "already exists" response from a concurrent run is fine.
    match client.put(format!("{url}/{index}")).send().await {
        Ok(_) => {
            created.insert(index.to_string());
        }
        Err(e) => warn!("failed to create index {}: {}", index, e),
    }
}

async fn flush_all(client: &reqwest::Client, url: &str, batches: &mut HashMap<String, String>) {
    for (index, body) in batches.drain() {
        if body.is_empty() {
            continue;
        }
        send_bulk(client, url, &index, body).await;
    }
}

/// One retry inside the worker; a second failure drops the batch.
async fn send_bulk(client: &reqwest::Client, url: &str, index: &str, body: String) {
    for attempt in 0..2 {
        let result = client
            .post(format!("{url}/{index}/_bulk"))
            .header("content-type", "application/x-ndjson")
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => {
                warn!(
                    "bulk write to {} failed with status {} (attempt {})",
                    index,
                    response.status(),
                    attempt + 1
                );
            }
            Err(e) => {
                warn!("bulk write to {} failed: {} (attempt {})", index, e, attempt + 1);
            }
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
    error!("dropping bulk batch for {} after retry", index);
}
