//! YAML configuration schema
//!
//! Keys are case-sensitive and match the documented schema exactly. App,
//! output, and event polymorphism is expressed as tagged enums dispatched
//! on `Type` with the payload under `Spec`, so an unknown kind fails at
//! parse time rather than at run time.

use std::path::Path;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::Deserialize;

use crate::error::{Result, SynthError};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Top-level configuration for one run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SynthConfig {
    pub num_nodes: usize,
    pub pod_network: String,
    pub start_time: String,
    pub end_time: String,
    /// Seeds every PRNG in the run; omit for a fresh seed per run.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
    #[serde(default)]
    pub outs: Vec<OutputConfig>,
    #[serde(default, rename = "CPUProfilePath")]
    pub cpu_profile_path: Option<String>,
    #[serde(default)]
    pub trace_path: Option<String>,
}

impl SynthConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| SynthError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }
}

/// Parse a config timestamp in local time.
pub fn parse_time(value: &str) -> Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
        .or_else(|_| {
            NaiveDate::parse_from_str(value, DATE_FORMAT)
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or(NaiveDateTime::MIN))
        })
        .map_err(|_| SynthError::Time {
            value: value.to_string(),
        })?;

    naive
        .and_local_timezone(Local)
        .earliest()
        .ok_or_else(|| SynthError::Time {
            value: value.to_string(),
        })
}

/// One registered application.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type", content = "Spec")]
pub enum AppConfig {
    Basic(BasicConfig),
    Scaling(ScalingConfig),
    MultiService(MultiServiceConfig),
    WrappedApp(WrappedAppConfig),
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BasicConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    pub num_pods: usize,
    pub flows_per_sec: f64,
    pub dest_port: u16,
    #[serde(default)]
    pub scaler: ScalerConfig,
    /// Pools external source addresses are drawn from; defaults to the
    /// built-in external pool.
    #[serde(default)]
    pub source_ips: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalingConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    pub num_pods: usize,
    pub flows_per_sec: f64,
    pub flows_per_sec_pod: f64,
    pub threshold: f64,
    pub dest_port: u16,
    #[serde(default)]
    pub scaler: ScalerConfig,
    #[serde(default)]
    pub source_ips: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MultiServiceConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub services: Vec<ServiceConfig>,
}

fn default_threshold() -> f64 {
    0.1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceConfig {
    pub name: String,
    pub port: u16,
    pub flows_per_sec_pod: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub ingress_flows_per_sec: f64,
    #[serde(default)]
    pub scaler: ScalerConfig,
    #[serde(default)]
    pub ingress_source_ips: Vec<String>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

fn default_external_port() -> u16 {
    80
}

/// An edge targets either a sibling service or an external address range,
/// never both.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EdgeConfig {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub external_ips: Vec<String>,
    #[serde(default = "default_external_port")]
    pub external_port: u16,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub constant_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WrappedAppConfig {
    pub app: Box<AppConfig>,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

/// One scheduled anomaly.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type", content = "Spec")]
pub enum EventConfig {
    PortScan(PortScanConfig),
    #[serde(rename = "IPSweep")]
    IpSweep(IpSweepConfig),
    ConnectionSpike(ConnectionSpikeConfig),
    BytesAnomaly(BytesAnomalyConfig),
    #[serde(rename = "OutboundIPAnomaly")]
    OutboundIpAnomaly(OutboundIpAnomalyConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortScanConfig {
    pub at: String,
    pub service: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpSweepConfig {
    pub at: String,
    pub service: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionSpikeConfig {
    pub at: String,
    pub service: String,
    pub port: u16,
    pub num_flows: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BytesAnomalyConfig {
    pub at: String,
    pub service: String,
    pub port: u16,
    pub num_flows: u64,
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundIpAnomalyConfig {
    pub at: String,
    pub service: String,
    #[serde(default = "default_external_port")]
    pub port: u16,
    pub num_flows: u64,
    #[serde(default)]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalerConfig {
    #[serde(default)]
    pub constant: f64,
    #[serde(default)]
    pub noise_factor: f64,
    #[serde(default)]
    pub weekly_phasers: Vec<PhaserConfig>,
    #[serde(default)]
    pub daily_phasers: Vec<PhaserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhaserConfig {
    pub amplitude: f64,
    #[serde(default)]
    pub phase: f64,
}

/// One registered output sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type", content = "Spec")]
pub enum OutputConfig {
    #[serde(rename = "JSON")]
    Json(JsonOutputConfig),
    Stdout,
    Elastic(ElasticOutputConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JsonOutputConfig {
    pub path: String,
}

fn default_index_prefix() -> String {
    "flowsynth".to_string()
}

fn default_workers() -> usize {
    crate::output::elastic::DEFAULT_BULK_WORKERS
}

fn default_flush_bytes() -> usize {
    crate::output::elastic::DEFAULT_FLUSH_BYTES
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ElasticOutputConfig {
    pub url: String,
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
}
