//! Wires a parsed configuration into a ready-to-run synthesizer

use std::sync::Arc;

use chrono::{DateTime, Local};
use ipnetwork::Ipv4Network;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::apps::events::{Event, EventShape};
use crate::apps::{
    App, BasicApp, EdgeTarget, MultiServiceApp, ScalingApp, ServiceEdge, ServiceSpec,
    WrappedApp, DEFAULT_EXTERNAL_CIDR,
};
use crate::config::{
    parse_time, AppConfig, EventConfig, OutputConfig, ScalerConfig, SynthConfig,
};
use crate::error::{Result, SynthError};
use crate::ipam::IpScheduler;
use crate::output::{ElasticOutput, FileOutput, Output, StdoutOutput};
use crate::scaler::{Phaser, Scaler};
use crate::synth::Synthesizer;

/// Build the synthesizer, its apps, and its outputs from the configuration.
/// Returns the synthesizer plus the parsed run interval.
pub fn build(config: &SynthConfig) -> Result<(Synthesizer, DateTime<Local>, DateTime<Local>)> {
    if config.num_nodes < 1 {
        return Err(SynthError::Config("NumNodes must be at least 1".to_string()));
    }

    let start = parse_time(&config.start_time)?;
    let end = parse_time(&config.end_time)?;
    if start >= end {
        return Err(SynthError::Config(format!(
            "StartTime {} must precede EndTime {}",
            config.start_time, config.end_time
        )));
    }

    let pool: Ipv4Network = config.pod_network.parse()?;
    let nodes: Vec<String> = (0..config.num_nodes)
        .map(|i| format!("synth-node-{i:02}"))
        .collect();
    let scheduler = Arc::new(IpScheduler::new_pooled(pool, nodes.clone()));

    let mut master = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut synthesizer = Synthesizer::new(&nodes);
    for app_config in &config.apps {
        let app = build_app(app_config, &scheduler, &mut master)?;
        synthesizer.register_app(app);
    }
    for output_config in &config.outs {
        synthesizer.register_output(build_output(output_config));
    }

    if config.cpu_profile_path.is_some() || config.trace_path.is_some() {
        warn!("CPUProfilePath/TracePath are accepted but profiling hooks are not wired in");
    }

    Ok((synthesizer, start, end))
}

/// Derive an independent per-component RNG from the master seed.
fn child_rng(master: &mut StdRng) -> StdRng {
    StdRng::seed_from_u64(master.gen())
}

fn build_scaler(config: &ScalerConfig) -> Scaler {
    let phasers = |items: &[crate::config::PhaserConfig]| -> Vec<Phaser> {
        items
            .iter()
            .map(|p| Phaser {
                amplitude: p.amplitude,
                phase: p.phase,
            })
            .collect()
    };
    Scaler::new(
        phasers(&config.weekly_phasers),
        phasers(&config.daily_phasers),
        config.constant,
        config.noise_factor,
    )
}

fn default_external_pool() -> Result<Ipv4Network> {
    DEFAULT_EXTERNAL_CIDR.parse().map_err(SynthError::from)
}

/// Parse a CIDR list, falling back to the default external pool when empty.
fn parse_pools(cidrs: &[String]) -> Result<Vec<Ipv4Network>> {
    if cidrs.is_empty() {
        return Ok(vec![default_external_pool()?]);
    }
    cidrs
        .iter()
        .map(|cidr| cidr.parse().map_err(SynthError::from))
        .collect()
}

fn build_app(
    config: &AppConfig,
    scheduler: &Arc<IpScheduler>,
    master: &mut StdRng,
) -> Result<Box<dyn App>> {
    match config {
        AppConfig::Basic(c) => {
            if c.num_pods < 1 {
                return Err(SynthError::MissingParameter {
                    what: format!("app {}: NumPods must be at least 1", c.name),
                });
            }
            Ok(Box::new(BasicApp::new(
                &c.namespace,
                &c.name,
                c.num_pods,
                c.flows_per_sec,
                c.dest_port,
                build_scaler(&c.scaler),
                parse_pools(&c.source_ips)?,
                scheduler.clone(),
                child_rng(master),
            )))
        }
        AppConfig::Scaling(c) => {
            if c.flows_per_sec_pod <= 0.0 {
                return Err(SynthError::MissingParameter {
                    what: format!("app {}: FlowsPerSecPod must be positive", c.name),
                });
            }
            Ok(Box::new(ScalingApp::new(
                &c.namespace,
                &c.name,
                c.num_pods,
                c.flows_per_sec,
                c.flows_per_sec_pod,
                c.threshold,
                c.dest_port,
                build_scaler(&c.scaler),
                parse_pools(&c.source_ips)?,
                scheduler.clone(),
                child_rng(master),
            )))
        }
        AppConfig::MultiService(c) => {
            let mut specs = Vec::with_capacity(c.services.len());
            for service in &c.services {
                let mut edges = Vec::with_capacity(service.edges.len());
                for edge in &service.edges {
                    let target = match (&edge.service, edge.external_ips.is_empty()) {
                        (Some(name), true) => EdgeTarget::Service(name.clone()),
                        (None, false) => EdgeTarget::External {
                            pools: parse_pools(&edge.external_ips)?,
                            port: edge.external_port,
                        },
                        _ => {
                            return Err(SynthError::Config(format!(
                                "service {}: an edge must name either a Service or ExternalIps",
                                service.name
                            )))
                        }
                    };
                    edges.push(ServiceEdge {
                        target,
                        weight: edge.weight,
                        constant_rate: edge.constant_rate,
                    });
                }
                specs.push(ServiceSpec {
                    name: service.name.clone(),
                    port: service.port,
                    fps_per_pod: service.flows_per_sec_pod,
                    threshold: service.threshold,
                    ingress_fps: service.ingress_flows_per_sec,
                    scaler: build_scaler(&service.scaler),
                    ingress_pools: parse_pools(&service.ingress_source_ips)?,
                    edges,
                });
            }
            Ok(Box::new(MultiServiceApp::new(
                &c.namespace,
                specs,
                scheduler.clone(),
                child_rng(master),
            )?))
        }
        AppConfig::WrappedApp(c) => {
            let base = build_app(&c.app, scheduler, master)?;
            let mut events = Vec::with_capacity(c.events.len());
            for event in &c.events {
                events.push(build_event(event)?);
            }
            Ok(Box::new(WrappedApp::new(base, events, child_rng(master))))
        }
    }
}

fn build_event(config: &EventConfig) -> Result<Event> {
    let external_pool = default_external_pool()?;
    let (at, service, shape) = match config {
        EventConfig::PortScan(c) => (&c.at, &c.service, EventShape::PortScan),
        EventConfig::IpSweep(c) => (&c.at, &c.service, EventShape::IpSweep),
        EventConfig::ConnectionSpike(c) => (
            &c.at,
            &c.service,
            EventShape::ConnectionSpike {
                port: c.port,
                num_flows: c.num_flows,
            },
        ),
        EventConfig::BytesAnomaly(c) => (
            &c.at,
            &c.service,
            EventShape::BytesAnomaly {
                port: c.port,
                num_flows: c.num_flows,
                bytes_in: c.bytes_in,
                bytes_out: c.bytes_out,
            },
        ),
        EventConfig::OutboundIpAnomaly(c) => (
            &c.at,
            &c.service,
            EventShape::OutboundIpAnomaly {
                port: c.port,
                num_flows: c.num_flows,
                pools: parse_pools(&c.ips)?,
            },
        ),
    };

    Ok(Event {
        at: parse_time(at)?,
        service: service.clone(),
        external_pool,
        shape,
    })
}

fn build_output(config: &OutputConfig) -> Box<dyn Output> {
    match config {
        OutputConfig::Json(c) => Box::new(FileOutput::new(c.path.clone().into())),
        OutputConfig::Stdout => Box::new(StdoutOutput::new()),
        OutputConfig::Elastic(c) => Box::new(ElasticOutput::new(
            c.url.clone(),
            c.index_prefix.clone(),
            c.workers,
            c.flush_bytes,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml(body: &str) -> String {
        format!(
            r#"
NumNodes: 2
PodNetwork: 10.10.1.0/25
StartTime: 2010-01-03 00:00:00
EndTime: 2010-01-03 01:00:00
Seed: 1
{body}
"#
        )
    }

    #[test]
    fn test_build_full_run() {
        let yaml = base_yaml(
            r#"
Apps:
  - Type: Basic
    Spec:
      Name: web
      NumPods: 2
      FlowsPerSec: 1.0
      DestPort: 80
"#,
        );
        let config = SynthConfig::from_yaml(&yaml).unwrap();
        let (_, start, end) = build(&config).unwrap();
        assert_eq!((end - start).num_minutes(), 60);
    }

    #[test]
    fn test_bad_pod_network_is_fatal() {
        let yaml = base_yaml("").replace("10.10.1.0/25", "not-a-cidr");
        let config = SynthConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(
            build(&config),
            Err(SynthError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_start_must_precede_end() {
        let yaml = base_yaml("").replace("EndTime: 2010-01-03 01:00:00", "EndTime: 2010-01-02");
        let config = SynthConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(build(&config), Err(SynthError::Config(_))));
    }

    #[test]
    fn test_zero_pods_is_rejected() {
        let yaml = base_yaml(
            r#"
Apps:
  - Type: Basic
    Spec:
      Name: web
      NumPods: 0
      FlowsPerSec: 1.0
      DestPort: 80
"#,
        );
        let config = SynthConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(
            build(&config),
            Err(SynthError::MissingParameter { .. })
        ));
    }

    #[test]
    fn test_cyclic_graph_is_rejected_at_build() {
        let yaml = base_yaml(
            r#"
Apps:
  - Type: MultiService
    Spec:
      Services:
        - Name: a
          Port: 80
          FlowsPerSecPod: 10
          Edges:
            - Service: b
              Weight: 1.0
        - Name: b
          Port: 81
          FlowsPerSecPod: 10
          Edges:
            - Service: a
              Weight: 1.0
"#,
        );
        let config = SynthConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(
            build(&config),
            Err(SynthError::CyclicServiceGraph { .. })
        ));
    }

    #[test]
    fn test_edge_must_pick_one_target() {
        let yaml = base_yaml(
            r#"
Apps:
  - Type: MultiService
    Spec:
      Services:
        - Name: a
          Port: 80
          FlowsPerSecPod: 10
          Edges:
            - Weight: 1.0
"#,
        );
        let config = SynthConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(build(&config), Err(SynthError::Config(_))));
    }
}
