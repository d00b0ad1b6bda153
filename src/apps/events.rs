//! Injectable anomaly events layered onto a wrapped app
//!
//! Every event fires once, at its configured instant, against a victim pod
//! picked from the base app by service name. Each emitted flow is a
//! report/expire pair, so it counts as one completed in-window flow.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Local};
use ipnetwork::Ipv4Network;
use rand::rngs::StdRng;

use flowsynth_common::{
    EndpointMetadata, FlowAction, FlowMeta, FlowReporter, FlowTuple, Pod, ReportedStats,
    PROTO_TCP,
};

use crate::apps::{random_addr, random_source_port, sample_stats, send_flow, NodeChannels};
use crate::error::{Result, SynthError};

/// Probe size used by port scans and IP sweeps.
const PROBE_PACKETS: u64 = 1;
const PROBE_BYTES: u64 = 49;

const SCAN_PORT_LAST: u16 = 1024;
const SWEEP_PORT: u16 = 80;

/// A one-shot anomaly scheduled at a specific instant.
pub struct Event {
    pub at: DateTime<Local>,
    /// Service whose pod becomes the victim.
    pub service: String,
    /// Pool external peers are drawn from.
    pub external_pool: Ipv4Network,
    pub shape: EventShape,
}

/// The five anomaly shapes.
pub enum EventShape {
    /// The victim probes every port up to 1024 on one external address.
    PortScan,
    /// The victim probes port 80 across its own /24 neighbourhood.
    IpSweep,
    /// A burst of inbound connections to one port of the victim.
    ConnectionSpike { port: u16, num_flows: u64 },
    /// Inbound flows with explicit byte counters.
    BytesAnomaly {
        port: u16,
        num_flows: u64,
        bytes_in: u64,
        bytes_out: u64,
    },
    /// The victim opens connections to addresses it normally never talks to.
    OutboundIpAnomaly {
        port: u16,
        num_flows: u64,
        pools: Vec<Ipv4Network>,
    },
}

impl Event {
    /// True when the event instant falls inside `[start, end)`.
    pub fn due(&self, start: DateTime<Local>, end: DateTime<Local>) -> bool {
        self.at >= start && self.at < end
    }

    /// Emit the event's flows against the victim pod.
    pub async fn inject(
        &self,
        victim: &Pod,
        channels: &NodeChannels,
        rng: &mut StdRng,
    ) -> Result<()> {
        match &self.shape {
            EventShape::PortScan => self.port_scan(victim, channels, rng).await,
            EventShape::IpSweep => self.ip_sweep(victim, channels, rng).await,
            EventShape::ConnectionSpike { port, num_flows } => {
                self.inbound_burst(victim, channels, rng, *port, *num_flows, None)
                    .await
            }
            EventShape::BytesAnomaly {
                port,
                num_flows,
                bytes_in,
                bytes_out,
            } => {
                let stats = ReportedStats {
                    packets_in: 1,
                    packets_out: 1,
                    bytes_in: *bytes_in,
                    bytes_out: *bytes_out,
                    ..ReportedStats::default()
                };
                self.inbound_burst(victim, channels, rng, *port, *num_flows, Some(stats))
                    .await
            }
            EventShape::OutboundIpAnomaly {
                port,
                num_flows,
                pools,
            } => self.outbound_burst(victim, channels, rng, *port, *num_flows, pools).await,
        }
    }

    async fn port_scan(
        &self,
        victim: &Pod,
        channels: &NodeChannels,
        rng: &mut StdRng,
    ) -> Result<()> {
        let dst = random_addr(&[self.external_pool], rng);
        for port in 1..=SCAN_PORT_LAST {
            let meta = FlowMeta {
                tuple: FlowTuple::new(
                    victim.ip,
                    dst,
                    PROTO_TCP,
                    random_source_port(rng),
                    i32::from(port),
                ),
                src_meta: victim.endpoint(),
                dst_meta: EndpointMetadata::public_net(),
                action: FlowAction::Allow,
                reporter: FlowReporter::Src,
            };
            let stats = ReportedStats {
                packets_out: PROBE_PACKETS,
                bytes_out: PROBE_BYTES,
                ..ReportedStats::default()
            };
            send_flow(channels, &victim.node, meta, stats).await?;
        }
        Ok(())
    }

    async fn ip_sweep(
        &self,
        victim: &Pod,
        channels: &NodeChannels,
        rng: &mut StdRng,
    ) -> Result<()> {
        let base = match victim.ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped().ok_or_else(|| {
                SynthError::Config("IP sweep requires an IPv4 pod address".to_string())
            })?,
        };
        let octets = base.octets();

        for last in 0..=255u8 {
            if last == octets[3] {
                continue;
            }
            let dst = Ipv4Addr::new(octets[0], octets[1], octets[2], last);
            let meta = FlowMeta {
                tuple: FlowTuple::new(
                    victim.ip,
                    IpAddr::V4(dst),
                    PROTO_TCP,
                    random_source_port(rng),
                    i32::from(SWEEP_PORT),
                ),
                src_meta: victim.endpoint(),
                dst_meta: EndpointMetadata::public_net(),
                action: FlowAction::Allow,
                reporter: FlowReporter::Src,
            };
            let stats = ReportedStats {
                packets_out: PROBE_PACKETS,
                bytes_out: PROBE_BYTES,
                ..ReportedStats::default()
            };
            send_flow(channels, &victim.node, meta, stats).await?;
        }
        Ok(())
    }

    async fn inbound_burst(
        &self,
        victim: &Pod,
        channels: &NodeChannels,
        rng: &mut StdRng,
        port: u16,
        num_flows: u64,
        stats: Option<ReportedStats>,
    ) -> Result<()> {
        for _ in 0..num_flows {
            let src = random_addr(&[self.external_pool], rng);
            let meta = FlowMeta {
                tuple: FlowTuple::new(
                    src,
                    victim.ip,
                    PROTO_TCP,
                    random_source_port(rng),
                    i32::from(port),
                ),
                src_meta: EndpointMetadata::public_net(),
                dst_meta: victim.endpoint(),
                action: FlowAction::Allow,
                reporter: FlowReporter::Dst,
            };
            let stats = stats.clone().unwrap_or_else(|| sample_stats(rng));
            send_flow(channels, &victim.node, meta, stats).await?;
        }
        Ok(())
    }

    async fn outbound_burst(
        &self,
        victim: &Pod,
        channels: &NodeChannels,
        rng: &mut StdRng,
        port: u16,
        num_flows: u64,
        pools: &[Ipv4Network],
    ) -> Result<()> {
        for _ in 0..num_flows {
            let dst = random_addr(pools, rng);
            let meta = FlowMeta {
                tuple: FlowTuple::new(
                    victim.ip,
                    dst,
                    PROTO_TCP,
                    random_source_port(rng),
                    i32::from(port),
                ),
                src_meta: victim.endpoint(),
                dst_meta: EndpointMetadata::public_net(),
                action: FlowAction::Allow,
                reporter: FlowReporter::Src,
            };
            let stats = sample_stats(rng);
            send_flow(channels, &victim.node, meta, stats).await?;
        }
        Ok(())
    }
}
