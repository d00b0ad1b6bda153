//! Traffic-generating applications
//!
//! Every app implements `App`: once per window the synthesizer asks it to
//! emit flow updates into the per-node channels. Each logical flow is a
//! report immediately followed by an expire, so it starts and completes
//! within the window. Apps that can be wrapped by the event layer also hand
//! out a victim pod by service name.

pub mod basic;
pub mod events;
pub mod multiservice;
pub mod scaling;
pub mod wrapped;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use ipnetwork::Ipv4Network;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::mpsc;

use flowsynth_common::{FlowMeta, FlowUpdate, Pod, ReportedStats};

use crate::error::{Result, SynthError};
use crate::ipam::IpScheduler;

pub use basic::BasicApp;
pub use multiservice::{EdgeTarget, MultiServiceApp, ServiceEdge, ServiceSpec};
pub use scaling::ScalingApp;
pub use wrapped::WrappedApp;

/// One update channel per simulated node, keyed by node name.
pub type NodeChannels = HashMap<String, mpsc::Sender<FlowUpdate>>;

/// Default pool external source addresses are drawn from.
pub const DEFAULT_EXTERNAL_CIDR: &str = "35.32.0.0/16";

/// Upper bound (exclusive) for default packet and byte counts.
const DEFAULT_MAX_COUNT: u64 = 2000;

const EPHEMERAL_PORT_FIRST: u16 = 32768;
const EPHEMERAL_PORT_LAST: u16 = 60999;

/// A traffic generator driven once per window.
#[async_trait]
pub trait App: Send {
    /// Emit this window's flow updates into the per-node channels.
    async fn generate(
        &mut self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        channels: &NodeChannels,
    ) -> Result<()>;

    /// Return a pod of the named service. Apps without services return any
    /// pod and ignore the name.
    fn pod_by_service(&mut self, service: &str) -> Option<Pod>;
}

/// Ephemeral source ports handed out round-robin so that in-window tuples
/// stay distinct.
#[derive(Debug, Clone)]
pub(crate) struct EphemeralPorts {
    next: u16,
}

impl EphemeralPorts {
    pub(crate) fn new() -> Self {
        Self {
            next: EPHEMERAL_PORT_FIRST,
        }
    }

    pub(crate) fn next(&mut self) -> i32 {
        let port = self.next;
        self.next = if port >= EPHEMERAL_PORT_LAST {
            EPHEMERAL_PORT_FIRST
        } else {
            port + 1
        };
        i32::from(port)
    }
}

/// Uniform packet and byte counts in `[1, DEFAULT_MAX_COUNT)`.
pub(crate) fn sample_stats(rng: &mut StdRng) -> ReportedStats {
    ReportedStats {
        packets_in: rng.gen_range(1..DEFAULT_MAX_COUNT),
        packets_out: rng.gen_range(1..DEFAULT_MAX_COUNT),
        bytes_in: rng.gen_range(1..DEFAULT_MAX_COUNT),
        bytes_out: rng.gen_range(1..DEFAULT_MAX_COUNT),
        ..ReportedStats::default()
    }
}

/// A uniformly random address from one of the pools.
pub(crate) fn random_addr(pools: &[Ipv4Network], rng: &mut StdRng) -> IpAddr {
    let pool = pools[rng.gen_range(0..pools.len())];
    let idx = rng.gen_range(0..pool.size());
    IpAddr::V4(pool.nth(idx).unwrap_or_else(|| pool.ip()))
}

/// A random source port from the ephemeral range.
pub(crate) fn random_source_port(rng: &mut StdRng) -> i32 {
    i32::from(rng.gen_range(EPHEMERAL_PORT_FIRST..=EPHEMERAL_PORT_LAST))
}

/// Send the report/expire pair for one completed-in-window flow to the
/// given node's channel.
pub(crate) async fn send_flow(
    channels: &NodeChannels,
    node: &str,
    meta: FlowMeta,
    stats: ReportedStats,
) -> Result<()> {
    let tx = channels.get(node).ok_or_else(|| SynthError::ChannelClosed {
        node: node.to_string(),
    })?;

    tx.send(FlowUpdate::report(meta.clone(), stats))
        .await
        .map_err(|_| SynthError::ChannelClosed {
            node: node.to_string(),
        })?;
    tx.send(FlowUpdate::expire(meta))
        .await
        .map_err(|_| SynthError::ChannelClosed {
            node: node.to_string(),
        })?;

    Ok(())
}

/// A set of live pods owned by one app or service, with threshold-based
/// sizing against the IP scheduler.
pub(crate) struct PodSet {
    namespace: String,
    prefix: String,
    pods: Vec<Pod>,
}

impl PodSet {
    pub(crate) fn new(namespace: &str, prefix: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
            pods: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pods.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Allocate pods until the set holds `count`.
    pub(crate) fn ensure(
        &mut self,
        count: usize,
        scheduler: &Arc<IpScheduler>,
        rng: &mut StdRng,
    ) -> Result<()> {
        while self.pods.len() < count {
            self.pods
                .push(scheduler.create_pod(&self.namespace, &self.prefix, rng)?);
        }
        Ok(())
    }

    /// Threshold-based sizing: grow when the load ratio exceeds
    /// `1 + threshold`, shrink below `1 - threshold`, never below one pod.
    pub(crate) fn resize(
        &mut self,
        target_fps: f64,
        fps_per_pod: f64,
        threshold: f64,
        scheduler: &Arc<IpScheduler>,
        rng: &mut StdRng,
    ) -> Result<()> {
        let current = self.pods.len();
        let target = target_fps / fps_per_pod;
        let ratio = target / current as f64;
        let sized = target.floor() as usize;

        if ratio > 1.0 + threshold && sized > current {
            self.ensure(sized, scheduler, rng)?;
        } else if ratio < 1.0 - threshold && sized < current {
            let keep = sized.max(1);
            while self.pods.len() > keep {
                let idx = rng.gen_range(0..self.pods.len());
                let pod = self.pods.swap_remove(idx);
                scheduler.release_pod(&pod);
            }
        }

        Ok(())
    }

    /// A uniformly random live pod.
    pub(crate) fn random(&self, rng: &mut StdRng) -> Option<Pod> {
        if self.pods.is_empty() {
            return None;
        }
        Some(self.pods[rng.gen_range(0..self.pods.len())].clone())
    }
}

/// Whole seconds covered by the window.
pub(crate) fn window_seconds(start: DateTime<Local>, end: DateTime<Local>) -> f64 {
    (end - start).num_seconds() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_ephemeral_ports_wrap() {
        let mut ports = EphemeralPorts::new();
        assert_eq!(ports.next(), i32::from(EPHEMERAL_PORT_FIRST));
        ports.next = EPHEMERAL_PORT_LAST;
        assert_eq!(ports.next(), i32::from(EPHEMERAL_PORT_LAST));
        assert_eq!(ports.next(), i32::from(EPHEMERAL_PORT_FIRST));
    }

    #[test]
    fn test_random_addr_stays_in_pool() {
        let mut rng = StdRng::seed_from_u64(3);
        let pool: Ipv4Network = "203.0.113.0/24".parse().unwrap();
        for _ in 0..100 {
            match random_addr(&[pool], &mut rng) {
                IpAddr::V4(v4) => assert!(pool.contains(v4)),
                IpAddr::V6(_) => panic!("expected IPv4"),
            }
        }
    }

    #[test]
    fn test_sample_stats_in_range() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..100 {
            let stats = sample_stats(&mut rng);
            for v in [
                stats.packets_in,
                stats.packets_out,
                stats.bytes_in,
                stats.bytes_out,
            ] {
                assert!((1..DEFAULT_MAX_COUNT).contains(&v));
            }
        }
    }
}
