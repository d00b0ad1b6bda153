//! Basic app: a fixed pod population receiving external ingress traffic

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use ipnetwork::Ipv4Network;
use rand::rngs::StdRng;

use flowsynth_common::{
    EndpointMetadata, FlowAction, FlowMeta, FlowReporter, FlowTuple, Pod, PROTO_TCP,
};

use crate::apps::{
    random_addr, sample_stats, send_flow, window_seconds, App, EphemeralPorts, NodeChannels,
    PodSet,
};
use crate::error::Result;
use crate::ipam::IpScheduler;
use crate::scaler::Scaler;

/// Keeps a fixed number of pods and reports inbound flows from random
/// external sources, scaled by its scaler.
pub struct BasicApp {
    num_pods: usize,
    fps: f64,
    dest_port: u16,
    scaler: Scaler,
    source_pools: Vec<Ipv4Network>,
    scheduler: Arc<IpScheduler>,
    rng: StdRng,
    ports: EphemeralPorts,
    pods: PodSet,
}

impl BasicApp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: &str,
        name: &str,
        num_pods: usize,
        fps: f64,
        dest_port: u16,
        scaler: Scaler,
        source_pools: Vec<Ipv4Network>,
        scheduler: Arc<IpScheduler>,
        rng: StdRng,
    ) -> Self {
        Self {
            num_pods,
            fps,
            dest_port,
            scaler,
            source_pools,
            scheduler,
            rng,
            ports: EphemeralPorts::new(),
            pods: PodSet::new(namespace, name),
        }
    }

    /// Number of live pods (zero until the first window).
    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }
}

#[async_trait]
impl App for BasicApp {
    async fn generate(
        &mut self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        channels: &NodeChannels,
    ) -> Result<()> {
        if self.pods.is_empty() {
            self.pods
                .ensure(self.num_pods, &self.scheduler, &mut self.rng)?;
        }

        let scale = self.scaler.scale(start, &mut self.rng);
        let count = (window_seconds(start, end) * self.fps * scale).floor() as u64;

        for _ in 0..count {
            let pod = match self.pods.random(&mut self.rng) {
                Some(pod) => pod,
                None => break,
            };
            let src = random_addr(&self.source_pools, &mut self.rng);
            let meta = FlowMeta {
                tuple: FlowTuple::new(
                    src,
                    pod.ip,
                    PROTO_TCP,
                    self.ports.next(),
                    i32::from(self.dest_port),
                ),
                src_meta: EndpointMetadata::public_net(),
                dst_meta: pod.endpoint(),
                action: FlowAction::Allow,
                reporter: FlowReporter::Dst,
            };
            let stats = sample_stats(&mut self.rng);
            send_flow(channels, &pod.node, meta, stats).await?;
        }

        Ok(())
    }

    fn pod_by_service(&mut self, _service: &str) -> Option<Pod> {
        self.pods.random(&mut self.rng)
    }
}
