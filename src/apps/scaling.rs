//! Scaling app: like Basic, but the pod population tracks offered load

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

/// Recomputes its pod count at the start of every window from the offered
/// load, then emits like the basic app.
pub struct ScalingApp {
    initial_pods: usize,
    fps: f64,
    fps_per_pod: f64,
    threshold: f64,
    dest_port: u16,
    scaler: Scaler,
    source_pools: Vec<Ipv4Network>,
    scheduler: Arc<IpScheduler>,
    rng: StdRng,
    ports: EphemeralPorts,
    pods: PodSet,
}

impl ScalingApp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: &str,
        name: &str,
        initial_pods: usize,
        fps: f64,
        fps_per_pod: f64,
        threshold: f64,
        dest_port: u16,
        scaler: Scaler,
        source_pools: Vec<Ipv4Network>,
        scheduler: Arc<IpScheduler>,
        rng: StdRng,
    ) -> Self {
        Self {
            initial_pods: initial_pods.max(1),
            fps,
            fps_per_pod,
            threshold,
            dest_port,
            scaler,
            source_pools,
            scheduler,
            rng,
            ports: EphemeralPorts::new(),
            pods: PodSet::new(namespace, name),
        }
    }

    /// Number of live pods (the initial count until the first window).
    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }
}

#[async_trait]
impl App for ScalingApp {
    async fn generate(
        &mut self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        channels: &NodeChannels,
    ) -> Result<()> {
        if self.pods.is_empty() {
            self.pods
                .ensure(self.initial_pods, &self.scheduler, &mut self.rng)?;
        }

        let scale = self.scaler.scale(start, &mut self.rng);
        self.pods.resize(
            self.fps * scale,
            self.fps_per_pod,
            self.threshold,
            &self.scheduler,
            &mut self.rng,
        )?;

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
