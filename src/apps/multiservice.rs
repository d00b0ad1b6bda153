//! Multi-service app: a directed acyclic graph of services
//!
//! Ingress traffic enters at services with a positive baseline rate and
//! propagates along weighted edges to other services in the same app or to
//! external targets. The graph is topologically sorted at construction and
//! cycles are rejected; every per-window pass iterates in topo order, so
//! propagation never recurses.

use std::collections::HashMap;
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
use crate::error::{Result, SynthError};
use crate::ipam::IpScheduler;
use crate::scaler::Scaler;

/// Construction-time description of one service.
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    pub fps_per_pod: f64,
    pub threshold: f64,
    pub ingress_fps: f64,
    pub scaler: Scaler,
    pub ingress_pools: Vec<Ipv4Network>,
    pub edges: Vec<ServiceEdge>,
}

/// An outbound edge of a service.
pub struct ServiceEdge {
    pub target: EdgeTarget,
    /// Fraction of this service's flows propagated along the edge.
    pub weight: f64,
    /// Additional constant rate in flows per second.
    pub constant_rate: f64,
}

/// Where an edge points: a sibling service or an external address range.
pub enum EdgeTarget {
    Service(String),
    External { pools: Vec<Ipv4Network>, port: u16 },
}

#[derive(Clone)]
enum ResolvedTarget {
    Service(usize),
    External { pools: Vec<Ipv4Network>, port: u16 },
}

struct ResolvedEdge {
    target: ResolvedTarget,
    weight: f64,
    constant_rate: f64,
}

struct ServiceState {
    name: String,
    port: u16,
    fps_per_pod: f64,
    threshold: f64,
    ingress_fps: f64,
    scaler: Scaler,
    ingress_pools: Vec<Ipv4Network>,
    edges: Vec<ResolvedEdge>,
    pods: PodSet,
}

/// An application made of a DAG of services.
pub struct MultiServiceApp {
    services: Vec<ServiceState>,
    /// Service indices in topological order, ingress side first.
    topo: Vec<usize>,
    scheduler: Arc<IpScheduler>,
    rng: StdRng,
    ports: EphemeralPorts,
}

impl MultiServiceApp {
    pub fn new(
        namespace: &str,
        specs: Vec<ServiceSpec>,
        scheduler: Arc<IpScheduler>,
        rng: StdRng,
    ) -> Result<Self> {
        let index: HashMap<String, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let mut services = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.fps_per_pod <= 0.0 {
                return Err(SynthError::MissingParameter {
                    what: format!("service {}: FlowsPerSecPod must be positive", spec.name),
                });
            }

            let mut edges = Vec::with_capacity(spec.edges.len());
            for edge in spec.edges {
                let target = match edge.target {
                    EdgeTarget::Service(name) => {
                        let t = *index.get(&name).ok_or(SynthError::UnknownService {
                            service: name.clone(),
                        })?;
                        ResolvedTarget::Service(t)
                    }
                    EdgeTarget::External { pools, port } => {
                        ResolvedTarget::External { pools, port }
                    }
                };
                edges.push(ResolvedEdge {
                    target,
                    weight: edge.weight,
                    constant_rate: edge.constant_rate,
                });
            }

            services.push(ServiceState {
                pods: PodSet::new(namespace, &spec.name),
                name: spec.name,
                port: spec.port,
                fps_per_pod: spec.fps_per_pod,
                threshold: spec.threshold,
                ingress_fps: spec.ingress_fps,
                scaler: spec.scaler,
                ingress_pools: spec.ingress_pools,
                edges,
            });
        }

        let topo = topo_sort(&services)?;

        Ok(Self {
            services,
            topo,
            scheduler,
            rng,
            ports: EphemeralPorts::new(),
        })
    }

    /// Number of live pods for the named service.
    pub fn pod_count(&self, service: &str) -> Option<usize> {
        self.services
            .iter()
            .find(|s| s.name == service)
            .map(|s| s.pods.len())
    }

    /// One flow pair per logical flow: a src-reported update at the source
    /// pod's node and a dst-reported one at the destination pod's node.
    async fn emit_internal(
        &mut self,
        source: usize,
        target: usize,
        count: u64,
        channels: &NodeChannels,
    ) -> Result<()> {
        let port = self.services[target].port;
        for _ in 0..count {
            let src_pod = match self.services[source].pods.random(&mut self.rng) {
                Some(pod) => pod,
                None => break,
            };
            let dst_pod = match self.services[target].pods.random(&mut self.rng) {
                Some(pod) => pod,
                None => break,
            };
            let tuple = FlowTuple::new(
                src_pod.ip,
                dst_pod.ip,
                PROTO_TCP,
                self.ports.next(),
                i32::from(port),
            );
            let stats = sample_stats(&mut self.rng);

            let src_meta = FlowMeta {
                tuple,
                src_meta: src_pod.endpoint(),
                dst_meta: dst_pod.endpoint(),
                action: FlowAction::Allow,
                reporter: FlowReporter::Src,
            };
            send_flow(channels, &src_pod.node, src_meta, stats.clone()).await?;

            let dst_meta = FlowMeta {
                tuple,
                src_meta: src_pod.endpoint(),
                dst_meta: dst_pod.endpoint(),
                action: FlowAction::Allow,
                reporter: FlowReporter::Dst,
            };
            send_flow(channels, &dst_pod.node, dst_meta, stats).await?;
        }
        Ok(())
    }

    async fn emit_external(
        &mut self,
        source: usize,
        pools: &[Ipv4Network],
        port: u16,
        count: u64,
        channels: &NodeChannels,
    ) -> Result<()> {
        for _ in 0..count {
            let pod = match self.services[source].pods.random(&mut self.rng) {
                Some(pod) => pod,
                None => break,
            };
            let dst = random_addr(pools, &mut self.rng);
            let meta = FlowMeta {
                tuple: FlowTuple::new(
                    pod.ip,
                    dst,
                    PROTO_TCP,
                    self.ports.next(),
                    i32::from(port),
                ),
                src_meta: pod.endpoint(),
                dst_meta: EndpointMetadata::public_net(),
                action: FlowAction::Allow,
                reporter: FlowReporter::Src,
            };
            let stats = sample_stats(&mut self.rng);
            send_flow(channels, &pod.node, meta, stats).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl App for MultiServiceApp {
    async fn generate(
        &mut self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        channels: &NodeChannels,
    ) -> Result<()> {
        let n = self.services.len();
        let delta = window_seconds(start, end);

        // Per-window intensity, then offered load per service: ingress
        // baselines enter, edge constants land on their targets, and the
        // accumulated rate propagates down the DAG by edge weight.
        let mut scales = vec![0.0; n];
        let mut fps = vec![0.0; n];
        for i in 0..n {
            if self.services[i].ingress_fps > 0.0 {
                scales[i] = self.services[i].scaler.scale(start, &mut self.rng);
                fps[i] += self.services[i].ingress_fps * scales[i];
            }
        }
        for i in 0..n {
            for edge in &self.services[i].edges {
                if edge.constant_rate != 0.0 {
                    if let ResolvedTarget::Service(t) = edge.target {
                        fps[t] += edge.constant_rate;
                    }
                }
            }
        }
        for &i in &self.topo {
            if fps[i] == 0.0 {
                continue;
            }
            for edge in &self.services[i].edges {
                if let ResolvedTarget::Service(t) = edge.target {
                    fps[t] += fps[i] * edge.weight;
                }
            }
        }

        // Size every service's pod population against its offered load.
        for i in 0..n {
            let fps_per_pod = self.services[i].fps_per_pod;
            let threshold = self.services[i].threshold;
            if self.services[i].pods.is_empty() {
                self.services[i].pods.ensure(1, &self.scheduler, &mut self.rng)?;
            }
            self.services[i]
                .pods
                .resize(fps[i], fps_per_pod, threshold, &self.scheduler, &mut self.rng)?;
        }

        // Ingress flows seed the per-service pending counts.
        let mut pending = vec![0u64; n];
        for i in 0..n {
            if self.services[i].ingress_fps <= 0.0 {
                continue;
            }
            let count = (delta * self.services[i].ingress_fps * scales[i]).floor() as u64;
            let port = self.services[i].port;
            for _ in 0..count {
                let pod = match self.services[i].pods.random(&mut self.rng) {
                    Some(pod) => pod,
                    None => break,
                };
                let src = random_addr(&self.services[i].ingress_pools, &mut self.rng);
                let meta = FlowMeta {
                    tuple: FlowTuple::new(
                        src,
                        pod.ip,
                        PROTO_TCP,
                        self.ports.next(),
                        i32::from(port),
                    ),
                    src_meta: EndpointMetadata::public_net(),
                    dst_meta: pod.endpoint(),
                    action: FlowAction::Allow,
                    reporter: FlowReporter::Dst,
                };
                let stats = sample_stats(&mut self.rng);
                send_flow(channels, &pod.node, meta, stats).await?;
            }
            pending[i] += count;
        }

        // Upstream propagation, one topo pass: every edge carries its
        // weighted share of the flows that arrived at its source plus its
        // constant-rate share.
        for idx in 0..self.topo.len() {
            let i = self.topo[idx];
            for e in 0..self.services[i].edges.len() {
                let (weight, constant_rate) = {
                    let edge = &self.services[i].edges[e];
                    (edge.weight, edge.constant_rate)
                };
                let count = (pending[i] as f64 * weight).floor() as u64
                    + (delta * constant_rate).floor() as u64;
                if count == 0 {
                    continue;
                }
                match self.services[i].edges[e].target.clone() {
                    ResolvedTarget::Service(t) => {
                        self.emit_internal(i, t, count, channels).await?;
                        pending[t] += count;
                    }
                    ResolvedTarget::External { pools, port } => {
                        self.emit_external(i, &pools, port, count, channels).await?;
                    }
                }
            }
        }

        Ok(())
    }

    fn pod_by_service(&mut self, service: &str) -> Option<Pod> {
        let idx = self.services.iter().position(|s| s.name == service)?;
        self.services[idx].pods.random(&mut self.rng)
    }
}

/// Kahn's algorithm over the service-to-service edges. Returns the order or
/// names a service stuck on a cycle.
fn topo_sort(services: &[ServiceState]) -> Result<Vec<usize>> {
    let n = services.len();
    let mut indegree = vec![0usize; n];
    for service in services {
        for edge in &service.edges {
            if let ResolvedTarget::Service(t) = edge.target {
                indegree[t] += 1;
            }
        }
    }

    let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = queue.pop() {
        order.push(i);
        for edge in &services[i].edges {
            if let ResolvedTarget::Service(t) = edge.target {
                indegree[t] -= 1;
                if indegree[t] == 0 {
                    queue.push(t);
                }
            }
        }
    }

    if order.len() < n {
        let stuck = (0..n)
            .find(|&i| indegree[i] > 0)
            .map(|i| services[i].name.clone())
            .unwrap_or_default();
        return Err(SynthError::CyclicServiceGraph { service: stuck });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::DEFAULT_EXTERNAL_CIDR;
    use chrono::TimeZone;
    use flowsynth_common::{FlowUpdate, UpdateKind};
    use rand::SeedableRng;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn default_pool() -> Vec<Ipv4Network> {
        vec![DEFAULT_EXTERNAL_CIDR.parse().unwrap()]
    }

    fn service(name: &str, ingress_fps: f64, edges: Vec<ServiceEdge>) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            port: 8080,
            fps_per_pod: 10.0,
            threshold: 0.5,
            ingress_fps,
            scaler: Scaler::constant(1.0),
            ingress_pools: default_pool(),
            edges,
        }
    }

    fn scheduler() -> Arc<IpScheduler> {
        Arc::new(IpScheduler::new_pooled(
            "10.30.0.0/24".parse().unwrap(),
            vec!["synth-node-00".to_string()],
        ))
    }

    #[test]
    fn test_cycle_is_rejected_at_construction() {
        let specs = vec![
            service(
                "a",
                1.0,
                vec![ServiceEdge {
                    target: EdgeTarget::Service("b".to_string()),
                    weight: 1.0,
                    constant_rate: 0.0,
                }],
            ),
            service(
                "b",
                0.0,
                vec![ServiceEdge {
                    target: EdgeTarget::Service("a".to_string()),
                    weight: 1.0,
                    constant_rate: 0.0,
                }],
            ),
        ];
        let result = MultiServiceApp::new(
            "shop",
            specs,
            scheduler(),
            StdRng::seed_from_u64(31),
        );
        assert!(matches!(
            result,
            Err(SynthError::CyclicServiceGraph { .. })
        ));
    }

    #[test]
    fn test_unknown_edge_target_is_rejected() {
        let specs = vec![service(
            "a",
            1.0,
            vec![ServiceEdge {
                target: EdgeTarget::Service("missing".to_string()),
                weight: 1.0,
                constant_rate: 0.0,
            }],
        )];
        let result = MultiServiceApp::new(
            "shop",
            specs,
            scheduler(),
            StdRng::seed_from_u64(31),
        );
        assert!(matches!(
            result,
            Err(SynthError::UnknownService { service }) if service == "missing"
        ));
    }

    #[test]
    fn test_non_positive_fps_per_pod_is_rejected() {
        let mut spec = service("a", 1.0, vec![]);
        spec.fps_per_pod = 0.0;
        let result = MultiServiceApp::new(
            "shop",
            vec![spec],
            scheduler(),
            StdRng::seed_from_u64(31),
        );
        assert!(matches!(result, Err(SynthError::MissingParameter { .. })));
    }

    #[tokio::test]
    async fn test_two_service_propagation() {
        // a receives 10 fps of ingress and forwards everything to b.
        let specs = vec![
            service(
                "a",
                10.0,
                vec![ServiceEdge {
                    target: EdgeTarget::Service("b".to_string()),
                    weight: 1.0,
                    constant_rate: 0.0,
                }],
            ),
            service("b", 0.0, vec![]),
        ];
        let mut app = MultiServiceApp::new(
            "shop",
            specs,
            scheduler(),
            StdRng::seed_from_u64(32),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(4096);
        let mut channels = HashMap::new();
        channels.insert("synth-node-00".to_string(), tx);
        let drain = tokio::spawn(async move {
            let mut updates: Vec<FlowUpdate> = Vec::new();
            while let Some(update) = rx.recv().await {
                updates.push(update);
            }
            updates
        });

        let start = Local.with_ymd_and_hms(2010, 1, 3, 0, 0, 0).single().unwrap();
        let end = start + chrono::Duration::minutes(5);
        app.generate(start, end, &channels).await.unwrap();
        drop(channels);
        let updates = drain.await.unwrap();

        // 3000 ingress pairs, plus 3000 internal flows seen by both
        // reporters (two pairs each).
        assert_eq!(updates.len(), 2 * 3000 + 4 * 3000);

        let reports: Vec<_> = updates
            .iter()
            .filter(|u| u.kind == UpdateKind::Report)
            .collect();
        let ingress = reports
            .iter()
            .filter(|u| u.meta.reporter == FlowReporter::Dst && u.meta.src_meta.name == "-")
            .count();
        let src_reported = reports
            .iter()
            .filter(|u| u.meta.reporter == FlowReporter::Src)
            .count();
        let dst_internal = reports
            .iter()
            .filter(|u| u.meta.reporter == FlowReporter::Dst && u.meta.src_meta.name != "-")
            .count();
        assert_eq!(ingress, 3000);
        assert_eq!(src_reported, 3000);
        assert_eq!(dst_internal, 3000);

        // 10 fps over 10 fps-per-pod: both services stay at one pod.
        assert_eq!(app.pod_count("a"), Some(1));
        assert_eq!(app.pod_count("b"), Some(1));
    }

    #[tokio::test]
    async fn test_constant_rate_edges_emit_without_ingress() {
        let specs = vec![
            service(
                "batch",
                0.0,
                vec![ServiceEdge {
                    target: EdgeTarget::External {
                        pools: default_pool(),
                        port: 443,
                    },
                    weight: 0.0,
                    constant_rate: 0.1,
                }],
            ),
        ];
        let mut app = MultiServiceApp::new(
            "jobs",
            specs,
            scheduler(),
            StdRng::seed_from_u64(33),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(1024);
        let mut channels = HashMap::new();
        channels.insert("synth-node-00".to_string(), tx);
        let drain = tokio::spawn(async move {
            let mut updates: Vec<FlowUpdate> = Vec::new();
            while let Some(update) = rx.recv().await {
                updates.push(update);
            }
            updates
        });

        let start = Local.with_ymd_and_hms(2010, 1, 3, 0, 0, 0).single().unwrap();
        let end = start + chrono::Duration::minutes(5);
        app.generate(start, end, &channels).await.unwrap();
        drop(channels);
        let updates = drain.await.unwrap();

        // 0.1 fps over 300 seconds: 30 outbound flows, one pair each.
        assert_eq!(updates.len(), 60);
        assert!(updates
            .iter()
            .all(|u| u.meta.reporter == FlowReporter::Src && u.meta.tuple.l4_dst == 443));
    }
}
