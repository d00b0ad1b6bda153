//! Pod IP scheduling: address allocation and round-robin node placement
//!
//! The scheduler is the single source of pod identities for the whole run.
//! Two interchangeable allocation policies exist: a monotonic counter over a
//! base address, and a CIDR pool that tracks used addresses and fails hard
//! on exhaustion. Both round-robin node assignment.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, PoisonError};

use ipnetwork::Ipv4Network;
use rand::rngs::StdRng;
use rand::Rng;

use flowsynth_common::Pod;

use crate::error::{Result, SynthError};

const POD_NAME_SUFFIX_LEN: usize = 5;
const POD_NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

enum Policy {
    /// Monotonically increasing counter over a base address; never revisits.
    Static { base: u32, next: u32 },
    /// Fixed pool with a used-set; scans from the last position and wraps.
    Pooled {
        pool: Ipv4Network,
        used: HashSet<Ipv4Addr>,
        cursor: u32,
    },
}

struct SchedulerState {
    nodes: Vec<String>,
    next_node: usize,
    policy: Policy,
}

/// Allocates pod addresses and node placements. Safe to share across apps;
/// all state sits behind one mutex.
pub struct IpScheduler {
    state: Mutex<SchedulerState>,
}

impl IpScheduler {
    /// Counter-based policy starting at `base`.
    pub fn new_static(base: Ipv4Addr, nodes: Vec<String>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                nodes,
                next_node: 0,
                policy: Policy::Static {
                    base: u32::from(base),
                    next: 0,
                },
            }),
        }
    }

    /// Pool-based policy over a fixed CIDR.
    pub fn new_pooled(pool: Ipv4Network, nodes: Vec<String>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                nodes,
                next_node: 0,
                policy: Policy::Pooled {
                    pool,
                    used: HashSet::new(),
                    cursor: 0,
                },
            }),
        }
    }

    /// Hand out the next free address and the next node in rotation.
    pub fn allocate(&self) -> Result<(IpAddr, String)> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let ip = match &mut state.policy {
            Policy::Static { base, next } => {
                let addr = Ipv4Addr::from(base.wrapping_add(*next));
                *next = next.wrapping_add(1);
                addr
            }
            Policy::Pooled { pool, used, cursor } => {
                let size = pool.size();
                let mut found = None;
                for offset in 0..size {
                    let idx = (*cursor).wrapping_add(offset) % size;
                    let candidate = match pool.nth(idx) {
                        Some(addr) => addr,
                        None => continue,
                    };
                    if used.insert(candidate) {
                        *cursor = idx.wrapping_add(1) % size;
                        found = Some(candidate);
                        break;
                    }
                }
                found.ok_or_else(|| SynthError::PoolExhausted {
                    pool: pool.to_string(),
                })?
            }
        };

        let n = state.nodes.len();
        state.next_node = (state.next_node + 1) % n;
        let node = state.nodes[state.next_node].clone();

        Ok((IpAddr::V4(ip), node))
    }

    /// Return an address to the pool. A no-op for the static policy.
    pub fn release(&self, ip: IpAddr) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Policy::Pooled { used, .. } = &mut state.policy {
            if let IpAddr::V4(v4) = ip {
                used.remove(&v4);
            }
        }
    }

    /// Allocate an address and mint a pod identity around it. Pod names get
    /// a random lowercase-alphanumeric suffix; the aggregated name is the
    /// prefix with a `-*` wildcard.
    pub fn create_pod(&self, namespace: &str, prefix: &str, rng: &mut StdRng) -> Result<Pod> {
        let (ip, node) = self.allocate()?;
        let suffix: String = (0..POD_NAME_SUFFIX_LEN)
            .map(|_| POD_NAME_ALPHABET[rng.gen_range(0..POD_NAME_ALPHABET.len())] as char)
            .collect();

        Ok(Pod {
            name: format!("{prefix}-{suffix}"),
            aggr_name: format!("{prefix}-*"),
            namespace: namespace.to_string(),
            node,
            ip,
        })
    }

    /// Release a pod's address back to the pool.
    pub fn release_pod(&self, pod: &Pod) {
        self.release(pod.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("synth-node-{i:02}")).collect()
    }

    fn pool(cidr: &str) -> Ipv4Network {
        cidr.parse().unwrap()
    }

    #[test]
    fn test_pool_containment_and_uniqueness() {
        let net = pool("10.10.1.0/28");
        let sched = IpScheduler::new_pooled(net, nodes(2));

        let mut seen = HashSet::new();
        for _ in 0..16 {
            let (ip, _) = sched.allocate().unwrap();
            let v4 = match ip {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => panic!("expected IPv4"),
            };
            assert!(net.contains(v4), "{v4} outside {net}");
            assert!(seen.insert(v4), "{v4} handed out twice");
        }
    }

    #[test]
    fn test_pool_exhaustion_fails_hard() {
        let sched = IpScheduler::new_pooled(pool("10.10.1.0/30"), nodes(1));
        for _ in 0..4 {
            sched.allocate().unwrap();
        }
        assert!(matches!(
            sched.allocate(),
            Err(SynthError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_release_makes_address_reusable() {
        let sched = IpScheduler::new_pooled(pool("10.10.1.0/30"), nodes(1));
        let mut ips = Vec::new();
        for _ in 0..4 {
            ips.push(sched.allocate().unwrap().0);
        }
        sched.release(ips[1]);
        let (ip, _) = sched.allocate().unwrap();
        assert_eq!(ip, ips[1]);
    }

    #[test]
    fn test_node_round_robin_is_even() {
        let n = 3;
        let k = 5;
        let sched = IpScheduler::new_pooled(pool("10.10.0.0/24"), nodes(n));

        let mut counts = std::collections::HashMap::new();
        for _ in 0..(k * n) {
            let (_, node) = sched.allocate().unwrap();
            *counts.entry(node).or_insert(0usize) += 1;
        }
        assert_eq!(counts.len(), n);
        assert!(counts.values().all(|&c| c == k));
    }

    #[test]
    fn test_static_policy_never_revisits() {
        let sched = IpScheduler::new_static(Ipv4Addr::new(35, 32, 0, 0), nodes(1));
        let (first, _) = sched.allocate().unwrap();
        let (second, _) = sched.allocate().unwrap();
        assert_ne!(first, second);
        assert_eq!(first, IpAddr::V4(Ipv4Addr::new(35, 32, 0, 0)));
        assert_eq!(second, IpAddr::V4(Ipv4Addr::new(35, 32, 0, 1)));
    }

    #[test]
    fn test_create_pod_identity() {
        let sched = IpScheduler::new_pooled(pool("10.10.1.0/25"), nodes(1));
        let mut rng = StdRng::seed_from_u64(7);
        let pod = sched.create_pod("default", "nginx", &mut rng).unwrap();

        assert!(pod.name.starts_with("nginx-"));
        assert_eq!(pod.name.len(), "nginx-".len() + POD_NAME_SUFFIX_LEN);
        assert_eq!(pod.aggr_name, "nginx-*");
        assert_eq!(pod.namespace, "default");
        assert_eq!(pod.node, "synth-node-00");
    }
}
