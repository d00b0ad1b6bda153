//! Flow lifecycle updates and the aggregated per-key flow spec
//!
//! A `FlowSpec` collapses a stream of `FlowUpdate` values that share an
//! aggregation key into one set of counters plus tuple reference sets that
//! track which flows started, completed, or stayed active in the window.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use crate::tuple::{FlowMeta, FlowTuple, RESERVED_LABEL_PREFIX};

/// Lifecycle event kind for a single flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Announces (or re-announces) an active flow.
    Report,
    /// Announces termination of a flow.
    Expire,
}

/// Counters reported for an aggregated flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportedStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub http_requests_allowed_in: u64,
    pub http_requests_denied_in: u64,
    pub num_flows: u64,
    pub num_flows_started: u64,
    pub num_flows_completed: u64,
}

impl ReportedStats {
    /// Add the traffic counters from `other`. The `num_flows*` fields are
    /// derived from the reference sets, never accumulated.
    fn accumulate(&mut self, other: &ReportedStats) {
        self.packets_in += other.packets_in;
        self.packets_out += other.packets_out;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.http_requests_allowed_in += other.http_requests_allowed_in;
        self.http_requests_denied_in += other.http_requests_denied_in;
    }
}

/// Source and destination label maps carried by a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowLabels {
    pub src: BTreeMap<String, String>,
    pub dst: BTreeMap<String, String>,
}

impl FlowLabels {
    /// Keep only keys present in both with equal values. Reserved keys are
    /// dropped from the result.
    fn intersect(&mut self, other: &FlowLabels) {
        self.src
            .retain(|k, v| !is_reserved(k) && other.src.get(k) == Some(v));
        self.dst
            .retain(|k, v| !is_reserved(k) && other.dst.get(k) == Some(v));
    }

    /// Drop reserved keys in place.
    fn strip_reserved(&mut self) {
        self.src.retain(|k, _| !is_reserved(k));
        self.dst.retain(|k, _| !is_reserved(k));
    }
}

fn is_reserved(key: &str) -> bool {
    key.starts_with(RESERVED_LABEL_PREFIX)
}

/// Opaque policy identifier strings attached to a flow.
pub type FlowPolicies = BTreeSet<String>;

/// A single lifecycle event for a flow, produced by an app and consumed by
/// an aggregator.
#[derive(Debug, Clone)]
pub struct FlowUpdate {
    pub meta: FlowMeta,
    pub labels: FlowLabels,
    pub policies: FlowPolicies,
    pub stats: ReportedStats,
    pub kind: UpdateKind,
}

impl FlowUpdate {
    pub fn report(meta: FlowMeta, stats: ReportedStats) -> Self {
        Self {
            meta,
            labels: FlowLabels::default(),
            policies: FlowPolicies::new(),
            stats,
            kind: UpdateKind::Report,
        }
    }

    pub fn expire(meta: FlowMeta) -> Self {
        Self {
            meta,
            labels: FlowLabels::default(),
            policies: FlowPolicies::new(),
            stats: ReportedStats::default(),
            kind: UpdateKind::Expire,
        }
    }
}

/// Aggregated state for one aggregation key.
#[derive(Debug, Clone, Default)]
pub struct FlowSpec {
    pub labels: FlowLabels,
    pub policies: FlowPolicies,
    pub stats: ReportedStats,
    refs_active: HashSet<FlowTuple>,
    refs_started: HashSet<FlowTuple>,
    refs_completed: HashSet<FlowTuple>,
    refs_ever: HashSet<FlowTuple>,
}

impl FlowSpec {
    /// Seed a new spec from the first update for a key.
    pub fn from_update(update: &FlowUpdate) -> Self {
        let mut labels = update.labels.clone();
        labels.strip_reserved();
        let mut spec = Self {
            labels,
            policies: update.policies.clone(),
            ..Self::default()
        };
        spec.apply(update);
        spec
    }

    /// Fold a subsequent update for the same key into this spec.
    pub fn aggregate(&mut self, update: &FlowUpdate) {
        self.labels.intersect(&update.labels);
        self.policies.extend(update.policies.iter().cloned());
        self.apply(update);
    }

    fn apply(&mut self, update: &FlowUpdate) {
        let tuple = update.meta.tuple;
        match update.kind {
            UpdateKind::Report => {
                if self.refs_active.insert(tuple) {
                    self.refs_started.insert(tuple);
                }
            }
            UpdateKind::Expire => {
                // An expire for a tuple never reported still records a
                // completion.
                self.refs_completed.insert(tuple);
                self.refs_active.remove(&tuple);
            }
        }
        self.refs_ever.insert(tuple);

        self.stats.accumulate(&update.stats);
        self.stats.num_flows = self.refs_ever.len() as u64;
        self.stats.num_flows_started = self.refs_started.len() as u64;
        self.stats.num_flows_completed = self.refs_completed.len() as u64;
    }

    /// Carry long-lived flows into the next window without re-reporting
    /// their start: still-active tuples become the new "ever" set and all
    /// counters reset.
    pub fn reset(&mut self) {
        self.refs_ever = self.refs_active.clone();
        self.refs_started.clear();
        self.refs_completed.clear();
        self.stats = ReportedStats {
            num_flows: self.refs_ever.len() as u64,
            ..ReportedStats::default()
        };
    }

    /// Number of flows still active at the end of the window.
    pub fn active_count(&self) -> usize {
        self.refs_active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{EndpointMetadata, FlowAction, FlowReporter, PROTO_TCP};
    use std::net::Ipv4Addr;

    fn meta(sport: i32) -> FlowMeta {
        FlowMeta {
            tuple: FlowTuple::new(
                Ipv4Addr::new(35, 32, 0, 1).into(),
                Ipv4Addr::new(10, 10, 1, 5).into(),
                PROTO_TCP,
                sport,
                80,
            ),
            src_meta: EndpointMetadata::public_net(),
            dst_meta: EndpointMetadata::workload("default", "nginx-abcde", "nginx-*"),
            action: FlowAction::Allow,
            reporter: FlowReporter::Dst,
        }
    }

    fn stats(bytes_in: u64) -> ReportedStats {
        ReportedStats {
            packets_in: 1,
            bytes_in,
            ..ReportedStats::default()
        }
    }

    #[test]
    fn test_report_then_expire_counts_one_completed_flow() {
        let report = FlowUpdate::report(meta(40000), stats(100));
        let mut spec = FlowSpec::from_update(&report);
        spec.aggregate(&FlowUpdate::expire(meta(40000)));

        assert_eq!(spec.stats.num_flows, 1);
        assert_eq!(spec.stats.num_flows_started, 1);
        assert_eq!(spec.stats.num_flows_completed, 1);
        assert_eq!(spec.stats.bytes_in, 100);
        assert_eq!(spec.active_count(), 0);
    }

    #[test]
    fn test_re_report_does_not_double_count_start() {
        let mut spec = FlowSpec::from_update(&FlowUpdate::report(meta(40000), stats(10)));
        spec.aggregate(&FlowUpdate::report(meta(40000), stats(20)));

        assert_eq!(spec.stats.num_flows, 1);
        assert_eq!(spec.stats.num_flows_started, 1);
        assert_eq!(spec.stats.bytes_in, 30);
        assert_eq!(spec.active_count(), 1);
    }

    #[test]
    fn test_expire_without_report_is_tolerated() {
        let spec = FlowSpec::from_update(&FlowUpdate::expire(meta(40000)));
        assert_eq!(spec.stats.num_flows, 1);
        assert_eq!(spec.stats.num_flows_started, 0);
        assert_eq!(spec.stats.num_flows_completed, 1);
        assert_eq!(spec.active_count(), 0);
    }

    #[test]
    fn test_started_and_completed_never_exceed_num_flows() {
        let mut spec = FlowSpec::from_update(&FlowUpdate::report(meta(40000), stats(1)));
        for sport in 40001..40010 {
            spec.aggregate(&FlowUpdate::report(meta(sport), stats(1)));
            spec.aggregate(&FlowUpdate::expire(meta(sport)));
        }
        assert!(spec.stats.num_flows_started <= spec.stats.num_flows);
        assert!(spec.stats.num_flows_completed <= spec.stats.num_flows);
    }

    #[test]
    fn test_reset_carries_active_flows_forward() {
        let mut spec = FlowSpec::from_update(&FlowUpdate::report(meta(40000), stats(50)));
        spec.aggregate(&FlowUpdate::report(meta(40001), stats(50)));
        spec.aggregate(&FlowUpdate::expire(meta(40001)));

        spec.reset();

        assert_eq!(spec.stats.num_flows, 1);
        assert_eq!(spec.stats.num_flows_started, 0);
        assert_eq!(spec.stats.num_flows_completed, 0);
        assert_eq!(spec.stats.bytes_in, 0);
        assert_eq!(spec.active_count(), 1);
    }

    #[test]
    fn test_label_intersection_law() {
        let mk = |pairs: &[(&str, &str)]| {
            let mut m = BTreeMap::new();
            for (k, v) in pairs {
                m.insert(k.to_string(), v.to_string());
            }
            m
        };

        let mut first = FlowUpdate::report(meta(40000), stats(1));
        first.labels.src = mk(&[
            ("app", "web"),
            ("tier", "frontend"),
            ("projectcalico.org/orchestrator", "k8s"),
        ]);
        let mut spec = FlowSpec::from_update(&first);

        let mut second = FlowUpdate::report(meta(40001), stats(1));
        second.labels.src = mk(&[("app", "web"), ("tier", "backend")]);
        spec.aggregate(&second);

        assert_eq!(spec.labels.src, mk(&[("app", "web")]));
    }
}
