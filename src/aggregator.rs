//! Flow aggregator: collapses raw flow updates into per-key flow specs
//!
//! One aggregator exists per (node, action). The aggregation kind selects
//! how much of the flow meta survives into the map key; the action filter
//! drops updates for the other action. At window boundaries `get` emits one
//! flow log per key, evicts keys with no active flows, and resets the rest.

use std::collections::HashMap;

use chrono::{DateTime, Local};

use flowsynth_common::{
    FlowAction, FlowLog, FlowMeta, FlowSpec, FlowUpdate, FIELD_NOT_INCLUDED,
};

/// How much of the flow meta survives into the aggregation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationKind {
    /// Key is the flow meta verbatim.
    Default,
    /// Collapse ephemeral source-port variation.
    SourcePort,
    /// Aggregate at the workload-prefix level: no addresses, no source
    /// port, no endpoint names.
    PrefixName,
}

impl AggregationKind {
    fn project(&self, meta: &FlowMeta) -> FlowMeta {
        let mut key = meta.clone();
        match self {
            AggregationKind::Default => {}
            AggregationKind::SourcePort => {
                key.tuple = key.tuple.without_source_port();
            }
            AggregationKind::PrefixName => {
                key.tuple = key.tuple.without_source_port().without_addresses();
                key.src_meta.name = FIELD_NOT_INCLUDED.to_string();
                key.dst_meta.name = FIELD_NOT_INCLUDED.to_string();
            }
        }
        key
    }
}

/// Per-(node, action) table mapping aggregation keys to flow specs.
pub struct FlowAggregator {
    kind: AggregationKind,
    action: Option<FlowAction>,
    with_labels: bool,
    with_policies: bool,
    flows: HashMap<FlowMeta, FlowSpec>,
}

impl FlowAggregator {
    pub fn new(kind: AggregationKind) -> Self {
        Self {
            kind,
            action: None,
            with_labels: false,
            with_policies: false,
            flows: HashMap::new(),
        }
    }

    /// Only accept updates with this action.
    pub fn with_action(mut self, action: FlowAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Include aggregated labels in emitted logs.
    pub fn include_labels(mut self) -> Self {
        self.with_labels = true;
        self
    }

    /// Include aggregated policies in emitted logs.
    pub fn include_policies(mut self) -> Self {
        self.with_policies = true;
        self
    }

    /// Fold one update into the table.
    pub fn feed_update(&mut self, update: &FlowUpdate) {
        if let Some(action) = self.action {
            if update.meta.action != action {
                return;
            }
        }

        let key = self.kind.project(&update.meta);
        match self.flows.get_mut(&key) {
            Some(spec) => spec.aggregate(update),
            None => {
                self.flows.insert(key, FlowSpec::from_update(update));
            }
        }
    }

    /// Emit one flow log per key for the window, then evict keys with no
    /// active flows and reset the rest. The host field is left for the
    /// caller to stamp.
    pub fn get(&mut self, start: DateTime<Local>, end: DateTime<Local>) -> Vec<FlowLog> {
        let logs = self
            .flows
            .iter()
            .map(|(key, spec)| FlowLog {
                meta: key.clone(),
                labels: self.with_labels.then(|| spec.labels.clone()),
                policies: self.with_policies.then(|| spec.policies.clone()),
                stats: spec.stats.clone(),
                start_time: start.timestamp(),
                end_time: end.timestamp(),
                host: String::new(),
            })
            .collect();

        self.flows.retain(|_, spec| {
            if spec.active_count() == 0 {
                false
            } else {
                spec.reset();
                true
            }
        });

        logs
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
