//! The window-stamped flow log record emitted to outputs

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::spec::{FlowLabels, FlowPolicies, ReportedStats};
use crate::tuple::{display_ip, FlowMeta};

/// An aggregated flow record for one (key, window, host) combination.
#[derive(Debug, Clone)]
pub struct FlowLog {
    pub meta: FlowMeta,
    pub labels: Option<FlowLabels>,
    pub policies: Option<FlowPolicies>,
    pub stats: ReportedStats,
    /// Window start, seconds since epoch.
    pub start_time: i64,
    /// Window end, seconds since epoch.
    pub end_time: i64,
    /// Simulated host that observed the flow.
    pub host: String,
}

impl FlowLog {
    /// Flatten into the serialized record shape.
    pub fn to_record(&self) -> FlowLogRecord {
        FlowLogRecord {
            start_time: self.start_time,
            end_time: self.end_time,
            action: self.meta.action.as_str().to_string(),
            reporter: self.meta.reporter.as_str().to_string(),
            source_ip: display_ip(&self.meta.tuple.src),
            dest_ip: display_ip(&self.meta.tuple.dst),
            proto: self.meta.tuple.proto,
            source_port: self.meta.tuple.l4_src,
            dest_port: self.meta.tuple.l4_dst,
            source_type: self.meta.src_meta.kind.as_str().to_string(),
            dest_type: self.meta.dst_meta.kind.as_str().to_string(),
            source_namespace: self.meta.src_meta.namespace.clone(),
            dest_namespace: self.meta.dst_meta.namespace.clone(),
            source_name: self.meta.src_meta.name.clone(),
            dest_name: self.meta.dst_meta.name.clone(),
            source_name_aggr: self.meta.src_meta.aggr_name.clone(),
            dest_name_aggr: self.meta.dst_meta.aggr_name.clone(),
            stats: self.stats.clone(),
            host: self.host.clone(),
            source_labels: self.labels.as_ref().map(|l| l.src.clone()),
            dest_labels: self.labels.as_ref().map(|l| l.dst.clone()),
            policies: self.policies.clone(),
        }
    }
}

/// The flat line-delimited record shape consumed by outputs.
#[derive(Debug, Clone, Serialize)]
pub struct FlowLogRecord {
    pub start_time: i64,
    pub end_time: i64,
    pub action: String,
    pub reporter: String,
    pub source_ip: String,
    pub dest_ip: String,
    pub proto: i32,
    pub source_port: i32,
    pub dest_port: i32,
    pub source_type: String,
    pub dest_type: String,
    pub source_namespace: String,
    pub dest_namespace: String,
    pub source_name: String,
    pub dest_name: String,
    pub source_name_aggr: String,
    pub dest_name_aggr: String,
    #[serde(flatten)]
    pub stats: ReportedStats,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policies: Option<BTreeSet<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{
        EndpointMetadata, FlowAction, FlowReporter, FlowTuple, PORT_UNSET, PROTO_TCP,
    };
    use std::net::Ipv4Addr;

    fn sample_log() -> FlowLog {
        FlowLog {
            meta: FlowMeta {
                tuple: FlowTuple::new(
                    Ipv4Addr::new(35, 32, 0, 1).into(),
                    Ipv4Addr::new(10, 10, 1, 5).into(),
                    PROTO_TCP,
                    PORT_UNSET,
                    80,
                ),
                src_meta: EndpointMetadata::public_net(),
                dst_meta: EndpointMetadata::workload("default", "nginx-abcde", "nginx-*"),
                action: FlowAction::Allow,
                reporter: FlowReporter::Dst,
            },
            labels: None,
            policies: None,
            stats: ReportedStats {
                packets_in: 3,
                bytes_in: 180,
                num_flows: 1,
                num_flows_started: 1,
                num_flows_completed: 1,
                ..ReportedStats::default()
            },
            start_time: 1262476800,
            end_time: 1262477100,
            host: "synth-node-00".to_string(),
        }
    }

    #[test]
    fn test_record_field_names() {
        let value = serde_json::to_value(sample_log().to_record()).unwrap();
        let obj = value.as_object().unwrap();

        for field in [
            "start_time",
            "end_time",
            "action",
            "reporter",
            "source_ip",
            "dest_ip",
            "proto",
            "source_port",
            "dest_port",
            "source_type",
            "dest_type",
            "source_namespace",
            "dest_namespace",
            "source_name",
            "dest_name",
            "source_name_aggr",
            "dest_name_aggr",
            "bytes_in",
            "bytes_out",
            "packets_in",
            "packets_out",
            "http_requests_allowed_in",
            "http_requests_denied_in",
            "num_flows",
            "num_flows_started",
            "num_flows_completed",
            "host",
        ] {
            assert!(obj.contains_key(field), "missing field {field}");
        }

        assert!(!obj.contains_key("source_labels"));
        assert!(!obj.contains_key("policies"));
        assert_eq!(obj["source_ip"], "35.32.0.1");
        assert_eq!(obj["dest_ip"], "10.10.1.5");
        assert_eq!(obj["action"], "allow");
        assert_eq!(obj["reporter"], "dst");
        assert_eq!(obj["source_port"], PORT_UNSET);
        assert_eq!(obj["dest_type"], "wep");
    }
}
