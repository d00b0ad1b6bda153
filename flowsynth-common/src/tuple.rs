//! Flow identity: the 5-tuple, endpoint metadata, and flow meta key
//!
//! Addresses are canonicalised to `Ipv6Addr`; IPv4 enters as its IPv4-mapped
//! form and is rendered back as a dotted quad in output records.

use std::net::{IpAddr, Ipv6Addr};

/// L4 protocol number for TCP.
pub const PROTO_TCP: i32 = 6;

/// Sentinel source port denoting port-level aggregation.
pub const PORT_UNSET: i32 = -1;

/// Sentinel for an endpoint metadata field that is not included.
pub const FIELD_NOT_INCLUDED: &str = "-";

/// Label keys with this prefix are dropped during aggregation.
pub const RESERVED_LABEL_PREFIX: &str = "projectcalico.org/";

/// Canonicalise an address to its IPv6 form (IPv4 becomes IPv4-mapped).
pub fn mapped(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Render an address for output records: IPv4-mapped addresses come back
/// as dotted quads, everything else as IPv6 text.
pub fn display_ip(ip: &Ipv6Addr) -> String {
    match ip.to_ipv4_mapped() {
        Some(v4) => v4.to_string(),
        None => ip.to_string(),
    }
}

/// The 5-tuple identifying one unidirectional conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub proto: i32,
    pub l4_src: i32,
    pub l4_dst: i32,
}

impl FlowTuple {
    pub fn new(src: IpAddr, dst: IpAddr, proto: i32, l4_src: i32, l4_dst: i32) -> Self {
        Self {
            src: mapped(src),
            dst: mapped(dst),
            proto,
            l4_src,
            l4_dst,
        }
    }

    /// Replace the L4 source port with the unset sentinel.
    pub fn without_source_port(mut self) -> Self {
        self.l4_src = PORT_UNSET;
        self
    }

    /// Zero both addresses (prefix-level aggregation).
    pub fn without_addresses(mut self) -> Self {
        self.src = Ipv6Addr::UNSPECIFIED;
        self.dst = Ipv6Addr::UNSPECIFIED;
        self
    }
}

/// Kind of endpoint observed at one end of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Workload endpoint (a pod).
    Wep,
    /// Host endpoint.
    Hep,
    /// Network set.
    NetworkSet,
    /// Plain network address.
    Net,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Wep => "wep",
            EndpointKind::Hep => "hep",
            EndpointKind::NetworkSet => "ns",
            EndpointKind::Net => "net",
        }
    }
}

/// Metadata describing one endpoint of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointMetadata {
    pub kind: EndpointKind,
    pub namespace: String,
    pub name: String,
    pub aggr_name: String,
}

impl EndpointMetadata {
    /// A workload endpoint with full identity.
    pub fn workload(namespace: &str, name: &str, aggr_name: &str) -> Self {
        Self {
            kind: EndpointKind::Wep,
            namespace: namespace.to_string(),
            name: name.to_string(),
            aggr_name: aggr_name.to_string(),
        }
    }

    /// An address on the public internet.
    pub fn public_net() -> Self {
        Self {
            kind: EndpointKind::Net,
            namespace: FIELD_NOT_INCLUDED.to_string(),
            name: FIELD_NOT_INCLUDED.to_string(),
            aggr_name: "pub".to_string(),
        }
    }
}

/// Whether the flow was allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowAction {
    Allow,
    Deny,
}

impl FlowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowAction::Allow => "allow",
            FlowAction::Deny => "deny",
        }
    }
}

/// Which side of the conversation reported the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowReporter {
    Src,
    Dst,
}

impl FlowReporter {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowReporter::Src => "src",
            FlowReporter::Dst => "dst",
        }
    }
}

/// The full identity of a flow as seen by one reporter.
///
/// Used directly as an aggregation map key (possibly after projection).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowMeta {
    pub tuple: FlowTuple,
    pub src_meta: EndpointMetadata,
    pub dst_meta: EndpointMetadata,
    pub action: FlowAction,
    pub reporter: FlowReporter,
}
