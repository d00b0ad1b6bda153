//! Pod identity records handed out by the IP scheduler

use std::net::IpAddr;

use crate::tuple::EndpointMetadata;

/// A named endpoint with an IP, placed on exactly one simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub aggr_name: String,
    pub namespace: String,
    pub node: String,
    pub ip: IpAddr,
}

impl Pod {
    /// The endpoint metadata this pod contributes to a flow.
    pub fn endpoint(&self) -> EndpointMetadata {
        EndpointMetadata::workload(&self.namespace, &self.name, &self.aggr_name)
    }
}
