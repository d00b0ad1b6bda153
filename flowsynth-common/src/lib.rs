//! Shared flow data model for flowsynth
//!
//! This crate defines the record types that flow through the whole pipeline:
//! - The immutable 5-tuple and endpoint metadata that identify a flow
//! - Lifecycle updates (report/expire) produced by traffic generators
//! - The aggregated, window-stamped flow log emitted to outputs
//!
//! Both the synthesis engine and every output sink consume these types.

pub mod log;
pub mod pod;
pub mod spec;
pub mod tuple;

pub use log::{FlowLog, FlowLogRecord};
pub use pod::Pod;
pub use spec::{FlowLabels, FlowPolicies, FlowSpec, FlowUpdate, ReportedStats, UpdateKind};
pub use tuple::{
    display_ip, mapped, EndpointKind, EndpointMetadata, FlowAction, FlowMeta, FlowReporter,
    FlowTuple, FIELD_NOT_INCLUDED, PORT_UNSET, PROTO_TCP, RESERVED_LABEL_PREFIX,
};
