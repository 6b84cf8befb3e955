//! Helpers over the shared protocol types.
//!
//! Service-instance naming, response merging for the fan-out phases, and the
//! canonical registration rendering the registry dedups on.

use std::collections::BTreeSet;

use crate::proto::{
    DistributedSystemDescription, NodeRegistration, ServiceEndpointMap, ServiceLogs,
};

/// Name of one service instance: `<server_type>/<index>`.
pub fn service_instance_name(server_type: &str, index: i32) -> String {
    format!("{}/{}", server_type, index)
}

/// Expand a description's service specs into the full set of instance names.
pub fn expand_service_instances(description: &DistributedSystemDescription) -> BTreeSet<String> {
    let mut instances = BTreeSet::new();
    for spec in &description.services {
        for index in 0..spec.count {
            instances.insert(service_instance_name(&spec.server_type, index));
        }
    }
    instances
}

/// Merge a per-node Configure response into the accumulated endpoint map.
///
/// Keys are disjoint across nodes because every service instance is placed
/// exactly once; a collision would mean a node reported an instance it was
/// never assigned, and the later entry wins.
pub fn merge_endpoint_map(into: &mut ServiceEndpointMap, from: ServiceEndpointMap) {
    into.endpoints.extend(from.endpoints);
}

/// Merge a per-node log aggregate, per instance and per peer.
pub fn merge_service_logs(into: &mut ServiceLogs, from: ServiceLogs) {
    for (instance, log) in from.instance_logs {
        let entry = into.instance_logs.entry(instance).or_default();
        for (peer, peer_log) in log.peer_logs {
            entry
                .peer_logs
                .entry(peer)
                .or_default()
                .samples
                .extend(peer_log.samples);
        }
    }
}

/// Canonical rendering of a registration, used as the dedup key for
/// idempotent re-registration. Attributes are sorted because the wire form
/// of a map field has no canonical order.
pub fn registration_key(registration: &NodeRegistration) -> String {
    let mut attributes: Vec<_> = registration.attributes.iter().collect();
    attributes.sort();
    format!(
        "{}|{}|{}|{:?}",
        registration.hostname, registration.control_port, registration.os_version, attributes
    )
}
