//! Service placement.
//!
//! Assigns every requested service instance to a worker node: manual
//! placements from the description first, then one instance per idle node.
//! Everything iterates in sorted order, so identical inputs always produce
//! the identical placement.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tonic::Status;
use tracing::debug;

use meshbench_core::node::protocol::expand_service_instances;
use meshbench_core::proto::DistributedSystemDescription;

/// node alias -> service instances it hosts. Nodes reserved for the test but
/// running no workload appear with an empty set.
pub type Placement = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("No services defined.")]
    NoServices,
    #[error("Service {0} was not found or already placed.")]
    ServiceUnknown(String),
    #[error("Node {0} was not found or not idle.")]
    NodeUnavailable(String),
    #[error("No idle node for placement of services: {0}")]
    InsufficientNodes(String),
}

impl From<PlacementError> for Status {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::NoServices => Status::invalid_argument(err.to_string()),
            _ => Status::not_found(err.to_string()),
        }
    }
}

/// Compute the placement for one test given the nodes available to it.
pub fn place_services(
    description: &DistributedSystemDescription,
    mut idle_nodes: BTreeSet<String>,
) -> Result<Placement, PlacementError> {
    if description.services.is_empty() {
        return Err(PlacementError::NoServices);
    }

    let mut unplaced = expand_service_instances(description);
    let mut placement = Placement::new();

    // Manual placements consume their instances and reserve their node.
    let bundles: BTreeMap<_, _> = description.node_service_bundles.iter().collect();
    for (alias, bundle) in bundles {
        for service in &bundle.services {
            if !unplaced.remove(service) {
                return Err(PlacementError::ServiceUnknown(service.clone()));
            }
            placement
                .entry(alias.clone())
                .or_default()
                .insert(service.clone());
        }
        if !idle_nodes.remove(alias) {
            return Err(PlacementError::NodeUnavailable(alias.clone()));
        }
    }

    if unplaced.is_empty() {
        debug!("all services placed manually");
    } else {
        debug!("{} services left to place after manual assignment", unplaced.len());
    }

    // Auto-place what remains, lowest instance name onto lowest alias.
    let mut failures = Vec::new();
    for service in unplaced {
        match idle_nodes.pop_first() {
            Some(alias) => {
                debug!("placed service '{}' on {}", service, alias);
                placement.entry(alias).or_default().insert(service);
            }
            None => failures.push(service),
        }
    }
    if !failures.is_empty() {
        return Err(PlacementError::InsufficientNodes(failures.join(", ")));
    }

    // Leftover idle nodes still participate in the test.
    for alias in idle_nodes {
        placement.entry(alias).or_default();
    }

    Ok(placement)
}
