//! Fan-out phases.
//!
//! Each workload phase issues one RPC per selected node, in parallel, and
//! drains every in-flight call before reporting, so a failure on one node
//! never leaves another node's RPC dangling. The first observed failure is
//! the one surfaced.

use std::sync::Arc;

use tokio::task::JoinSet;
use tonic::Status;
use tracing::{debug, warn};

use meshbench_core::node::protocol::{merge_endpoint_map, merge_service_logs};
use meshbench_core::proto::{
    CancelTrafficRequest, DistributedSystemDescription, NodeServiceConfig, RunTrafficRequest,
    ServiceEndpointMap, ServiceLogs,
};

use crate::placement::Placement;
use crate::state::{Node, SequencerState};

impl SequencerState {
    /// Resolve placement aliases to live nodes under the shared lock.
    async fn select_nodes<'a>(
        &self,
        aliases: impl IntoIterator<Item = &'a String>,
    ) -> Result<Vec<(String, Arc<Node>)>, Status> {
        let inner = self.inner.read().await;
        aliases
            .into_iter()
            .map(|alias| {
                inner
                    .nodes
                    .get(alias)
                    .map(|node| (alias.clone(), node.clone()))
                    // Placements are derived from a registry snapshot and
                    // nodes are never removed, so this cannot fire.
                    .ok_or_else(|| {
                        Status::internal(format!("placement references unknown node {}", alias))
                    })
            })
            .collect()
    }

    /// Push the traffic description and per-node service subsets; merge the
    /// per-node endpoint maps each node reports back.
    pub(crate) async fn configure_nodes(
        &self,
        placement: &Placement,
        test: &DistributedSystemDescription,
    ) -> Result<ServiceEndpointMap, Status> {
        let targets = self.select_nodes(placement.keys()).await?;
        let mut rpcs = JoinSet::new();
        for (alias, node) in targets {
            let request = NodeServiceConfig {
                traffic_config: Some(test.clone()),
                services: placement
                    .get(&alias)
                    .map(|services| services.iter().cloned().collect())
                    .unwrap_or_default(),
            };
            rpcs.spawn(async move {
                let result = node.control.configure_node(request).await;
                (alias, result)
            });
        }

        let mut endpoints = ServiceEndpointMap::default();
        drain_rpcs("ConfigureNode", rpcs, |part| {
            merge_endpoint_map(&mut endpoints, part)
        })
        .await?;
        Ok(endpoints)
    }

    /// Broadcast the merged endpoint map to every participating node.
    pub(crate) async fn introduce_peers(
        &self,
        placement: &Placement,
        peers: ServiceEndpointMap,
    ) -> Result<(), Status> {
        debug!("broadcasting endpoint map with {} entries", peers.endpoints.len());
        let targets = self.select_nodes(placement.keys()).await?;
        let mut rpcs = JoinSet::new();
        for (alias, node) in targets {
            let request = peers.clone();
            rpcs.spawn(async move {
                let result = node.control.introduce_peers(request).await.map(|_| ());
                (alias, result)
            });
        }
        drain_rpcs("IntroducePeers", rpcs, |_| {}).await
    }

    /// Start traffic everywhere and merge the per-node logs. A node is
    /// non-idle exactly while its RunTraffic is outstanding, so the flag is
    /// restored on completion whether the run succeeded or not.
    pub(crate) async fn run_traffic(&self, placement: &Placement) -> Result<ServiceLogs, Status> {
        let targets = self.select_nodes(placement.keys()).await?;
        let mut rpcs = JoinSet::new();
        for (alias, node) in targets {
            node.set_idle(false);
            rpcs.spawn(async move {
                let result = node.control.run_traffic(RunTrafficRequest::default()).await;
                node.set_idle(true);
                (alias, result)
            });
        }

        let mut logs = ServiceLogs::default();
        drain_rpcs("RunTraffic", rpcs, |part| {
            merge_service_logs(&mut logs, part)
        })
        .await?;
        Ok(logs)
    }

    /// Best-effort CancelTraffic broadcast to every non-idle node. Failures
    /// are logged and the node stays non-idle for the next broadcast.
    pub(crate) async fn cancel_traffic(&self) {
        let targets: Vec<(String, Arc<Node>)> = {
            let inner = self.inner.read().await;
            inner
                .nodes
                .iter()
                .filter(|(_, node)| !node.idle())
                .map(|(alias, node)| (alias.clone(), node.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let mut rpcs = JoinSet::new();
        for (alias, node) in targets {
            debug!("node {} is busy, cancelling its traffic", alias);
            rpcs.spawn(async move {
                let result = node
                    .control
                    .cancel_traffic(CancelTrafficRequest::default())
                    .await;
                if result.is_ok() {
                    node.set_idle(true);
                }
                (alias, result)
            });
        }
        while let Some(joined) = rpcs.join_next().await {
            if let Ok((alias, Err(status))) = joined {
                warn!("failed to cancel traffic on {}: {}", alias, status);
            }
        }
    }
}

/// Await every spawned RPC, feed successful responses to `merge`, and
/// surface the first failure once the set is fully drained.
async fn drain_rpcs<T: 'static>(
    phase: &'static str,
    mut rpcs: JoinSet<(String, Result<T, Status>)>,
    mut merge: impl FnMut(T),
) -> Result<(), Status> {
    let mut first_failure: Option<(String, Status)> = None;
    while let Some(joined) = rpcs.join_next().await {
        match joined {
            Ok((_, Ok(response))) => merge(response),
            Ok((alias, Err(status))) => {
                warn!("{} on {} failed: {}", phase, alias, status);
                first_failure.get_or_insert((alias, status));
            }
            Err(join_error) => {
                first_failure
                    .get_or_insert(("local task".to_string(), Status::internal(join_error.to_string())));
            }
        }
    }
    match first_failure {
        None => Ok(()),
        Some((alias, status)) => Err(Status::invalid_argument(format!(
            "Unknown RPC error ({} on {}): {:?}: {}",
            phase,
            alias,
            status.code(),
            status.message()
        ))),
    }
}
