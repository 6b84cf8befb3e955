//! Node-manager client implementation.
//!
//! This module provides the gRPC client the sequencer uses to drive node
//! managers through the workload phases. The `NodeControl` trait is the seam:
//! orchestration code only ever sees trait objects, so tests can substitute
//! in-process fakes for real channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

use crate::error::{ControlError, Result};
use crate::proto::node_manager_client::NodeManagerClient;
use crate::proto::{
    CancelTrafficRequest, CancelTrafficResult, IntroducePeersResult, NodeRegistration,
    NodeServiceConfig, RunTrafficRequest, ServiceEndpointMap, ServiceLogs,
};

/// Control RPC surface of one node manager, as seen by the sequencer.
///
/// All methods return `tonic::Status` errors so fan-out aggregation can keep
/// the worker-reported status code intact.
#[async_trait]
pub trait NodeControl: Send + Sync + std::fmt::Debug {
    /// Push the traffic description and this node's service subset.
    async fn configure_node(
        &self,
        config: NodeServiceConfig,
    ) -> std::result::Result<ServiceEndpointMap, Status>;

    /// Distribute the merged endpoint map so services can locate their peers.
    async fn introduce_peers(
        &self,
        peers: ServiceEndpointMap,
    ) -> std::result::Result<IntroducePeersResult, Status>;

    /// Start traffic generation; resolves when the workload finishes.
    async fn run_traffic(
        &self,
        request: RunTrafficRequest,
    ) -> std::result::Result<ServiceLogs, Status>;

    /// Tell the node to stop any outstanding traffic generation.
    async fn cancel_traffic(
        &self,
        request: CancelTrafficRequest,
    ) -> std::result::Result<CancelTrafficResult, Status>;
}

/// Builds a [`NodeControl`] from a node registration.
///
/// Connection is expected to be lazy: registration must not block on the
/// node being reachable, only on the endpoint being well-formed.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, registration: &NodeRegistration) -> Result<Arc<dyn NodeControl>>;
}

/// gRPC-based node-manager client.
#[derive(Debug)]
pub struct GrpcNodeControl {
    client: NodeManagerClient<Channel>,
}

impl GrpcNodeControl {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: NodeManagerClient::new(channel),
        }
    }
}

#[async_trait]
impl NodeControl for GrpcNodeControl {
    async fn configure_node(
        &self,
        config: NodeServiceConfig,
    ) -> std::result::Result<ServiceEndpointMap, Status> {
        let mut client = self.client.clone();
        let response = client.configure_node(Request::new(config)).await?;
        Ok(response.into_inner())
    }

    async fn introduce_peers(
        &self,
        peers: ServiceEndpointMap,
    ) -> std::result::Result<IntroducePeersResult, Status> {
        let mut client = self.client.clone();
        let response = client.introduce_peers(Request::new(peers)).await?;
        Ok(response.into_inner())
    }

    async fn run_traffic(
        &self,
        request: RunTrafficRequest,
    ) -> std::result::Result<ServiceLogs, Status> {
        let mut client = self.client.clone();
        let response = client.run_traffic(Request::new(request)).await?;
        Ok(response.into_inner())
    }

    async fn cancel_traffic(
        &self,
        request: CancelTrafficRequest,
    ) -> std::result::Result<CancelTrafficResult, Status> {
        let mut client = self.client.clone();
        let response = client.cancel_traffic(Request::new(request)).await?;
        Ok(response.into_inner())
    }
}

/// Production connector: one lazy HTTP/2 channel per registered node.
pub struct GrpcNodeConnector {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl GrpcNodeConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl NodeConnector for GrpcNodeConnector {
    fn connect(&self, registration: &NodeRegistration) -> Result<Arc<dyn NodeControl>> {
        let address = format!(
            "http://{}:{}",
            registration.hostname, registration.control_port
        );
        let mut endpoint = Endpoint::from_shared(address.clone())
            .map_err(|e| ControlError::endpoint(address, e))?
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }
        // connect_lazy: the channel dials on first use, so registering an
        // unreachable node succeeds and the failure shows up in the first
        // fan-out that targets it.
        let channel = endpoint.connect_lazy();
        tracing::debug!("created lazy channel to {}", endpoint.uri());
        Ok(Arc::new(GrpcNodeControl::new(channel)))
    }
}
