//! Server lifecycle: bind, serve, graceful shutdown, join.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use meshbench_core::proto::test_sequencer_server::TestSequencerServer;
use meshbench_core::{ControlError, SequencerConfig};

use crate::service::TestSequencerService;
use crate::state::SequencerState;

/// A running sequencer endpoint.
pub struct SequencerServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    serve_task: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl SequencerServer {
    /// Bind `[::]:<port>` and start serving. The IPv6 wildcard accepts
    /// v4-mapped connections too; port 0 takes an ephemeral port, reported
    /// by [`local_addr`](Self::local_addr).
    pub async fn bind(
        config: &SequencerConfig,
        state: Arc<SequencerState>,
    ) -> Result<Self, ControlError> {
        let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            // Hosts with IPv6 disabled refuse the wildcard bind.
            Err(_) => {
                let v4_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
                TcpListener::bind(v4_addr)
                    .await
                    .map_err(|e| ControlError::bind(v4_addr, e))?
            }
        };
        let local_addr = listener.local_addr().map_err(|e| ControlError::bind(addr, e))?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let service = TestSequencerServer::new(TestSequencerService::new(state));
        let serve_task = tokio::spawn(
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    signal.cancelled().await;
                }),
        );

        info!("Sequencer listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            serve_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new requests; in-flight calls are allowed to drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the server to finish draining.
    pub async fn join(mut self) -> Result<(), ControlError> {
        match (&mut self.serve_task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ControlError::serve_with_source("transport failure", e)),
            Err(e) => Err(ControlError::serve_with_source("serve task panicked", e)),
        }
    }
}

impl Drop for SequencerServer {
    // No async drop in Rust: signal shutdown here, drain in `join`.
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
