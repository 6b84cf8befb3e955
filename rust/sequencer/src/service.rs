//! gRPC service implementation for the test sequencer.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use meshbench_core::proto::test_sequencer_server::TestSequencer;
use meshbench_core::proto::{NodeConfig, NodeRegistration, TestSequence, TestSequenceResults};

use crate::state::SequencerState;

pub struct TestSequencerService {
    state: Arc<SequencerState>,
}

impl TestSequencerService {
    pub fn new(state: Arc<SequencerState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl TestSequencer for TestSequencerService {
    async fn register_node(
        &self,
        request: Request<NodeRegistration>,
    ) -> Result<Response<NodeConfig>, Status> {
        let config = self.state.register_node(request.into_inner()).await?;

        tracing::info!(
            "Node {} registered (id={})",
            config.node_alias,
            config.node_id
        );

        Ok(Response::new(config))
    }

    async fn run_test_sequence(
        &self,
        request: Request<TestSequence>,
    ) -> Result<Response<TestSequenceResults>, Status> {
        let sequence = request.into_inner();
        tracing::info!("received test sequence with {} tests", sequence.tests.len());

        let results = self.state.run_test_sequence(sequence).await?;
        Ok(Response::new(results))
    }
}
