//! In-memory state of the test sequencer.
//!
//! One lock guards everything the concurrent RPC handlers share: the node
//! registry and the single active-sequence slot. Per-node `idle` flags are
//! atomic so the fan-out phases can flip them while holding the lock shared.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::info;

use meshbench_core::node::protocol::registration_key;
use meshbench_core::proto::{
    DistributedSystemDescription, NodeConfig, NodeRegistration, TestResult, TestSequence,
    TestSequenceResults,
};
use meshbench_core::{NodeConnector, NodeControl};

use crate::placement::place_services;

/// One registered worker node. Created by RegisterNode, never destroyed
/// while the sequencer runs; re-registration replaces the entry wholesale.
pub struct Node {
    pub(crate) registration: NodeRegistration,
    pub(crate) control: Arc<dyn NodeControl>,
    idle: AtomicBool,
}

impl Node {
    /// True when no RunTraffic is outstanding against this node.
    pub fn idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }
}

/// The currently running sequence: the token a preemptor cancels and the
/// signal it waits on. At most one of these exists at any moment.
struct ActiveSequence {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

pub(crate) struct Inner {
    pub(crate) nodes: BTreeMap<String, Arc<Node>>,
    registration_ids: HashMap<String, u32>,
    active: Option<ActiveSequence>,
}

/// Shared state behind the sequencer's two RPCs.
pub struct SequencerState {
    pub(crate) inner: RwLock<Inner>,
    connector: Arc<dyn NodeConnector>,
}

impl SequencerState {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                nodes: BTreeMap::new(),
                registration_ids: HashMap::new(),
                active: None,
            }),
            connector,
        }
    }

    /// Number of registered nodes.
    pub async fn node_count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    /// Register a node (or re-register it: identical payloads keep their
    /// id, and the connection handle is rebuilt either way).
    pub async fn register_node(&self, registration: NodeRegistration) -> Result<NodeConfig, Status> {
        if registration.hostname.is_empty() || registration.control_port <= 0 {
            return Err(Status::invalid_argument("Invalid registration"));
        }

        let mut inner = self.inner.write().await;

        let key = registration_key(&registration);
        let node_id = match inner.registration_ids.get(&key) {
            Some(&id) => {
                info!("got repeated registration for node{}", id);
                id
            }
            None => inner.nodes.len() as u32,
        };

        // No registry mutation if the endpoint cannot be turned into a stub.
        let control = self
            .connector
            .connect(&registration)
            .map_err(|e| Status::unknown(format!("Could not create node stub: {}", e)))?;

        let alias = format!("node{}", node_id);
        info!(
            "connected to {} @ {}:{}",
            alias, registration.hostname, registration.control_port
        );
        inner.registration_ids.insert(key, node_id);
        inner.nodes.insert(
            alias.clone(),
            Arc::new(Node {
                registration,
                control,
                idle: AtomicBool::new(true),
            }),
        );

        Ok(NodeConfig {
            node_id: node_id as i32,
            node_alias: alias,
        })
    }

    /// Run a test sequence, preempting whatever sequence is currently
    /// running. The new caller always wins: it cancels the active sequence,
    /// waits for it to unwind, and only then installs itself.
    pub async fn run_test_sequence(
        &self,
        request: TestSequence,
    ) -> Result<TestSequenceResults, Status> {
        // A new sequence starts from a quiet fleet, whether or not anything
        // is currently running.
        self.cancel_traffic().await;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        loop {
            let prior = {
                let mut inner = self.inner.write().await;
                match &inner.active {
                    Some(active) => {
                        active.cancel.cancel();
                        Some(active.done.clone())
                    }
                    None => {
                        inner.active = Some(ActiveSequence {
                            cancel: cancel.clone(),
                            done: done_rx.clone(),
                        });
                        None
                    }
                }
            };
            match prior {
                Some(mut done) => {
                    // Another preemptor may have slipped in while we waited,
                    // so go around and re-check instead of installing blindly.
                    let _ = done.wait_for(|finished| *finished).await;
                }
                None => break,
            }
        }

        let result = self.do_run_test_sequence(&request, &cancel).await;

        let _ = done_tx.send(true);
        self.inner.write().await.active = None;
        result
    }

    async fn do_run_test_sequence(
        &self,
        request: &TestSequence,
        cancel: &CancellationToken,
    ) -> Result<TestSequenceResults, Status> {
        let mut results = TestSequenceResults::default();
        for test in &request.tests {
            if cancel.is_cancelled() {
                return Err(Status::aborted("Cancelled by new test sequence."));
            }
            match self.do_run_test(test).await {
                Ok(result) => results.test_results.push(result),
                Err(status) => return Err(Status::aborted(status.message().to_string())),
            }
        }
        Ok(results)
    }

    /// Place one test's services and drive it through the three workload
    /// phases in order.
    async fn do_run_test(
        &self,
        test: &DistributedSystemDescription,
    ) -> Result<TestResult, Status> {
        let known_nodes: BTreeSet<String> = {
            let inner = self.inner.read().await;
            inner.nodes.keys().cloned().collect()
        };

        let placement = place_services(test, known_nodes)?;
        info!("service placement:");
        for (alias, services) in &placement {
            info!("  {}: {:?}", alias, services);
        }

        let endpoints = self.configure_nodes(&placement, test).await?;
        self.introduce_peers(&placement, endpoints.clone()).await?;
        let service_logs = self.run_traffic(&placement).await?;

        Ok(TestResult {
            traffic_config: Some(test.clone()),
            placement: Some(endpoints),
            service_logs: Some(service_logs),
        })
    }

    #[cfg(test)]
    pub(crate) async fn active_sequence_cancelled(&self) -> bool {
        let inner = self.inner.read().await;
        inner
            .active
            .as_ref()
            .map(|active| active.cancel.is_cancelled())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use meshbench_core::error::ControlError;
    use meshbench_core::proto::{
        CancelTrafficRequest, CancelTrafficResult, IntroducePeersResult, NodeServiceConfig,
        RunTrafficRequest, ServiceBundle, ServiceEndpoint, ServiceEndpointMap, ServiceLogs,
        ServiceSpec,
    };

    #[derive(Debug)]
    struct MockControl {
        name: String,
        calls: Arc<StdMutex<Vec<String>>>,
        configured: StdMutex<Vec<String>>,
        fail_configure: bool,
        fail_run: bool,
        gate: Option<watch::Receiver<bool>>,
    }

    impl MockControl {
        fn record(&self, method: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", method, self.name));
        }
    }

    #[async_trait]
    impl NodeControl for MockControl {
        async fn configure_node(
            &self,
            config: NodeServiceConfig,
        ) -> Result<ServiceEndpointMap, Status> {
            self.record("configure");
            if self.fail_configure {
                return Err(Status::unavailable("injected configure failure"));
            }
            *self.configured.lock().unwrap() = config.services.clone();
            let mut endpoints = ServiceEndpointMap::default();
            for service in config.services {
                endpoints.endpoints.insert(
                    service,
                    ServiceEndpoint {
                        endpoint_address: format!("{}:7777", self.name),
                    },
                );
            }
            Ok(endpoints)
        }

        async fn introduce_peers(
            &self,
            _peers: ServiceEndpointMap,
        ) -> Result<IntroducePeersResult, Status> {
            self.record("introduce");
            Ok(IntroducePeersResult::default())
        }

        async fn run_traffic(&self, _request: RunTrafficRequest) -> Result<ServiceLogs, Status> {
            self.record("run");
            if let Some(gate) = &self.gate {
                let mut gate = gate.clone();
                let _ = gate.wait_for(|open| *open).await;
            }
            if self.fail_run {
                return Err(Status::internal("injected run failure"));
            }
            let mut logs = ServiceLogs::default();
            for service in self.configured.lock().unwrap().iter() {
                logs.instance_logs.insert(service.clone(), Default::default());
            }
            Ok(logs)
        }

        async fn cancel_traffic(
            &self,
            _request: CancelTrafficRequest,
        ) -> Result<CancelTrafficResult, Status> {
            self.record("cancel");
            Ok(CancelTrafficResult::default())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        calls: Arc<StdMutex<Vec<String>>>,
        fail_connect: AtomicBool,
        fail_configure: StdMutex<HashSet<String>>,
        fail_run: StdMutex<HashSet<String>>,
        gates: StdMutex<HashMap<String, watch::Receiver<bool>>>,
    }

    impl MockConnector {
        /// Make `run_traffic` on `hostname` block until the returned sender
        /// sends `true`.
        fn gate(&self, hostname: &str) -> watch::Sender<bool> {
            let (tx, rx) = watch::channel(false);
            self.gates.lock().unwrap().insert(hostname.to_string(), rx);
            tx
        }
    }

    impl NodeConnector for MockConnector {
        fn connect(&self, registration: &NodeRegistration) -> meshbench_core::Result<Arc<dyn NodeControl>> {
            if self.fail_connect.load(Ordering::Relaxed) {
                return Err(ControlError::config("injected connect failure"));
            }
            let hostname = registration.hostname.clone();
            Ok(Arc::new(MockControl {
                calls: self.calls.clone(),
                fail_configure: self.fail_configure.lock().unwrap().contains(&hostname),
                fail_run: self.fail_run.lock().unwrap().contains(&hostname),
                gate: self.gates.lock().unwrap().get(&hostname).cloned(),
                configured: StdMutex::new(Vec::new()),
                name: hostname,
            }))
        }
    }

    fn new_state() -> (Arc<SequencerState>, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        let state = Arc::new(SequencerState::new(connector.clone()));
        (state, connector)
    }

    fn registration(hostname: &str, port: i32) -> NodeRegistration {
        NodeRegistration {
            hostname: hostname.to_string(),
            control_port: port,
            ..Default::default()
        }
    }

    fn test_description(server_type: &str, count: i32) -> DistributedSystemDescription {
        DistributedSystemDescription {
            name: format!("{}-test", server_type),
            services: vec![ServiceSpec {
                server_type: server_type.to_string(),
                count,
            }],
            ..Default::default()
        }
    }

    fn sequence(tests: Vec<DistributedSystemDescription>) -> TestSequence {
        TestSequence { tests }
    }

    fn calls_of(connector: &MockConnector) -> Vec<String> {
        connector.calls.lock().unwrap().clone()
    }

    async fn wait_for_call(connector: &MockConnector, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if calls_of(connector).iter().any(|c| c == needle) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for '{}'", needle));
    }

    async fn node_idle(state: &SequencerState, alias: &str) -> bool {
        state.inner.read().await.nodes[alias].idle()
    }

    #[tokio::test]
    async fn register_rejects_invalid_registration() {
        let (state, _) = new_state();
        let err = state.register_node(registration("", 7)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let err = state.register_node(registration("h1", 0)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(state.node_count().await, 0);
    }

    #[tokio::test]
    async fn register_assigns_sequential_aliases() {
        let (state, _) = new_state();
        for (i, hostname) in ["h1", "h2", "h3"].iter().enumerate() {
            let config = state.register_node(registration(hostname, 7)).await.unwrap();
            assert_eq!(config.node_id, i as i32);
            assert_eq!(config.node_alias, format!("node{}", i));
        }
        assert_eq!(state.node_count().await, 3);
    }

    #[tokio::test]
    async fn register_is_idempotent_for_identical_payloads() {
        let (state, _) = new_state();
        let first = state.register_node(registration("h1", 7)).await.unwrap();
        let second = state.register_node(registration("h1", 7)).await.unwrap();
        assert_eq!(first.node_id, 0);
        assert_eq!(second.node_id, 0);
        assert_eq!(second.node_alias, "node0");
        assert_eq!(state.node_count().await, 1);
        assert!(node_idle(&state, "node0").await);

        // A different payload is a different node.
        let third = state.register_node(registration("h1", 8)).await.unwrap();
        assert_eq!(third.node_id, 1);
        assert_eq!(state.node_count().await, 2);
    }

    #[tokio::test]
    async fn register_stub_failure_leaves_registry_untouched() {
        let (state, connector) = new_state();
        connector.fail_connect.store(true, Ordering::Relaxed);
        let err = state.register_node(registration("h1", 7)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unknown);
        assert_eq!(state.node_count().await, 0);

        // The failed attempt must not have burned an id.
        connector.fail_connect.store(false, Ordering::Relaxed);
        let config = state.register_node(registration("h1", 7)).await.unwrap();
        assert_eq!(config.node_id, 0);
    }

    #[tokio::test]
    async fn empty_sequence_returns_no_results() {
        let (state, connector) = new_state();
        state.register_node(registration("h1", 7)).await.unwrap();
        let results = state.run_test_sequence(sequence(vec![])).await.unwrap();
        assert!(results.test_results.is_empty());
        assert!(calls_of(&connector).is_empty());
    }

    #[tokio::test]
    async fn sequence_without_services_is_aborted() {
        let (state, _) = new_state();
        state.register_node(registration("h1", 7)).await.unwrap();
        let err = state
            .run_test_sequence(sequence(vec![test_description("a", 0)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
        assert!(err.message().contains("No services defined."));
    }

    #[tokio::test]
    async fn sequence_with_too_few_nodes_lists_unplaced_services() {
        let (state, _) = new_state();
        state.register_node(registration("h1", 7)).await.unwrap();
        state.register_node(registration("h2", 7)).await.unwrap();
        let err = state
            .run_test_sequence(sequence(vec![test_description("a", 3)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
        assert!(err
            .message()
            .contains("No idle node for placement of services: a/2"));
    }

    #[tokio::test]
    async fn full_sequence_drives_all_phases_on_all_nodes() {
        let (state, connector) = new_state();
        for hostname in ["h1", "h2", "h3"] {
            state.register_node(registration(hostname, 7)).await.unwrap();
        }

        let results = state
            .run_test_sequence(sequence(vec![test_description("a", 2)]))
            .await
            .unwrap();
        assert_eq!(results.test_results.len(), 1);

        let result = &results.test_results[0];
        // The merged endpoint map covers exactly the placed instances.
        let endpoints = result.placement.as_ref().unwrap();
        let mut placed: Vec<_> = endpoints.endpoints.keys().cloned().collect();
        placed.sort();
        assert_eq!(placed, vec!["a/0", "a/1"]);
        assert_eq!(endpoints.endpoints["a/0"].endpoint_address, "h1:7777");
        assert_eq!(endpoints.endpoints["a/1"].endpoint_address, "h2:7777");

        let logs = result.service_logs.as_ref().unwrap();
        let mut logged: Vec<_> = logs.instance_logs.keys().cloned().collect();
        logged.sort();
        assert_eq!(logged, vec!["a/0", "a/1"]);

        // Every node participates in every phase, spare node included.
        let calls = calls_of(&connector);
        for hostname in ["h1", "h2", "h3"] {
            for method in ["configure", "introduce", "run"] {
                assert!(
                    calls.contains(&format!("{} {}", method, hostname)),
                    "missing {} on {}",
                    method,
                    hostname
                );
            }
            assert!(!calls.contains(&format!("cancel {}", hostname)));
        }

        for alias in ["node0", "node1", "node2"] {
            assert!(node_idle(&state, alias).await);
        }
    }

    #[tokio::test]
    async fn configure_failure_aborts_without_running_traffic() {
        let (state, connector) = new_state();
        connector.fail_configure.lock().unwrap().insert("h2".to_string());
        for hostname in ["h1", "h2", "h3"] {
            state.register_node(registration(hostname, 7)).await.unwrap();
        }

        let err = state
            .run_test_sequence(sequence(vec![test_description("a", 3)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
        assert!(err.message().contains("Unknown RPC error"));

        let calls = calls_of(&connector);
        // All configure RPCs were awaited, including the healthy ones.
        for hostname in ["h1", "h2", "h3"] {
            assert!(calls.contains(&format!("configure {}", hostname)));
        }
        // The failure stopped the phase machine cold.
        assert!(!calls.iter().any(|c| c.starts_with("introduce")));
        assert!(!calls.iter().any(|c| c.starts_with("run")));
    }

    #[tokio::test]
    async fn run_traffic_failure_still_restores_idle() {
        let (state, connector) = new_state();
        connector.fail_run.lock().unwrap().insert("h1".to_string());
        state.register_node(registration("h1", 7)).await.unwrap();
        state.register_node(registration("h2", 7)).await.unwrap();

        let err = state
            .run_test_sequence(sequence(vec![test_description("a", 2)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
        assert!(err.message().contains("Unknown RPC error"));

        assert!(node_idle(&state, "node0").await);
        assert!(node_idle(&state, "node1").await);
    }

    #[tokio::test]
    async fn manual_bundles_flow_through_to_configure() {
        let (state, connector) = new_state();
        state.register_node(registration("h1", 7)).await.unwrap();
        state.register_node(registration("h2", 7)).await.unwrap();

        let mut test = test_description("a", 2);
        test.node_service_bundles.insert(
            "node1".to_string(),
            ServiceBundle {
                services: vec!["a/0".to_string()],
            },
        );
        let results = state.run_test_sequence(sequence(vec![test])).await.unwrap();
        let endpoints = results.test_results[0].placement.as_ref().unwrap();
        // node1 (h2) was pinned a/0, so auto-placement put a/1 on node0 (h1).
        assert_eq!(endpoints.endpoints["a/0"].endpoint_address, "h2:7777");
        assert_eq!(endpoints.endpoints["a/1"].endpoint_address, "h1:7777");
        assert!(calls_of(&connector).contains(&"configure h1".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_sequence_preempts_running_sequence() {
        let (state, connector) = new_state();
        let gate = connector.gate("h1");
        state.register_node(registration("h1", 7)).await.unwrap();

        // First sequence: two tests, each traffic run blocked on the gate.
        let first_state = state.clone();
        let first = tokio::spawn(async move {
            first_state
                .run_test_sequence(sequence(vec![
                    test_description("a", 1),
                    test_description("a", 1),
                ]))
                .await
        });
        wait_for_call(&connector, "run h1").await;

        // Second sequence arrives while the first is mid-traffic.
        let second_state = state.clone();
        let second = tokio::spawn(async move {
            second_state
                .run_test_sequence(sequence(vec![test_description("b", 1)]))
                .await
        });

        // The preemptor cancels traffic on the busy node, then cancels the
        // running sequence and waits for it.
        wait_for_call(&connector, "cancel h1").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.active_sequence_cancelled().await {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("first sequence was never cancelled");

        // Unblock the first sequence's in-flight traffic.
        gate.send(true).unwrap();

        let first = first.await.unwrap().unwrap_err();
        assert_eq!(first.code(), tonic::Code::Aborted);
        assert!(first.message().contains("Cancelled by new test sequence."));

        let second = second.await.unwrap().unwrap();
        assert_eq!(second.test_results.len(), 1);

        // CancelTraffic reached the busy node after the first run started
        // and before the second sequence configured anything.
        let calls = calls_of(&connector);
        let first_run = calls.iter().position(|c| c == "run h1").unwrap();
        let cancel = calls.iter().position(|c| c == "cancel h1").unwrap();
        let last_configure = calls.iter().rposition(|c| c == "configure h1").unwrap();
        assert!(first_run < cancel);
        assert!(cancel < last_configure);

        assert!(node_idle(&state, "node0").await);
    }

    #[tokio::test]
    async fn sequences_run_back_to_back_without_preemption() {
        let (state, _) = new_state();
        state.register_node(registration("h1", 7)).await.unwrap();

        for _ in 0..3 {
            let results = state
                .run_test_sequence(sequence(vec![test_description("a", 1)]))
                .await
                .unwrap();
            assert_eq!(results.test_results.len(), 1);
        }
    }

    #[tokio::test]
    async fn re_registration_after_sequence_keeps_alias_and_idle() {
        let (state, _) = new_state();
        state.register_node(registration("h1", 7)).await.unwrap();
        state
            .run_test_sequence(sequence(vec![test_description("a", 1)]))
            .await
            .unwrap();

        let config = state.register_node(registration("h1", 7)).await.unwrap();
        assert_eq!(config.node_alias, "node0");
        assert_eq!(state.node_count().await, 1);
        assert!(node_idle(&state, "node0").await);
    }
}
