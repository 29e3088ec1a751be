use super::create::{create_fhevm_instance, CreateInstanceParams, InstanceBackends};
use crate::error::FhevmError;
use crate::instance::FhevmInstance;
use crate::network::{MockChains, NetworkHandle};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use strum_macros::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Detailed progress of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LifecycleStatus {
    Idle,
    Resolving,
    SdkLoading,
    SdkLoaded,
    SdkInitializing,
    SdkInitialized,
    Creating,
    Created,
    Error,
}

/// The coarse state callers usually render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FhevmGoState {
    Idle,
    Loading,
    Ready,
    Error,
}

impl LifecycleStatus {
    pub fn narrow(&self) -> FhevmGoState {
        match self {
            LifecycleStatus::Idle => FhevmGoState::Idle,
            LifecycleStatus::Created => FhevmGoState::Ready,
            LifecycleStatus::Error => FhevmGoState::Error,
            LifecycleStatus::Resolving
            | LifecycleStatus::SdkLoading
            | LifecycleStatus::SdkLoaded
            | LifecycleStatus::SdkInitializing
            | LifecycleStatus::SdkInitialized
            | LifecycleStatus::Creating => FhevmGoState::Loading,
        }
    }

    /// No attempt is running.
    pub fn is_settled(&self) -> bool {
        self.narrow() != FhevmGoState::Loading
    }
}

struct ControllerState {
    generation: u64,
    token: Option<CancellationToken>,
    enabled: bool,
    network: Option<NetworkHandle>,
    chain_id: Option<u64>,
    instance: Option<Arc<dyn FhevmInstance>>,
    error: Option<Arc<FhevmError>>,
}

struct Shared {
    backends: InstanceBackends,
    mock_chains: Option<MockChains>,
    sdk_init_options: Option<Value>,
    state: Mutex<ControllerState>,
    status: watch::Sender<LifecycleStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, status: LifecycleStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::debug!("fhevm status {current} -> {status}");
            *current = status;
            true
        });
    }

    /// Publish `status` on behalf of attempt `generation`, unless it was superseded.
    fn publish_for(&self, generation: u64, token: &CancellationToken, status: LifecycleStatus) {
        let state = self.lock();
        if state.generation == generation && !token.is_cancelled() {
            self.publish(status);
        }
    }

    fn commit(
        &self,
        generation: u64,
        token: &CancellationToken,
        outcome: crate::Result<Arc<dyn FhevmInstance>>,
    ) {
        let mut state = self.lock();
        if state.generation != generation || token.is_cancelled() {
            tracing::debug!("discarding outcome of superseded attempt {generation}");
            return;
        }
        state.token = None;
        match outcome {
            Ok(instance) => {
                tracing::info!("fhevm instance ready");
                state.instance = Some(instance);
                state.error = None;
                self.publish(LifecycleStatus::Created);
            }
            Err(FhevmError::Cancelled) => {
                self.publish(LifecycleStatus::Idle);
            }
            Err(e) => {
                tracing::error!("fhevm instance creation failed: {e}");
                state.instance = None;
                state.error = Some(Arc::new(e));
                self.publish(LifecycleStatus::Error);
            }
        }
    }

    /// Abort the running attempt, clear the outcome and, when enabled with a network,
    /// start a new attempt.
    fn restart(self: &Arc<Self>) {
        let mut state = self.lock();
        state.generation += 1;
        if let Some(token) = state.token.take() {
            token.cancel();
        }
        state.instance = None;
        state.error = None;
        self.publish(LifecycleStatus::Idle);

        let network = match (&state.network, state.enabled) {
            (Some(network), true) => network.clone(),
            (None, true) => {
                tracing::debug!("no network, staying idle");
                return;
            }
            (_, false) => {
                tracing::debug!("disabled, staying idle");
                return;
            }
        };
        let generation = state.generation;
        let chain_id = state.chain_id;
        let token = CancellationToken::new();
        state.token = Some(token.clone());
        self.publish(LifecycleStatus::Resolving);
        drop(state);

        tracing::info!(
            "starting fhevm instance attempt {generation} for {network:?} (chain {chain_id:?})"
        );
        let params = CreateInstanceParams {
            network,
            mock_chains: self.mock_chains.clone(),
            sdk_init_options: self.sdk_init_options.clone(),
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let reporter = Arc::clone(&shared);
            let reporter_token = token.clone();
            let on_status = move |status: LifecycleStatus| {
                reporter.publish_for(generation, &reporter_token, status)
            };
            let outcome =
                create_fhevm_instance(params, &shared.backends, &token, &on_status).await;
            shared.commit(generation, &token, outcome);
        });
    }
}

/// Drives instance creation for the current network.
///
/// Every change of network, every change of the enabled flag and every
/// [InstanceLifecycleController::refresh] cancels the running attempt and starts
/// over. Only the most recently started attempt can publish an instance or an
/// error. Errors never escape the controller; they are exposed through
/// [InstanceLifecycleController::error] next to the status.
///
/// Attempts run on the ambient tokio runtime.
#[derive(Clone)]
pub struct InstanceLifecycleController {
    shared: Arc<Shared>,
}

impl InstanceLifecycleController {
    pub fn new(backends: InstanceBackends) -> Self {
        Self::with_options(backends, None, None)
    }

    pub fn with_options(
        backends: InstanceBackends,
        mock_chains: Option<MockChains>,
        sdk_init_options: Option<Value>,
    ) -> Self {
        let (status, _) = watch::channel(LifecycleStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                backends,
                mock_chains,
                sdk_init_options,
                state: Mutex::new(ControllerState {
                    generation: 0,
                    token: None,
                    enabled: true,
                    network: None,
                    chain_id: None,
                    instance: None,
                    error: None,
                }),
                status,
            }),
        }
    }

    /// Point the controller at a new network (or none) and restart.
    pub fn set_network(&self, network: Option<NetworkHandle>, chain_id: Option<u64>) {
        {
            let mut state = self.shared.lock();
            state.network = network;
            state.chain_id = chain_id;
        }
        self.shared.restart();
    }

    /// Disabling releases any running attempt and keeps the controller idle.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.shared.lock();
            if state.enabled == enabled {
                return;
            }
            state.enabled = enabled;
        }
        self.shared.restart();
    }

    /// Discard the current outcome and run a new attempt.
    pub fn refresh(&self) {
        self.shared.restart();
    }

    /// Abort the running attempt without starting another one.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        if let Some(token) = state.token.take() {
            state.generation += 1;
            token.cancel();
            tracing::info!("fhevm instance attempt cancelled");
            self.shared.publish(LifecycleStatus::Idle);
        }
    }

    pub fn status(&self) -> FhevmGoState {
        self.lifecycle_status().narrow()
    }

    pub fn lifecycle_status(&self) -> LifecycleStatus {
        *self.shared.status.borrow()
    }

    pub fn instance(&self) -> Option<Arc<dyn FhevmInstance>> {
        self.shared.lock().instance.clone()
    }

    pub fn error(&self) -> Option<Arc<FhevmError>> {
        self.shared.lock().error.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.shared.lock().chain_id
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until no attempt is running and return the status it settled in.
    pub async fn wait_until_settled(&self) -> LifecycleStatus {
        let mut rx = self.subscribe();
        let settled = rx.wait_for(LifecycleStatus::is_settled).await.map(|s| *s);
        match settled {
            Ok(status) => status,
            Err(_) => self.lifecycle_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{RPC_CHAIN_ID, RPC_CLIENT_VERSION, RPC_RELAYER_METADATA};
    use crate::public_key_cache::PublicKeyCache;
    use crate::sdk::{SdkEnvironment, SdkLoader};
    use crate::testing::{ScriptedConnector, ScriptedProvider, StubSdk, TEST_ACL_ADDRESS};
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;

    const NODE: &str = "http://localhost:8545";

    fn backends_with(connector: ScriptedConnector, stub: &StubSdk) -> InstanceBackends {
        let env = Arc::new(SdkEnvironment::detached());
        env.install(stub.raw());
        InstanceBackends::new(
            Arc::new(connector),
            SdkLoader::new(env),
            PublicKeyCache::disabled(),
        )
    }

    fn controller_with(connector: ScriptedConnector, stub: &StubSdk) -> InstanceLifecycleController {
        InstanceLifecycleController::new(backends_with(connector, stub))
    }

    fn sepolia() -> NetworkHandle {
        NetworkHandle::Provider(Arc::new(ScriptedProvider::production_node(11155111)))
    }

    #[rstest]
    #[case(LifecycleStatus::Idle, FhevmGoState::Idle)]
    #[case(LifecycleStatus::Resolving, FhevmGoState::Loading)]
    #[case(LifecycleStatus::SdkLoading, FhevmGoState::Loading)]
    #[case(LifecycleStatus::SdkInitialized, FhevmGoState::Loading)]
    #[case(LifecycleStatus::Creating, FhevmGoState::Loading)]
    #[case(LifecycleStatus::Created, FhevmGoState::Ready)]
    #[case(LifecycleStatus::Error, FhevmGoState::Error)]
    fn statuses_narrow(#[case] status: LifecycleStatus, #[case] expected: FhevmGoState) {
        assert_eq!(status.narrow(), expected);
    }

    #[test]
    fn status_names() {
        assert_eq!(LifecycleStatus::SdkInitializing.to_string(), "sdk-initializing");
        assert_eq!(FhevmGoState::Ready.to_string(), "ready");
    }

    #[tokio::test]
    async fn no_network_stays_idle() {
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let controller = controller_with(ScriptedConnector::default(), &stub);
        controller.refresh();
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Idle);
        assert!(controller.instance().is_none());
        assert_eq!(stub.create_calls(), 0);
    }

    #[tokio::test]
    async fn sdk_network_becomes_ready() {
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let controller = controller_with(ScriptedConnector::default(), &stub);
        controller.set_network(Some(sepolia()), Some(11155111));
        assert_eq!(controller.status(), FhevmGoState::Loading);
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Created);
        assert_eq!(controller.status(), FhevmGoState::Ready);
        assert!(controller.instance().is_some());
        assert!(controller.error().is_none());
        assert_eq!(controller.chain_id(), Some(11155111));
    }

    #[tokio::test]
    async fn development_node_becomes_ready_with_mock() {
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let node = Arc::new(ScriptedProvider::development_node(31337));
        let controller = controller_with(
            ScriptedConnector::default().with_provider(NODE, node),
            &stub,
        );
        controller.set_network(Some(NetworkHandle::from(NODE)), Some(31337));
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Created);
        let instance = controller.instance().unwrap();
        assert!(instance.public_key().is_none());
        assert_eq!(stub.init_calls(), 0);
        assert_eq!(stub.create_calls(), 0);
    }

    #[rstest]
    #[case::node_refuses(Some("connection refused"))]
    #[case::node_unreachable(None)]
    #[tokio::test]
    async fn failed_client_version_on_mock_chain_lands_in_error(#[case] failure: Option<&str>) {
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let connector = match failure {
            Some(message) => ScriptedConnector::default().with_provider(
                NODE,
                Arc::new(
                    ScriptedProvider::new()
                        .with_response(RPC_CHAIN_ID, json!("0x7a69"))
                        .with_failure(RPC_CLIENT_VERSION, message),
                ),
            ),
            None => ScriptedConnector::default(),
        };
        let wallet = ScriptedProvider::new().with_response(RPC_CHAIN_ID, json!("0x7a69"));
        let controller = controller_with(connector, &stub);
        controller.set_network(Some(NetworkHandle::Provider(Arc::new(wallet))), Some(31337));
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Error);
        let error = controller.error().unwrap();
        assert!(matches!(*error, FhevmError::Rpc(_)));
        assert!(controller.instance().is_none());
        assert_eq!(stub.init_calls(), 0);
        assert_eq!(stub.create_calls(), 0);
    }

    #[tokio::test]
    async fn configured_mock_chain_becomes_ready_with_mock() {
        const LOCAL_NODE: &str = "http://127.0.0.1:8546";
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let node = Arc::new(ScriptedProvider::development_node(1337));
        let controller = InstanceLifecycleController::with_options(
            backends_with(
                ScriptedConnector::default().with_provider(LOCAL_NODE, Arc::clone(&node)),
                &stub,
            ),
            Some(MockChains::from([(1337, LOCAL_NODE.to_string())])),
            None,
        );
        controller.set_network(Some(NetworkHandle::from(LOCAL_NODE)), Some(1337));
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Created);
        assert!(controller.instance().unwrap().public_key().is_none());
        assert_eq!(controller.chain_id(), Some(1337));
        assert_eq!(node.calls(RPC_RELAYER_METADATA), 1);
        assert_eq!(stub.create_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_acl_address_lands_in_error() {
        let stub = StubSdk::new(json!("not-an-address"));
        let controller = controller_with(ScriptedConnector::default(), &stub);
        controller.set_network(Some(sepolia()), Some(11155111));
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Error);
        assert_eq!(controller.status(), FhevmGoState::Error);
        let error = controller.error().unwrap();
        assert!(matches!(*error, FhevmError::AddressInvalid(_)));
        assert!(controller.instance().is_none());
        assert_eq!(stub.create_calls(), 0);
    }

    #[tokio::test]
    async fn refresh_before_first_step_discards_first_attempt() {
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let controller = controller_with(ScriptedConnector::default(), &stub);
        controller.set_network(Some(sepolia()), Some(11155111));
        controller.refresh();
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Created);
        // give the superseded attempt every chance to run to completion
        tokio::task::yield_now().await;
        assert_eq!(stub.create_calls(), 1);
        assert_eq!(controller.lifecycle_status(), LifecycleStatus::Created);
    }

    #[tokio::test]
    async fn superseded_attempt_cannot_publish_an_error() {
        let bad = StubSdk::new(json!("not-an-address"));
        let slow = NetworkHandle::Provider(Arc::new(
            ScriptedProvider::production_node(11155111).with_delay(Duration::from_millis(50)),
        ));
        let controller = controller_with(ScriptedConnector::default(), &bad);
        controller.set_network(Some(slow), Some(11155111));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(controller.lifecycle_status(), LifecycleStatus::Resolving);

        controller.set_network(None, None);
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Idle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.lifecycle_status(), LifecycleStatus::Idle);
        assert!(controller.error().is_none());
    }

    #[tokio::test]
    async fn superseded_construction_commits_nothing() {
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS))
            .with_construction_delay(Duration::from_millis(30));
        let controller = controller_with(ScriptedConnector::default(), &stub);
        let mut rx = controller.subscribe();
        controller.set_network(Some(sepolia()), Some(11155111));
        rx.wait_for(|s| *s == LifecycleStatus::Creating).await.unwrap();

        controller.refresh();
        assert!(controller.instance().is_none());
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Created);
        assert_eq!(stub.create_calls(), 2);
    }

    #[tokio::test]
    async fn disabling_releases_the_attempt() {
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS))
            .with_construction_delay(Duration::from_millis(30));
        let controller = controller_with(ScriptedConnector::default(), &stub);
        controller.set_network(Some(sepolia()), Some(11155111));
        controller.set_enabled(false);
        assert!(!controller.is_enabled());
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Idle);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(controller.instance().is_none());
        assert_eq!(controller.lifecycle_status(), LifecycleStatus::Idle);

        controller.set_enabled(true);
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Created);
    }

    #[tokio::test]
    async fn cancel_lands_in_idle() {
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS))
            .with_construction_delay(Duration::from_millis(30));
        let controller = controller_with(ScriptedConnector::default(), &stub);
        controller.set_network(Some(sepolia()), Some(11155111));
        controller.cancel();
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Idle);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(controller.instance().is_none());
        assert!(controller.error().is_none());

        controller.refresh();
        assert_eq!(controller.wait_until_settled().await, LifecycleStatus::Created);
    }
}
