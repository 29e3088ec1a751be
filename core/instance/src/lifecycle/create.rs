use super::controller::LifecycleStatus;
use crate::consts::PUBLIC_PARAMS_BITS;
use crate::error::{FhevmError, Result};
use crate::instance::FhevmInstance;
use crate::mock::{
    fetch_relayer_metadata, is_development_node, probe_client_version, MockInstanceFactory,
    MockInstanceParams,
};
use crate::network::{resolve, MockChains, NetworkHandle, RpcConnector};
use crate::public_key_cache::PublicKeyCache;
use crate::sdk::{FhevmInstanceConfig, RelayerSdk, SdkLoader};
use alloy_primitives::Address;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Collaborators an instance creation attempt works with.
#[derive(Clone)]
pub struct InstanceBackends {
    pub connector: Arc<dyn RpcConnector>,
    pub sdk_loader: SdkLoader,
    pub public_keys: PublicKeyCache,
    pub mock_factory: MockInstanceFactory,
}

impl InstanceBackends {
    pub fn new(
        connector: Arc<dyn RpcConnector>,
        sdk_loader: SdkLoader,
        public_keys: PublicKeyCache,
    ) -> Self {
        Self {
            mock_factory: MockInstanceFactory::new(Arc::clone(&connector)),
            connector,
            sdk_loader,
            public_keys,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateInstanceParams {
    pub network: NetworkHandle,
    pub mock_chains: Option<MockChains>,
    /// Options handed to the SDK's `initSDK`.
    pub sdk_init_options: Option<Value>,
}

fn throw_if_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(FhevmError::Cancelled);
    }
    Ok(())
}

/// The ACL address the SDK declares, which must be a `0x`-prefixed address.
fn declared_acl_address(sdk: &RelayerSdk) -> Result<Address> {
    match sdk.declared_acl_address() {
        Some(Value::String(raw)) if raw.starts_with("0x") => {
            Address::from_str(raw).map_err(|_| FhevmError::AddressInvalid(raw.clone()))
        }
        Some(Value::String(raw)) => Err(FhevmError::AddressInvalid(raw.clone())),
        Some(other) => Err(FhevmError::AddressInvalid(other.to_string())),
        None => Err(FhevmError::AddressInvalid(
            "no aclContractAddress declared".to_string(),
        )),
    }
}

/// Mock path. Returns `None` when the node is not a development node, in which case
/// the caller continues with the relayer SDK. A development node that cannot serve
/// its FHEVM metadata is an error.
async fn try_create_mock_instance(
    backends: &InstanceBackends,
    rpc_url: &str,
    chain_id: u64,
    token: &CancellationToken,
    on_status: &(dyn Fn(LifecycleStatus) + Send + Sync),
) -> Result<Option<Arc<dyn FhevmInstance>>> {
    let provider = backends.connector.connect(rpc_url)?;
    let client_version = probe_client_version(provider.as_ref()).await?;
    throw_if_cancelled(token)?;
    if !is_development_node(&client_version) {
        tracing::warn!(
            "chain {chain_id} is listed as a mock chain but {rpc_url} runs {client_version:?}, \
             not a development node; using the relayer SDK"
        );
        return Ok(None);
    }

    let metadata = fetch_relayer_metadata(provider.as_ref()).await;
    throw_if_cancelled(token)?;
    let metadata = metadata?;

    on_status(LifecycleStatus::Creating);
    let instance = backends
        .mock_factory
        .create(MockInstanceParams {
            rpc_url: rpc_url.to_string(),
            chain_id,
            metadata,
        })
        .await?;
    throw_if_cancelled(token)?;
    Ok(Some(instance))
}

/// Run one instance creation attempt.
///
/// `token` is checked before and after every suspension point; once it fires the
/// attempt stops with [FhevmError::Cancelled]. `on_status` receives the detailed
/// status as the attempt progresses.
pub async fn create_fhevm_instance(
    params: CreateInstanceParams,
    backends: &InstanceBackends,
    token: &CancellationToken,
    on_status: &(dyn Fn(LifecycleStatus) + Send + Sync),
) -> Result<Arc<dyn FhevmInstance>> {
    throw_if_cancelled(token)?;
    on_status(LifecycleStatus::Resolving);
    let resolution = resolve(
        &params.network,
        params.mock_chains.as_ref(),
        backends.connector.as_ref(),
    )
    .await?;
    throw_if_cancelled(token)?;

    if resolution.is_mock {
        if let Some(rpc_url) = resolution.rpc_url.as_deref() {
            if let Some(instance) = try_create_mock_instance(
                backends,
                rpc_url,
                resolution.chain_id,
                token,
                on_status,
            )
            .await?
            {
                return Ok(instance);
            }
        }
    }

    let loader = &backends.sdk_loader;
    let needs_load = !loader.is_loaded();
    if needs_load {
        on_status(LifecycleStatus::SdkLoading);
    }
    let sdk = loader.load().await?;
    throw_if_cancelled(token)?;
    if needs_load {
        on_status(LifecycleStatus::SdkLoaded);
    }

    let env = loader.environment();
    if !env.is_initialized() {
        on_status(LifecycleStatus::SdkInitializing);
        env.initialize(&sdk, params.sdk_init_options.clone()).await?;
        throw_if_cancelled(token)?;
        on_status(LifecycleStatus::SdkInitialized);
    }

    let acl_address = declared_acl_address(&sdk)?;
    let cached = backends.public_keys.get(&acl_address).await;
    throw_if_cancelled(token)?;

    on_status(LifecycleStatus::Creating);
    let config = FhevmInstanceConfig {
        sdk_config: sdk.sepolia_config().clone(),
        network: params.network,
        acl_contract_address: acl_address,
        public_key: cached.public_key,
        public_params: cached.public_params,
    };
    let instance = sdk
        .create_instance(config)
        .await
        .map_err(|e| FhevmError::ConstructionFailed(e.to_string()))?;
    throw_if_cancelled(token)?;

    backends
        .public_keys
        .set(
            &acl_address,
            instance.public_key(),
            instance.public_params(PUBLIC_PARAMS_BITS),
        )
        .await;
    throw_if_cancelled(token)?;
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{RPC_CLIENT_VERSION, RPC_RELAYER_METADATA, SDK_CDN_URL};
    use crate::sdk::{RegistryInjector, SdkEnvironment};
    use crate::storage::RamStore;
    use crate::testing::{ScriptedConnector, ScriptedProvider, StubSdk, TEST_ACL_ADDRESS};
    use serde_json::json;
    use std::sync::Mutex;

    const NODE: &str = "http://localhost:8545";

    fn backends(connector: ScriptedConnector, stub: Option<&StubSdk>) -> InstanceBackends {
        let env = Arc::new(SdkEnvironment::detached());
        if let Some(stub) = stub {
            env.install(stub.raw());
        }
        InstanceBackends::new(
            Arc::new(connector),
            SdkLoader::new(env),
            PublicKeyCache::new(Arc::new(RamStore::default())),
        )
    }

    fn params(network: NetworkHandle) -> CreateInstanceParams {
        CreateInstanceParams {
            network,
            mock_chains: None,
            sdk_init_options: None,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<LifecycleStatus>>>, impl Fn(LifecycleStatus) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |s: LifecycleStatus| sink.lock().unwrap().push(s))
    }

    #[tokio::test]
    async fn development_node_gets_a_mock_instance_without_sdk() {
        let node = Arc::new(ScriptedProvider::development_node(31337));
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let backends = backends(
            ScriptedConnector::default().with_provider(NODE, Arc::clone(&node)),
            Some(&stub),
        );
        let (seen, on_status) = recorder();
        let instance = create_fhevm_instance(
            params(NetworkHandle::from(NODE)),
            &backends,
            &CancellationToken::new(),
            &on_status,
        )
        .await
        .unwrap();
        assert!(instance.public_key().is_none());
        assert_eq!(stub.init_calls(), 0);
        assert_eq!(stub.create_calls(), 0);
        assert!(!backends.sdk_loader.environment().is_initialized());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![LifecycleStatus::Resolving, LifecycleStatus::Creating]
        );
    }

    #[tokio::test]
    async fn non_mock_chain_goes_through_the_sdk() {
        let node = Arc::new(ScriptedProvider::production_node(11155111));
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let backends = backends(ScriptedConnector::default(), Some(&stub));
        let (seen, on_status) = recorder();
        create_fhevm_instance(
            params(NetworkHandle::Provider(node.clone())),
            &backends,
            &CancellationToken::new(),
            &on_status,
        )
        .await
        .unwrap();
        assert_eq!(node.calls(RPC_CLIENT_VERSION), 0);
        assert_eq!(node.calls(RPC_RELAYER_METADATA), 0);
        assert_eq!(stub.init_calls(), 1);
        assert_eq!(stub.create_calls(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                LifecycleStatus::Resolving,
                LifecycleStatus::SdkInitializing,
                LifecycleStatus::SdkInitialized,
                LifecycleStatus::Creating,
            ]
        );
    }

    #[tokio::test]
    async fn sdk_statuses_only_for_steps_that_run() {
        let node = Arc::new(ScriptedProvider::production_node(11155111));
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let injector = RegistryInjector::default().with_source(SDK_CDN_URL, stub.factory());
        let backends = InstanceBackends::new(
            Arc::new(ScriptedConnector::default()),
            SdkLoader::new(Arc::new(SdkEnvironment::new(Arc::new(injector)))),
            PublicKeyCache::new(Arc::new(RamStore::default())),
        );

        let (seen, on_status) = recorder();
        let token = CancellationToken::new();
        for _ in 0..2 {
            create_fhevm_instance(
                params(NetworkHandle::Provider(node.clone())),
                &backends,
                &token,
                &on_status,
            )
            .await
            .unwrap();
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                LifecycleStatus::Resolving,
                LifecycleStatus::SdkLoading,
                LifecycleStatus::SdkLoaded,
                LifecycleStatus::SdkInitializing,
                LifecycleStatus::SdkInitialized,
                LifecycleStatus::Creating,
                LifecycleStatus::Resolving,
                LifecycleStatus::Creating,
            ]
        );
        assert_eq!(stub.init_calls(), 1);
        assert_eq!(stub.create_calls(), 2);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn mock_chain_without_development_node_falls_through_to_sdk() {
        let node = Arc::new(ScriptedProvider::production_node(31337));
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let backends = backends(
            ScriptedConnector::default().with_provider(NODE, Arc::clone(&node)),
            Some(&stub),
        );
        create_fhevm_instance(
            params(NetworkHandle::from(NODE)),
            &backends,
            &CancellationToken::new(),
            &|_| {},
        )
        .await
        .unwrap();
        assert_eq!(node.calls(RPC_CLIENT_VERSION), 1);
        assert_eq!(node.calls(RPC_RELAYER_METADATA), 0);
        assert_eq!(stub.create_calls(), 1);
        assert!(logs_contain("not a development node"));
    }

    #[tokio::test]
    async fn development_node_without_metadata_is_an_error() {
        let node = Arc::new(
            ScriptedProvider::development_node(31337)
                .with_failure(RPC_RELAYER_METADATA, "method not found"),
        );
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let backends = backends(
            ScriptedConnector::default().with_provider(NODE, Arc::clone(&node)),
            Some(&stub),
        );
        let err = create_fhevm_instance(
            params(NetworkHandle::from(NODE)),
            &backends,
            &CancellationToken::new(),
            &|_| {},
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, FhevmError::Rpc(ref m) if m.contains("method not found")));
        assert_eq!(node.calls(RPC_RELAYER_METADATA), 1);
        assert_eq!(stub.init_calls(), 0);
        assert_eq!(stub.create_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_acl_address_fails_before_construction() {
        let node = Arc::new(ScriptedProvider::production_node(11155111));
        let stub = StubSdk::new(json!("not-an-address"));
        let backends = backends(ScriptedConnector::default(), Some(&stub));
        let err = create_fhevm_instance(
            params(NetworkHandle::Provider(node)),
            &backends,
            &CancellationToken::new(),
            &|_| {},
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, FhevmError::AddressInvalid(ref a) if a == "not-an-address"));
        assert_eq!(stub.create_calls(), 0);
    }

    #[tokio::test]
    async fn cached_key_material_is_passed_and_refreshed_after_construction() {
        let node = Arc::new(ScriptedProvider::production_node(11155111));
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS));
        let backends = backends(ScriptedConnector::default(), Some(&stub));
        assert!(backends.public_keys.get(&TEST_ACL_ADDRESS).await.is_empty());

        let token = CancellationToken::new();
        let noop = |_: LifecycleStatus| {};
        let run = || {
            create_fhevm_instance(
                params(NetworkHandle::Provider(node.clone())),
                &backends,
                &token,
                &noop,
            )
        };
        run().await.unwrap();
        let first = stub.last_config().unwrap();
        assert_eq!(first.public_key, None);
        assert_eq!(first.acl_contract_address, TEST_ACL_ADDRESS);

        let cached = backends.public_keys.get(&TEST_ACL_ADDRESS).await;
        assert_eq!(cached.public_key.as_ref().unwrap().id, "stub-public-key");

        run().await.unwrap();
        let second = stub.last_config().unwrap();
        assert_eq!(second.public_key, cached.public_key);
        assert_eq!(second.public_params, cached.public_params);
        assert_eq!(stub.init_calls(), 1);
    }

    #[tokio::test]
    async fn construction_failure_is_reported_and_nothing_cached() {
        let node = Arc::new(ScriptedProvider::production_node(11155111));
        let stub = StubSdk::new(json!(TEST_ACL_ADDRESS)).failing_construction("bad relayer url");
        let backends = backends(ScriptedConnector::default(), Some(&stub));
        let err = create_fhevm_instance(
            params(NetworkHandle::Provider(node)),
            &backends,
            &CancellationToken::new(),
            &|_| {},
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, FhevmError::ConstructionFailed(ref m) if m.contains("bad relayer url")));
        assert!(backends.public_keys.get(&TEST_ACL_ADDRESS).await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_request() {
        let node = Arc::new(ScriptedProvider::production_node(11155111));
        let backends = backends(ScriptedConnector::default(), None);
        let token = CancellationToken::new();
        token.cancel();
        let err = create_fhevm_instance(
            params(NetworkHandle::Provider(node.clone())),
            &backends,
            &token,
            &|_| {},
        )
        .await
        .err()
        .unwrap();
        assert!(err.is_cancelled());
        assert_eq!(node.calls(crate::consts::RPC_CHAIN_ID), 0);
    }

    #[tokio::test]
    async fn missing_sdk_in_detached_environment_is_an_environment_error() {
        let node = Arc::new(ScriptedProvider::production_node(11155111));
        let backends = backends(ScriptedConnector::default(), None);
        let err = create_fhevm_instance(
            params(NetworkHandle::Provider(node)),
            &backends,
            &CancellationToken::new(),
            &|_| {},
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, FhevmError::EnvironmentInvalid(_)));
    }
}
