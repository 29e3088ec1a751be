//! Scripted collaborators for tests: JSON-RPC providers, a stub relayer SDK and a
//! signer that counts its calls.
use crate::authorization::{DecryptionAuthorization, Eip712Signer};
use crate::consts::{
    MOCK_DECRYPTION_VERIFYING_CONTRACT, RPC_CHAIN_ID, RPC_CLIENT_VERSION, RPC_ETH_CALL,
    RPC_RELAYER_METADATA,
};
use crate::error::{FhevmError, Result};
use crate::instance::{
    DecryptedResults, EncryptedInput, EncryptedInputBuilder, EphemeralKeyPair, FheValue,
    FhevmInstance, HandleContractPair, PublicKeyData, PublicParamsData,
};
use crate::mock::{MockFhevmInstance, MockInstanceConfig, VerifierProperties};
use crate::network::{Eip1193Provider, RpcConnector};
use crate::sdk::loader::SdkFactory;
use crate::sdk::{
    FhevmInstanceConfig, InstanceConstructor, RawRelayerSdk, RegistryInjector, ScriptInjector,
    SdkEnvironment, SdkInitializer,
};
use alloy_dyn_abi::{DynSolValue, TypedData};
use alloy_primitives::{address, Address, Signature, B256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_ACL_ADDRESS: Address = address!("50157CFfD6bBFA2DECe204a89ec419c23ef5755D");
pub const TEST_INPUT_VERIFIER_ADDRESS: Address =
    address!("901F8942346f7AB3a01F6D7613119Bca447Bb030");
pub const TEST_KMS_VERIFIER_ADDRESS: Address = address!("1364cBBf2cDF5032C47d8226a6f6FBD2AFCDacAC");
pub const TEST_INPUT_VERIFICATION_CONTRACT: Address =
    address!("812b06e1CDCE800494b79fFE4f925A504a9A9810");
pub const TEST_GATEWAY_CHAIN_ID: u64 = 55815;

/// Provider answering each method with a fixed result.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: HashMap<String, Value>,
    failures: HashMap<String, String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, method: &str, result: Value) -> Self {
        self.responses.insert(method.to_string(), result);
        self
    }

    pub fn with_failure(mut self, method: &str, message: &str) -> Self {
        self.failures.insert(method.to_string(), message.to_string());
        self
    }

    /// Sleep before answering, so that callers can be cancelled mid-request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of requests issued for `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|m| *m == method).count())
            .unwrap_or_default()
    }

    /// A hardhat-like development node for `chain_id` exposing the FHEVM metadata.
    pub fn development_node(chain_id: u64) -> Self {
        Self::new()
            .with_response(RPC_CHAIN_ID, json!(format!("{chain_id:#x}")))
            .with_response(
                RPC_CLIENT_VERSION,
                json!("HardhatNetwork/2.22.19/@nomicfoundation/edr/0.10.0"),
            )
            .with_response(
                RPC_RELAYER_METADATA,
                json!({
                    "ACLAddress": TEST_ACL_ADDRESS,
                    "InputVerifierAddress": TEST_INPUT_VERIFIER_ADDRESS,
                    "KMSVerifierAddress": TEST_KMS_VERIFIER_ADDRESS,
                }),
            )
            .with_response(
                RPC_ETH_CALL,
                eip712_domain_response(TEST_GATEWAY_CHAIN_ID, TEST_INPUT_VERIFICATION_CONTRACT),
            )
    }

    /// A node on `chain_id` that is not a development node.
    pub fn production_node(chain_id: u64) -> Self {
        Self::new()
            .with_response(RPC_CHAIN_ID, json!(format!("{chain_id:#x}")))
            .with_response(RPC_CLIENT_VERSION, json!("Geth/v1.14.0-stable/linux-amd64"))
    }
}

#[async_trait]
impl Eip1193Provider for ScriptedProvider {
    async fn request(&self, method: &str, _params: Value) -> anyhow::Result<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(method.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.failures.get(method) {
            anyhow::bail!("{message}");
        }
        self.responses
            .get(method)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unexpected method {method}"))
    }
}

/// Connector handing out scripted providers per URL.
#[derive(Default, Clone)]
pub struct ScriptedConnector {
    providers: HashMap<String, Arc<ScriptedProvider>>,
}

impl ScriptedConnector {
    pub fn with_provider(mut self, rpc_url: &str, provider: Arc<ScriptedProvider>) -> Self {
        self.providers.insert(rpc_url.to_string(), provider);
        self
    }
}

impl RpcConnector for ScriptedConnector {
    fn connect(&self, rpc_url: &str) -> Result<Arc<dyn Eip1193Provider>> {
        self.providers
            .get(rpc_url)
            .map(|p| Arc::clone(p) as Arc<dyn Eip1193Provider>)
            .ok_or_else(|| FhevmError::Rpc(format!("cannot connect to {rpc_url}")))
    }
}

/// ABI-encoded `eip712Domain()` result of an InputVerification contract.
pub fn eip712_domain_response(chain_id: u64, verifying_contract: Address) -> Value {
    let encoded = DynSolValue::Tuple(vec![
        DynSolValue::FixedBytes(B256::right_padding_from(&[0x0f]), 1),
        DynSolValue::String("InputVerification".to_string()),
        DynSolValue::String("1".to_string()),
        DynSolValue::Uint(U256::from(chain_id), 256),
        DynSolValue::Address(verifying_contract),
        DynSolValue::FixedBytes(B256::ZERO, 32),
        DynSolValue::Array(vec![]),
    ])
    .abi_encode_params();
    json!(format!("0x{}", hex::encode(encoded)))
}

pub fn mock_instance_config() -> MockInstanceConfig {
    MockInstanceConfig {
        chain_id: 31337,
        gateway_chain_id: TEST_GATEWAY_CHAIN_ID,
        acl_contract_address: TEST_ACL_ADDRESS,
        input_verifier_contract_address: TEST_INPUT_VERIFIER_ADDRESS,
        kms_verifier_contract_address: TEST_KMS_VERIFIER_ADDRESS,
        verifying_contract_address_decryption: MOCK_DECRYPTION_VERIFYING_CONTRACT,
        verifying_contract_address_input_verification: TEST_INPUT_VERIFICATION_CONTRACT,
        input_verifier_properties: VerifierProperties::default(),
        kms_verifier_properties: VerifierProperties::default(),
    }
}

/// Sign a decryption authorization directly, bypassing the cache.
pub fn sign_authorization(
    instance: &MockFhevmInstance,
    signer: &PrivateKeySigner,
    contract_addresses: &[Address],
    start_timestamp: u64,
    duration_days: u64,
) -> DecryptionAuthorization {
    let keypair = instance.generate_keypair().unwrap();
    let typed = instance
        .create_eip712(&keypair.public_key, contract_addresses, start_timestamp, duration_days)
        .unwrap();
    let signature = signer
        .sign_hash_sync(&typed.eip712_signing_hash().unwrap())
        .unwrap();
    DecryptionAuthorization {
        public_key: keypair.public_key,
        private_key: keypair.private_key,
        signature: format!("0x{}", hex::encode(signature.as_bytes())),
        contract_addresses: contract_addresses.to_vec(),
        user_address: signer.address(),
        start_timestamp,
        duration_days,
    }
}

/// Private key signer counting signature requests, optionally refusing them.
pub struct CountingSigner {
    inner: PrivateKeySigner,
    decline: bool,
    calls: AtomicUsize,
}

impl CountingSigner {
    pub fn random() -> Self {
        Self {
            inner: PrivateKeySigner::random(),
            decline: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn declining(mut self) -> Self {
        self.decline = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Eip712Signer for CountingSigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> anyhow::Result<Signature> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.decline {
            anyhow::bail!("user rejected the request");
        }
        Eip712Signer::sign_typed_data(&self.inner, typed_data).await
    }
}

/// Injector counting injections per URL, optionally slow.
pub struct CountingInjector {
    inner: RegistryInjector,
    delay: Option<Duration>,
    injections: Mutex<HashMap<String, usize>>,
}

impl CountingInjector {
    pub fn new(inner: RegistryInjector) -> Self {
        Self {
            inner,
            delay: None,
            injections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn injections(&self, url: &str) -> usize {
        self.injections
            .lock()
            .map(|m| m.get(url).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ScriptInjector for CountingInjector {
    async fn inject(&self, url: &str, env: &SdkEnvironment) -> anyhow::Result<()> {
        if let Ok(mut injections) = self.injections.lock() {
            *injections.entry(url.to_string()).or_default() += 1;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.inject(url, env).await
    }
}

struct StubSdkState {
    sepolia_config: Value,
    init_result: AtomicBool,
    init_calls: AtomicUsize,
    create_calls: AtomicUsize,
    construction_error: Mutex<Option<String>>,
    construction_delay: Mutex<Option<Duration>>,
    last_config: Mutex<Option<FhevmInstanceConfig>>,
}

#[async_trait]
impl SdkInitializer for StubSdkState {
    async fn init_sdk(&self, _options: Option<Value>) -> anyhow::Result<bool> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self.init_result.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl InstanceConstructor for StubSdkState {
    async fn create_instance(
        &self,
        config: FhevmInstanceConfig,
    ) -> anyhow::Result<Arc<dyn FhevmInstance>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.construction_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.construction_error.lock().ok().and_then(|e| e.clone()) {
            anyhow::bail!(error);
        }
        if let Ok(mut last) = self.last_config.lock() {
            *last = Some(config);
        }
        Ok(Arc::new(StubInstance::default()))
    }
}

/// A relayer SDK whose entry points only record how they were called.
#[derive(Clone)]
pub struct StubSdk {
    state: Arc<StubSdkState>,
}

impl StubSdk {
    /// `acl` is the raw `aclContractAddress` the SDK declares.
    pub fn new(acl: Value) -> Self {
        Self {
            state: Arc::new(StubSdkState {
                sepolia_config: json!({
                    "aclContractAddress": acl,
                    "kmsContractAddress": "0x1364cBBf2cDF5032C47d8226a6f6FBD2AFCDacAC",
                    "inputVerifierContractAddress": "0x901F8942346f7AB3a01F6D7613119Bca447Bb030",
                    "chainId": 11155111,
                    "gatewayChainId": 55815,
                }),
                init_result: AtomicBool::new(true),
                init_calls: AtomicUsize::new(0),
                create_calls: AtomicUsize::new(0),
                construction_error: Mutex::new(None),
                construction_delay: Mutex::new(None),
                last_config: Mutex::new(None),
            }),
        }
    }

    pub fn with_init_result(self, result: bool) -> Self {
        self.set_init_result(result);
        self
    }

    pub fn set_init_result(&self, result: bool) {
        self.state.init_result.store(result, Ordering::SeqCst);
    }

    pub fn failing_construction(self, message: &str) -> Self {
        if let Ok(mut error) = self.state.construction_error.lock() {
            *error = Some(message.to_string());
        }
        self
    }

    pub fn with_construction_delay(self, delay: Duration) -> Self {
        if let Ok(mut d) = self.state.construction_delay.lock() {
            *d = Some(delay);
        }
        self
    }

    pub fn init_calls(&self) -> usize {
        self.state.init_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    /// Configuration passed to the last successful construction.
    pub fn last_config(&self) -> Option<FhevmInstanceConfig> {
        self.state.last_config.lock().ok().and_then(|c| c.clone())
    }

    pub fn raw(&self) -> RawRelayerSdk {
        RawRelayerSdk {
            init_sdk: Some(self.state.clone()),
            create_instance: Some(self.state.clone()),
            sepolia_config: Some(self.state.sepolia_config.clone()),
        }
    }

    pub fn factory(&self) -> SdkFactory {
        let sdk = self.clone();
        Arc::new(move || sdk.raw())
    }
}

/// Instance produced by [StubSdk]. It exposes key material but cannot encrypt or
/// decrypt.
#[derive(Default)]
pub struct StubInstance;

struct StubInputBuilder {
    bits: usize,
}

#[async_trait]
impl EncryptedInputBuilder for StubInputBuilder {
    fn add(&mut self, value: FheValue) -> anyhow::Result<()> {
        crate::instance::check_input_budget(self.bits, &value)?;
        self.bits += value.fhe_type().bits();
        Ok(())
    }

    fn bits(&self) -> usize {
        self.bits
    }

    async fn encrypt(self: Box<Self>) -> anyhow::Result<EncryptedInput> {
        anyhow::bail!("stub instance cannot encrypt")
    }
}

#[async_trait]
impl FhevmInstance for StubInstance {
    fn create_encrypted_input(
        &self,
        _contract_address: Address,
        _user_address: Address,
    ) -> Box<dyn EncryptedInputBuilder> {
        Box::new(StubInputBuilder { bits: 0 })
    }

    fn generate_keypair(&self) -> anyhow::Result<EphemeralKeyPair> {
        anyhow::bail!("stub instance has no key generation")
    }

    fn create_eip712(
        &self,
        _public_key: &str,
        _contract_addresses: &[Address],
        _start_timestamp: u64,
        _duration_days: u64,
    ) -> anyhow::Result<TypedData> {
        anyhow::bail!("stub instance has no EIP-712 support")
    }

    async fn user_decrypt(
        &self,
        _pairs: &[HandleContractPair],
        _authorization: &DecryptionAuthorization,
    ) -> anyhow::Result<DecryptedResults> {
        anyhow::bail!("stub instance cannot decrypt")
    }

    fn public_key(&self) -> Option<PublicKeyData> {
        Some(PublicKeyData {
            id: "stub-public-key".to_string(),
            data: vec![0xfe; 16],
        })
    }

    fn public_params(&self, _bits: usize) -> Option<PublicParamsData> {
        Some(PublicParamsData {
            id: "stub-public-params".to_string(),
            data: vec![0xed; 8],
        })
    }
}
