//! Command line driver for the FHEVM core: resolve a network, obtain an instance,
//! sign decryption authorizations, encrypt inputs and user-decrypt handles.
use alloy_primitives::{Address, B256};
use alloy_signer_local::PrivateKeySigner;
use clap::{Args, Parser, Subcommand};
use fhevm_instance::authorization::DecryptionAuthorizationManager;
use fhevm_instance::conf::FhevmConfig;
use fhevm_instance::instance::{FhevmInstance, HandleContractPair};
use fhevm_instance::lifecycle::{create_fhevm_instance, CreateInstanceParams, InstanceBackends};
use fhevm_instance::network::{resolve, HttpConnector, NetworkHandle, RpcConnector};
use fhevm_instance::public_key_cache::PublicKeyCache;
use fhevm_instance::sdk::{RegistryInjector, SdkEnvironment, SdkLoader};
use fhevm_instance::storage::make_store;
use fhevm_instance::{InstanceLifecycleController, LifecycleStatus};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use validator::Validate;

pub mod crypto;

#[derive(Debug, Args, Clone, Validate)]
pub struct NetworkParameters {
    /// RPC URL of the node to talk to
    #[clap(long, short = 'n')]
    #[validate(url)]
    pub network: String,
}

#[derive(Debug, Args, Clone)]
pub struct SignerParameters {
    /// Hex encoded secp256k1 key of the user
    #[clap(long, short = 'k')]
    pub private_key: String,
}

impl SignerParameters {
    pub fn signer(&self) -> anyhow::Result<PrivateKeySigner> {
        PrivateKeySigner::from_str(&self.private_key)
            .map_err(|e| anyhow::anyhow!("invalid private key: {e}"))
    }
}

#[derive(Debug, Parser, Clone)]
pub struct SignParameters {
    #[command(flatten)]
    pub network: NetworkParameters,
    #[command(flatten)]
    pub signer: SignerParameters,
    /// Contracts the authorization grants decryption for
    #[clap(long = "contract", short = 'c', required = true)]
    pub contracts: Vec<Address>,
}

#[derive(Debug, Parser, Clone)]
pub struct EncryptParameters {
    #[command(flatten)]
    pub network: NetworkParameters,
    #[command(flatten)]
    pub signer: SignerParameters,
    /// Contract the input is bound to
    #[clap(long, short = 'c')]
    pub contract: Address,
    /// 64-bit plaintexts to encrypt
    #[clap(long = "value", short = 'v', required = true)]
    pub values: Vec<u64>,
}

#[derive(Debug, Parser, Clone)]
pub struct DecryptParameters {
    #[command(flatten)]
    pub network: NetworkParameters,
    #[command(flatten)]
    pub signer: SignerParameters,
    /// Contract owning the handles
    #[clap(long, short = 'c')]
    pub contract: Address,
    /// Handles to decrypt
    #[clap(long = "handle")]
    pub handles: Vec<B256>,
    /// Plaintexts to encrypt first and decrypt along with the handles. A mock node
    /// only knows cleartexts encrypted by the same process.
    #[clap(long = "value", short = 'v')]
    pub values: Vec<u64>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CCCommand {
    /// Print the chain id behind a network and whether it is served by a mock node
    Resolve(NetworkParameters),
    /// Drive the lifecycle controller until it settles and print every status
    CreateInstance(NetworkParameters),
    /// Load or sign a decryption authorization
    Sign(SignParameters),
    Encrypt(EncryptParameters),
    Decrypt(DecryptParameters),
}

#[derive(Debug, Parser, Clone)]
#[clap(name = "fhevm-core-client")]
pub struct CmdConfig {
    /// Path to the configuration file
    #[clap(long, short = 'f')]
    pub config: Option<String>,
    /// The command to execute
    #[clap(subcommand)]
    pub command: CCCommand,
    /// Whether to print logs or not
    #[clap(long, short = 'l')]
    pub logs: bool,
}

/// Everything a command needs, built once from the configuration.
pub struct CoreContext {
    pub conf: FhevmConfig,
    pub backends: InstanceBackends,
    pub authorizations: DecryptionAuthorizationManager,
}

impl CoreContext {
    pub async fn new(conf: FhevmConfig, connector: Arc<dyn RpcConnector>) -> anyhow::Result<Self> {
        // No script runtime here: the relayer SDK can only come from registered
        // builds, and none are registered.
        let env = Arc::new(SdkEnvironment::new(Arc::new(RegistryInjector::default())));
        let sdk_loader = SdkLoader::with_sources(env, &conf.sdk.cdn_url, &conf.sdk.local_url);
        let public_keys = PublicKeyCache::new(make_store(&conf.public_key_store).await?);
        let authorizations = DecryptionAuthorizationManager::new(
            make_store(&conf.signature_store).await?,
        )
        .with_duration_days(conf.decryption.duration_days);
        Ok(Self {
            backends: InstanceBackends::new(connector, sdk_loader, public_keys),
            authorizations,
            conf,
        })
    }

    /// One-shot instance creation, logging the statuses it goes through.
    pub async fn instance(&self, network: &str) -> anyhow::Result<Arc<dyn FhevmInstance>> {
        let params = CreateInstanceParams {
            network: NetworkHandle::from(network),
            mock_chains: self.conf.mock_chains(),
            sdk_init_options: None,
        };
        let on_status = |status: LifecycleStatus| tracing::info!("instance status: {status}");
        let instance =
            create_fhevm_instance(params, &self.backends, &CancellationToken::new(), &on_status)
                .await?;
        Ok(instance)
    }
}

async fn resolve_cmd(ctx: &CoreContext, params: &NetworkParameters) -> anyhow::Result<Value> {
    let resolution = resolve(
        &NetworkHandle::from(params.network.as_str()),
        ctx.conf.mock_chains().as_ref(),
        ctx.backends.connector.as_ref(),
    )
    .await?;
    Ok(serde_json::to_value(resolution)?)
}

async fn create_instance_cmd(
    ctx: &CoreContext,
    params: &NetworkParameters,
) -> anyhow::Result<Value> {
    let controller =
        InstanceLifecycleController::with_options(ctx.backends.clone(), ctx.conf.mock_chains(), None);
    let mut rx = controller.subscribe();
    controller.set_network(Some(NetworkHandle::from(params.network.as_str())), None);

    let mut seen: Vec<LifecycleStatus> = Vec::new();
    loop {
        let status = *rx.borrow_and_update();
        if seen.last() != Some(&status) {
            tracing::info!("controller status: {status}");
            seen.push(status);
        }
        if status.is_settled() || rx.changed().await.is_err() {
            break;
        }
    }

    if let Some(error) = controller.error() {
        anyhow::bail!("instance creation failed: {error}");
    }
    Ok(json!({
        "status": controller.status().to_string(),
        "statuses": seen.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "ready": controller.instance().is_some(),
    }))
}

/// Execute `cmd_config.command` with the given configuration, reaching nodes
/// through `connector`.
pub async fn execute_cmd_with(
    cmd_config: &CmdConfig,
    conf: FhevmConfig,
    connector: Arc<dyn RpcConnector>,
) -> anyhow::Result<Value> {
    let command = &cmd_config.command;
    tracing::info!("Starting command: {:?}", command);
    let ctx = CoreContext::new(conf, connector).await?;

    match command {
        CCCommand::Resolve(params) => {
            params.validate()?;
            resolve_cmd(&ctx, params).await
        }
        CCCommand::CreateInstance(params) => {
            params.validate()?;
            create_instance_cmd(&ctx, params).await
        }
        CCCommand::Sign(params) => {
            params.network.validate()?;
            crypto::sign_cmd(&ctx, params).await
        }
        CCCommand::Encrypt(params) => {
            params.network.validate()?;
            crypto::encrypt_cmd(&ctx, params).await
        }
        CCCommand::Decrypt(params) => {
            params.network.validate()?;
            crypto::decrypt_cmd(&ctx, params).await
        }
    }
}

/// Load the configuration named on the command line and execute the command over
/// HTTP.
pub async fn execute_cmd(cmd_config: &CmdConfig, conf: FhevmConfig) -> anyhow::Result<Value> {
    execute_cmd_with(cmd_config, conf, Arc::new(HttpConnector)).await
}

pub(crate) fn pairs_for(contract: Address, handles: &[B256]) -> Vec<HandleContractPair> {
    handles
        .iter()
        .map(|handle| HandleContractPair {
            handle: *handle,
            contract_address: contract,
        })
        .collect()
}
