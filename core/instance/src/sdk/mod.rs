//! The externally loaded relayer SDK.
//!
//! The SDK arrives as an untyped global installed by whatever source was loaded into
//! the hosting [SdkEnvironment]. [validate_sdk] is the only place that inspects its
//! shape; everything downstream works with the typed [RelayerSdk] handle.
use crate::instance::{FhevmInstance, PublicKeyData, PublicParamsData};
use crate::network::NetworkHandle;
use alloy_primitives::Address;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod loader;
pub mod validation;

pub use loader::{RegistryInjector, ScriptInjector, SdkEnvironment, SdkLoader};
pub use validation::{validate_sdk, SdkValidation};

/// The SDK's `initSDK` entry point. Returns whether initialization succeeded.
#[async_trait]
pub trait SdkInitializer: Send + Sync {
    async fn init_sdk(&self, options: Option<Value>) -> anyhow::Result<bool>;
}

/// The SDK's `createInstance` entry point.
#[async_trait]
pub trait InstanceConstructor: Send + Sync {
    async fn create_instance(
        &self,
        config: FhevmInstanceConfig,
    ) -> anyhow::Result<Arc<dyn FhevmInstance>>;
}

/// The global object a loaded SDK source installs, before any validation.
/// Members a broken source failed to define are `None`.
#[derive(Clone, Default)]
pub struct RawRelayerSdk {
    pub init_sdk: Option<Arc<dyn SdkInitializer>>,
    pub create_instance: Option<Arc<dyn InstanceConstructor>>,
    pub sepolia_config: Option<Value>,
}

/// A structurally valid relayer SDK.
#[derive(Clone)]
pub struct RelayerSdk {
    pub(crate) initializer: Arc<dyn SdkInitializer>,
    pub(crate) constructor: Arc<dyn InstanceConstructor>,
    pub(crate) sepolia_config: Map<String, Value>,
}

impl RelayerSdk {
    /// The network configuration the SDK ships with.
    pub fn sepolia_config(&self) -> &Map<String, Value> {
        &self.sepolia_config
    }

    /// The raw ACL address declared by the SDK configuration, if any.
    pub fn declared_acl_address(&self) -> Option<&Value> {
        self.sepolia_config.get("aclContractAddress")
    }

    pub async fn create_instance(
        &self,
        config: FhevmInstanceConfig,
    ) -> anyhow::Result<Arc<dyn FhevmInstance>> {
        self.constructor.create_instance(config).await
    }
}

impl std::fmt::Debug for RelayerSdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayerSdk")
            .field("sepolia_config", &self.sepolia_config)
            .finish_non_exhaustive()
    }
}

/// Configuration handed to the SDK instance constructor: the SDK's own declared
/// configuration, overridden by the caller's network and any cached key material.
#[derive(Clone, Debug)]
pub struct FhevmInstanceConfig {
    pub sdk_config: Map<String, Value>,
    pub network: NetworkHandle,
    pub acl_contract_address: Address,
    pub public_key: Option<PublicKeyData>,
    pub public_params: Option<PublicParamsData>,
}
