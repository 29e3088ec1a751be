use crate::consts::RPC_CHAIN_ID;
use crate::error::{FhevmError, Result};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fmt, sync::Arc};

/// A request-capable provider in the style of EIP-1193: every call is a JSON-RPC
/// method name plus positional params, answered with the raw JSON result.
#[async_trait]
pub trait Eip1193Provider: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value>;
}

/// Opens a provider for a plain RPC URL.
pub trait RpcConnector: Send + Sync {
    fn connect(&self, rpc_url: &str) -> Result<Arc<dyn Eip1193Provider>>;
}

/// The network handle a caller hands to the core: either an RPC URL or an already
/// connected provider (e.g. an injected wallet).
#[derive(Clone)]
pub enum NetworkHandle {
    Url(String),
    Provider(Arc<dyn Eip1193Provider>),
}

impl NetworkHandle {
    pub fn rpc_url(&self) -> Option<&str> {
        match self {
            NetworkHandle::Url(url) => Some(url),
            NetworkHandle::Provider(_) => None,
        }
    }

    /// Returns a provider for this handle, connecting through `connector` for URLs.
    pub fn provider(&self, connector: &dyn RpcConnector) -> Result<Arc<dyn Eip1193Provider>> {
        match self {
            NetworkHandle::Url(url) => connector.connect(url),
            NetworkHandle::Provider(provider) => Ok(Arc::clone(provider)),
        }
    }
}

impl fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkHandle::Url(url) => f.debug_tuple("Url").field(url).finish(),
            NetworkHandle::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

impl From<&str> for NetworkHandle {
    fn from(url: &str) -> Self {
        NetworkHandle::Url(url.to_string())
    }
}

impl From<String> for NetworkHandle {
    fn from(url: String) -> Self {
        NetworkHandle::Url(url)
    }
}

/// JSON-RPC client over HTTP, backed by an alloy root provider.
pub struct HttpRpcClient {
    url: url::Url,
    provider: RootProvider,
}

impl HttpRpcClient {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let url = url::Url::parse(rpc_url)
            .map_err(|e| FhevmError::Rpc(format!("invalid RPC url {rpc_url}: {e}")))?;
        let provider: RootProvider = ProviderBuilder::default().connect_http(url.clone());
        Ok(Self { url, provider })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl Eip1193Provider for HttpRpcClient {
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        tracing::debug!("rpc request {method} to {}", self.url);
        let result = self
            .provider
            .raw_request::<Value, Value>(method.to_string().into(), params)
            .await?;
        Ok(result)
    }
}

/// Default connector, opening an [HttpRpcClient] per URL.
#[derive(Default, Debug, Clone, Copy)]
pub struct HttpConnector;

impl RpcConnector for HttpConnector {
    fn connect(&self, rpc_url: &str) -> Result<Arc<dyn Eip1193Provider>> {
        Ok(Arc::new(HttpRpcClient::new(rpc_url)?))
    }
}

/// Issue `method` and deserialize the JSON result into `T`.
pub async fn request_typed<T: DeserializeOwned>(
    provider: &dyn Eip1193Provider,
    method: &str,
    params: Value,
) -> Result<T> {
    let raw = provider
        .request(method, params)
        .await
        .map_err(|e| FhevmError::Rpc(format!("{method}: {e}")))?;
    serde_json::from_value(raw).map_err(|e| FhevmError::Rpc(format!("{method}: malformed result: {e}")))
}

/// Parse a JSON-RPC hex quantity such as `0x7a69`.
pub fn parse_hex_quantity(quantity: &str) -> Result<u64> {
    let digits = quantity
        .strip_prefix("0x")
        .or_else(|| quantity.strip_prefix("0X"))
        .ok_or_else(|| FhevmError::Rpc(format!("not a hex quantity: {quantity}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| FhevmError::Rpc(format!("not a hex quantity: {quantity} ({e})")))
}

/// `eth_chainId` through a provider.
pub async fn chain_id(provider: &dyn Eip1193Provider) -> Result<u64> {
    let raw: String = request_typed(provider, RPC_CHAIN_ID, Value::Array(vec![])).await?;
    parse_hex_quantity(&raw)
}
