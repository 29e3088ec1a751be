use super::rpc::{chain_id, NetworkHandle, RpcConnector};
use crate::consts::{DEFAULT_MOCK_CHAIN_ID, DEFAULT_MOCK_RPC_URL};
use crate::error::{FhevmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Chain ids served by a local mock node, mapped to the RPC URL of that node.
pub type MockChains = BTreeMap<u64, String>;

/// Outcome of resolving a network handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResolution {
    pub is_mock: bool,
    pub chain_id: u64,
    pub rpc_url: Option<String>,
}

/// Built-in mock table overlaid with the caller's entries. Caller entries win on
/// equal chain ids; the default entry stays otherwise.
pub fn merge_mock_chains(caller: Option<&MockChains>) -> MockChains {
    let mut merged = MockChains::from([(DEFAULT_MOCK_CHAIN_ID, DEFAULT_MOCK_RPC_URL.to_string())]);
    if let Some(caller) = caller {
        merged.extend(caller.iter().map(|(id, url)| (*id, url.clone())));
    }
    merged
}

/// Determine the chain id behind `handle` and whether it is served by a mock node.
///
/// This performs a single `eth_chainId` round trip and no network mutation.
pub async fn resolve(
    handle: &NetworkHandle,
    mock_chains: Option<&MockChains>,
    connector: &dyn RpcConnector,
) -> Result<ChainResolution> {
    let provider = handle.provider(connector)?;
    let chain_id = chain_id(provider.as_ref()).await?;
    let mut rpc_url = handle.rpc_url().map(str::to_string);

    let merged = merge_mock_chains(mock_chains);
    let Some(table_url) = merged.get(&chain_id) else {
        tracing::debug!("chain {chain_id} is not a mock chain");
        return Ok(ChainResolution {
            is_mock: false,
            chain_id,
            rpc_url,
        });
    };
    if rpc_url.is_none() {
        rpc_url = Some(table_url.clone());
    }
    if rpc_url.as_deref().map_or(true, str::is_empty) {
        return Err(FhevmError::Rpc(format!(
            "mock chain {chain_id} has no usable RPC url"
        )));
    }
    tracing::debug!("chain {chain_id} resolved as mock chain at {:?}", rpc_url);
    Ok(ChainResolution {
        is_mock: true,
        chain_id,
        rpc_url,
    })
}
