//! Local mock backend, used when the network is a development node that simulates
//! the FHEVM coprocessor, gateway and KMS itself.
use crate::consts::{DEVELOPMENT_NODE_MARKER, RPC_CLIENT_VERSION, RPC_ETH_CALL, RPC_RELAYER_METADATA};
use crate::error::{FhevmError, Result};
use crate::network::{request_typed, Eip1193Provider};
use alloy_primitives::{Address, Bytes};
use alloy_sol_types::SolCall;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod factory;
pub mod instance;

pub use factory::{MockInstanceFactory, MockInstanceParams};
pub use instance::{MockFhevmInstance, MockInstanceConfig, VerifierProperties};

/// Contract addresses a development node reports through `fhevm_relayer_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerMetadata {
    #[serde(rename = "ACLAddress")]
    pub acl_address: Address,
    #[serde(rename = "InputVerifierAddress")]
    pub input_verifier_address: Address,
    #[serde(rename = "KMSVerifierAddress")]
    pub kms_verifier_address: Address,
}

/// The parts of a contract's EIP-5267 domain that input proofs are signed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

pub async fn probe_client_version(provider: &dyn Eip1193Provider) -> Result<String> {
    request_typed(provider, RPC_CLIENT_VERSION, json!([])).await
}

pub fn is_development_node(client_version: &str) -> bool {
    client_version
        .to_lowercase()
        .contains(DEVELOPMENT_NODE_MARKER)
}

pub async fn fetch_relayer_metadata(provider: &dyn Eip1193Provider) -> Result<RelayerMetadata> {
    request_typed(provider, RPC_RELAYER_METADATA, json!([])).await
}

// EIP-5267 getter exposed by the InputVerifier contract.
alloy_sol_types::sol! {
    function eip712Domain() external view returns (
        bytes1 fields,
        string name,
        string version,
        uint256 chainId,
        address verifyingContract,
        bytes32 salt,
        uint256[] extensions
    );
}

/// Read the EIP-712 domain `contract` declares on chain via `eip712Domain()`.
///
/// On forked or mocked chains the declared chain id may differ from the one the
/// wallet reports, and proofs only verify against the declared one.
pub async fn read_declared_domain(
    provider: &dyn Eip1193Provider,
    contract: Address,
) -> Result<DeclaredDomain> {
    let call = json!([
        { "to": contract, "data": Bytes::from(eip712DomainCall {}.abi_encode()) },
        "latest"
    ]);
    let raw: Bytes = request_typed(provider, RPC_ETH_CALL, call).await?;
    let malformed = |what: &str| FhevmError::Rpc(format!("eip712Domain() of {contract}: {what}"));

    let domain =
        eip712DomainCall::abi_decode_returns(&raw).map_err(|e| malformed(&e.to_string()))?;
    let chain_id = u64::try_from(domain.chainId).map_err(|_| malformed("chainId out of range"))?;
    Ok(DeclaredDomain {
        name: domain.name,
        version: domain.version,
        chain_id,
        verifying_contract: domain.verifyingContract,
    })
}
