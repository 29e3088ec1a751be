use super::instance::{MockFhevmInstance, MockInstanceConfig, VerifierProperties};
use super::{read_declared_domain, RelayerMetadata};
use crate::consts::MOCK_DECRYPTION_VERIFYING_CONTRACT;
use crate::error::{FhevmError, Result};
use crate::instance::FhevmInstance;
use crate::network::RpcConnector;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MockInstanceParams {
    pub rpc_url: String,
    pub chain_id: u64,
    pub metadata: RelayerMetadata,
}

/// Builds [MockFhevmInstance]s for development nodes.
#[derive(Clone)]
pub struct MockInstanceFactory {
    connector: Arc<dyn RpcConnector>,
}

impl MockInstanceFactory {
    pub fn new(connector: Arc<dyn RpcConnector>) -> Self {
        Self { connector }
    }

    pub async fn create(&self, params: MockInstanceParams) -> Result<Arc<dyn FhevmInstance>> {
        let provider = self.connector.connect(&params.rpc_url)?;
        let domain =
            read_declared_domain(provider.as_ref(), params.metadata.input_verifier_address)
                .await?;
        if domain.chain_id != params.chain_id {
            tracing::info!(
                "InputVerifier declares chain id {} while the node reports {}",
                domain.chain_id,
                params.chain_id
            );
        }

        let config = MockInstanceConfig {
            chain_id: params.chain_id,
            gateway_chain_id: domain.chain_id,
            acl_contract_address: params.metadata.acl_address,
            input_verifier_contract_address: params.metadata.input_verifier_address,
            kms_verifier_contract_address: params.metadata.kms_verifier_address,
            verifying_contract_address_decryption: MOCK_DECRYPTION_VERIFYING_CONTRACT,
            verifying_contract_address_input_verification: domain.verifying_contract,
            input_verifier_properties: VerifierProperties::default(),
            kms_verifier_properties: VerifierProperties::default(),
        };
        let instance = MockFhevmInstance::new(config)
            .map_err(|e| FhevmError::ConstructionFailed(e.to_string()))?;
        tracing::info!("created mock FHEVM instance for chain {}", params.chain_id);
        Ok(Arc::new(instance))
    }
}
