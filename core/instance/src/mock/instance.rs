use crate::authorization::DecryptionAuthorization;
use crate::consts::{HANDLE_VERSION, MOCK_COPROCESSOR_SIGNER_KEY};
use crate::eip712::{
    default_extra_data, input_verification_domain, user_decrypt_typed_data,
    CiphertextVerification,
};
use crate::instance::{
    check_input_budget, ClearValue, DecryptedResults, EncryptedInput, EncryptedInputBuilder,
    EphemeralKeyPair, FheValue, FhevmInstance, HandleContractPair, PublicKeyData,
    PublicParamsData,
};
use crate::unix_now;
use alloy_dyn_abi::TypedData;
use alloy_primitives::{keccak256, Address, Bytes, Signature, B256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{Eip712Domain, SolStruct};
use async_trait::async_trait;
use ml_kem::{EncodedSizeUser, KemCore, MlKem512};
use rand::RngCore;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Overrides for the behaviour of a simulated verifier contract. The defaults
/// reproduce what a development node expects.
#[derive(Debug, Clone, Default)]
pub struct VerifierProperties {
    /// Hex private keys of the simulated signers. Empty means the well-known
    /// development key.
    pub signer_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MockInstanceConfig {
    pub chain_id: u64,
    pub gateway_chain_id: u64,
    pub acl_contract_address: Address,
    pub input_verifier_contract_address: Address,
    pub kms_verifier_contract_address: Address,
    pub verifying_contract_address_decryption: Address,
    pub verifying_contract_address_input_verification: Address,
    pub input_verifier_properties: VerifierProperties,
    pub kms_verifier_properties: VerifierProperties,
}

type CleartextDb = Arc<RwLock<HashMap<B256, ClearValue>>>;

fn signers_from(properties: &VerifierProperties) -> anyhow::Result<Vec<PrivateKeySigner>> {
    if properties.signer_keys.is_empty() {
        return Ok(vec![PrivateKeySigner::from_str(MOCK_COPROCESSOR_SIGNER_KEY)?]);
    }
    properties
        .signer_keys
        .iter()
        .map(|key| Ok(PrivateKeySigner::from_str(key)?))
        .collect()
}

/// A fully local FHE instance. Nothing is actually encrypted: cleartexts are kept
/// in memory under the handles they were given, and decryption checks the caller's
/// authorization before handing them back.
pub struct MockFhevmInstance {
    config: MockInstanceConfig,
    coprocessor_signers: Vec<PrivateKeySigner>,
    cleartexts: CleartextDb,
}

impl MockFhevmInstance {
    pub fn new(config: MockInstanceConfig) -> anyhow::Result<Self> {
        let coprocessor_signers = signers_from(&config.input_verifier_properties)?;
        Ok(Self {
            config,
            coprocessor_signers,
            cleartexts: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &MockInstanceConfig {
        &self.config
    }

    /// Addresses whose signatures end up in input proofs.
    pub fn coprocessor_signers(&self) -> Vec<Address> {
        self.coprocessor_signers.iter().map(|s| s.address()).collect()
    }

    fn input_domain(&self) -> Eip712Domain {
        input_verification_domain(
            self.config.gateway_chain_id,
            self.config.verifying_contract_address_input_verification,
        )
    }

    fn lookup(&self, handle: &B256) -> anyhow::Result<ClearValue> {
        let db = self
            .cleartexts
            .read()
            .map_err(|e| anyhow::anyhow!("poisoned cleartext db: {e}"))?;
        db.get(handle)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown handle {handle}"))
    }

    fn check_authorization(&self, authorization: &DecryptionAuthorization) -> anyhow::Result<()> {
        let now = unix_now();
        if !authorization.is_valid_at(now) {
            anyhow::bail!(
                "decryption authorization expired ({} days from {})",
                authorization.duration_days,
                authorization.start_timestamp
            );
        }
        let typed = self.create_eip712(
            &authorization.public_key,
            &authorization.contract_addresses,
            authorization.start_timestamp,
            authorization.duration_days,
        )?;
        let hash = typed.eip712_signing_hash()?;
        let raw = hex::decode(authorization.signature.trim_start_matches("0x"))?;
        let signature = Signature::from_raw(&raw)?;
        let signer = signature.recover_address_from_prehash(&hash)?;
        if signer != authorization.user_address {
            anyhow::bail!(
                "authorization signed by {signer}, expected {}",
                authorization.user_address
            );
        }
        Ok(())
    }
}

/// Handle layout: 21 bytes of digest, index, 8 byte chain id, type code, version.
pub(crate) fn compute_handle(
    ciphertext_digest: &B256,
    index: u8,
    acl_address: &Address,
    chain_id: u64,
    value: &FheValue,
) -> B256 {
    let mut preimage = Vec::with_capacity(32 + 1 + 20 + 8);
    preimage.extend_from_slice(ciphertext_digest.as_slice());
    preimage.push(index);
    preimage.extend_from_slice(acl_address.as_slice());
    preimage.extend_from_slice(&chain_id.to_be_bytes());
    let digest = keccak256(&preimage);

    let mut handle = [0u8; 32];
    handle[..21].copy_from_slice(&digest[..21]);
    handle[21] = index;
    handle[22..30].copy_from_slice(&chain_id.to_be_bytes());
    handle[30] = value.fhe_type().code();
    handle[31] = HANDLE_VERSION;
    B256::from(handle)
}

fn encode_value(value: &FheValue) -> Vec<u8> {
    let mut out = vec![value.fhe_type().code()];
    match value.to_clear() {
        ClearValue::Bool(b) => out.push(u8::from(b)),
        ClearValue::Address(a) => out.extend_from_slice(a.as_slice()),
        ClearValue::Uint(v) => out.extend_from_slice(&v.to_be_bytes::<32>()),
    }
    out
}

struct MockInputBuilder {
    contract_address: Address,
    user_address: Address,
    chain_id: u64,
    acl_address: Address,
    domain: Eip712Domain,
    signers: Vec<PrivateKeySigner>,
    cleartexts: CleartextDb,
    values: Vec<FheValue>,
    bits: usize,
}

#[async_trait]
impl EncryptedInputBuilder for MockInputBuilder {
    fn add(&mut self, value: FheValue) -> anyhow::Result<()> {
        check_input_budget(self.bits, &value)?;
        if self.values.len() >= u8::MAX as usize {
            anyhow::bail!("too many values in a single input");
        }
        self.bits += value.fhe_type().bits();
        self.values.push(value);
        Ok(())
    }

    fn bits(&self) -> usize {
        self.bits
    }

    async fn encrypt(self: Box<Self>) -> anyhow::Result<EncryptedInput> {
        if self.values.is_empty() {
            anyhow::bail!("cannot encrypt an empty input");
        }
        let mut nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let mut preimage = nonce.to_vec();
        preimage.extend_from_slice(self.contract_address.as_slice());
        preimage.extend_from_slice(self.user_address.as_slice());
        for value in &self.values {
            preimage.extend(encode_value(value));
        }
        let ciphertext_digest = keccak256(&preimage);

        let handles: Vec<B256> = self
            .values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                compute_handle(
                    &ciphertext_digest,
                    i as u8,
                    &self.acl_address,
                    self.chain_id,
                    value,
                )
            })
            .collect();

        let payload = CiphertextVerification {
            ctHandles: handles.clone(),
            userAddress: self.user_address,
            contractAddress: self.contract_address,
            contractChainId: U256::from(self.chain_id),
            extraData: default_extra_data(),
        };
        let hash = payload.eip712_signing_hash(&self.domain);

        let mut proof = vec![handles.len() as u8, self.signers.len() as u8];
        for handle in &handles {
            proof.extend_from_slice(handle.as_slice());
        }
        for signer in &self.signers {
            let signature = signer.sign_hash_sync(&hash)?;
            proof.extend_from_slice(&signature.as_bytes());
        }
        proof.extend_from_slice(&default_extra_data());

        {
            let mut db = self
                .cleartexts
                .write()
                .map_err(|e| anyhow::anyhow!("poisoned cleartext db: {e}"))?;
            for (handle, value) in handles.iter().zip(&self.values) {
                db.insert(*handle, value.to_clear());
            }
        }
        tracing::debug!(
            "mock-encrypted {} values for {} on {}",
            handles.len(),
            self.user_address,
            self.contract_address
        );
        Ok(EncryptedInput {
            handles,
            input_proof: Bytes::from(proof),
        })
    }
}

#[async_trait]
impl FhevmInstance for MockFhevmInstance {
    fn create_encrypted_input(
        &self,
        contract_address: Address,
        user_address: Address,
    ) -> Box<dyn EncryptedInputBuilder> {
        Box::new(MockInputBuilder {
            contract_address,
            user_address,
            chain_id: self.config.chain_id,
            acl_address: self.config.acl_contract_address,
            domain: self.input_domain(),
            signers: self.coprocessor_signers.clone(),
            cleartexts: Arc::clone(&self.cleartexts),
            values: Vec::new(),
            bits: 0,
        })
    }

    fn generate_keypair(&self) -> anyhow::Result<EphemeralKeyPair> {
        let (decapsulation_key, encapsulation_key) = MlKem512::generate(&mut rand::rngs::OsRng);
        Ok(EphemeralKeyPair {
            public_key: format!("0x{}", hex::encode(encapsulation_key.as_bytes())),
            private_key: format!("0x{}", hex::encode(decapsulation_key.as_bytes())),
        })
    }

    fn create_eip712(
        &self,
        public_key: &str,
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u64,
    ) -> anyhow::Result<TypedData> {
        user_decrypt_typed_data(
            self.config.gateway_chain_id,
            self.config.verifying_contract_address_decryption,
            public_key,
            contract_addresses,
            start_timestamp,
            duration_days,
        )
    }

    async fn user_decrypt(
        &self,
        pairs: &[HandleContractPair],
        authorization: &DecryptionAuthorization,
    ) -> anyhow::Result<DecryptedResults> {
        self.check_authorization(authorization)?;
        let mut results = DecryptedResults::with_capacity(pairs.len());
        for pair in pairs {
            if !authorization
                .contract_addresses
                .contains(&pair.contract_address)
            {
                anyhow::bail!(
                    "contract {} is not covered by the decryption authorization",
                    pair.contract_address
                );
            }
            results.insert(pair.handle, self.lookup(&pair.handle)?);
        }
        Ok(results)
    }

    fn public_key(&self) -> Option<PublicKeyData> {
        None
    }

    fn public_params(&self, _bits: usize) -> Option<PublicParamsData> {
        None
    }
}
