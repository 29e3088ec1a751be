//! The contract every FHE instance fulfils, whether it comes from the relayer SDK or
//! from the local mock.
use crate::authorization::DecryptionAuthorization;
use crate::consts::MAX_INPUT_BITS;
use alloy_dyn_abi::TypedData;
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumIter};

/// FHE types that can be encrypted as inputs, with their on-chain type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum FheType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uint128,
    Address,
    Uint256,
}

impl FheType {
    pub fn code(&self) -> u8 {
        match self {
            FheType::Bool => 0,
            FheType::Uint8 => 2,
            FheType::Uint16 => 3,
            FheType::Uint32 => 4,
            FheType::Uint64 => 5,
            FheType::Uint128 => 6,
            FheType::Address => 7,
            FheType::Uint256 => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use strum::IntoEnumIterator;
        FheType::iter().find(|t| t.code() == code)
    }

    pub fn bits(&self) -> usize {
        match self {
            FheType::Bool => 2,
            FheType::Uint8 => 8,
            FheType::Uint16 => 16,
            FheType::Uint32 => 32,
            FheType::Uint64 => 64,
            FheType::Uint128 => 128,
            FheType::Address => 160,
            FheType::Uint256 => 256,
        }
    }
}

/// A plaintext queued for encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FheValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    Address(Address),
    U256(U256),
}

impl FheValue {
    pub fn fhe_type(&self) -> FheType {
        match self {
            FheValue::Bool(_) => FheType::Bool,
            FheValue::U8(_) => FheType::Uint8,
            FheValue::U16(_) => FheType::Uint16,
            FheValue::U32(_) => FheType::Uint32,
            FheValue::U64(_) => FheType::Uint64,
            FheValue::U128(_) => FheType::Uint128,
            FheValue::Address(_) => FheType::Address,
            FheValue::U256(_) => FheType::Uint256,
        }
    }

    pub fn to_clear(&self) -> ClearValue {
        match *self {
            FheValue::Bool(b) => ClearValue::Bool(b),
            FheValue::U8(v) => ClearValue::Uint(U256::from(v)),
            FheValue::U16(v) => ClearValue::Uint(U256::from(v)),
            FheValue::U32(v) => ClearValue::Uint(U256::from(v)),
            FheValue::U64(v) => ClearValue::Uint(U256::from(v)),
            FheValue::U128(v) => ClearValue::Uint(U256::from(v)),
            FheValue::Address(a) => ClearValue::Address(a),
            FheValue::U256(v) => ClearValue::Uint(v),
        }
    }
}

/// A decrypted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClearValue {
    Bool(bool),
    Address(Address),
    Uint(U256),
}

impl std::fmt::Display for ClearValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClearValue::Bool(b) => write!(f, "{b}"),
            ClearValue::Uint(v) => write!(f, "{v}"),
            ClearValue::Address(a) => write!(f, "{a}"),
        }
    }
}

/// Result of encrypting an input: one handle per added value plus the proof the
/// InputVerifier contract checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedInput {
    pub handles: Vec<B256>,
    pub input_proof: Bytes,
}

/// Accumulates typed plaintexts for one (contract, user) pair.
#[async_trait]
pub trait EncryptedInputBuilder: Send {
    /// Queue a value. Fails when the input would exceed [MAX_INPUT_BITS].
    fn add(&mut self, value: FheValue) -> anyhow::Result<()>;

    /// Bits already queued.
    fn bits(&self) -> usize;

    async fn encrypt(self: Box<Self>) -> anyhow::Result<EncryptedInput>;

    fn add_bool(&mut self, value: bool) -> anyhow::Result<()> {
        self.add(FheValue::Bool(value))
    }

    fn add32(&mut self, value: u32) -> anyhow::Result<()> {
        self.add(FheValue::U32(value))
    }

    fn add64(&mut self, value: u64) -> anyhow::Result<()> {
        self.add(FheValue::U64(value))
    }
}

/// Reject `value` if adding it to `current_bits` would overflow a single input.
pub fn check_input_budget(current_bits: usize, value: &FheValue) -> anyhow::Result<()> {
    let bits = value.fhe_type().bits();
    if current_bits + bits > MAX_INPUT_BITS {
        anyhow::bail!(
            "packing {} ({bits} bits) exceeds the {MAX_INPUT_BITS} bit limit of an input ({current_bits} bits used)",
            value.fhe_type()
        );
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleContractPair {
    pub handle: B256,
    pub contract_address: Address,
}

/// Ephemeral key pair used to receive re-encrypted decryption results. Both halves
/// are hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralKeyPair {
    pub public_key: String,
    pub private_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyData {
    pub id: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicParamsData {
    pub id: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

pub type DecryptedResults = HashMap<B256, ClearValue>;

/// An FHE instance able to encrypt inputs and user-decrypt handles.
#[async_trait]
pub trait FhevmInstance: Send + Sync {
    fn create_encrypted_input(
        &self,
        contract_address: Address,
        user_address: Address,
    ) -> Box<dyn EncryptedInputBuilder>;

    fn generate_keypair(&self) -> anyhow::Result<EphemeralKeyPair>;

    /// EIP-712 payload the user signs to grant decryption of handles owned by
    /// `contract_addresses`, valid for `duration_days` from `start_timestamp`.
    fn create_eip712(
        &self,
        public_key: &str,
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u64,
    ) -> anyhow::Result<TypedData>;

    async fn user_decrypt(
        &self,
        pairs: &[HandleContractPair],
        authorization: &DecryptionAuthorization,
    ) -> anyhow::Result<DecryptedResults>;

    fn public_key(&self) -> Option<PublicKeyData>;

    fn public_params(&self, bits: usize) -> Option<PublicParamsData>;
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
