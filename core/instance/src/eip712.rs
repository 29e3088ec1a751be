//! EIP-712 structs signed around FHEVM inputs and user decryptions.
use crate::consts::{
    DECRYPTION_DOMAIN_NAME, EIP712_DOMAIN_VERSION, INPUT_VERIFICATION_DOMAIN_NAME,
};
use alloy_dyn_abi::TypedData;
use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::Eip712Domain;

// Must match the InputVerification contract of the FHEVM host chain.
alloy_sol_types::sol! {
    #[derive(Debug)]
    struct CiphertextVerification {
        bytes32[] ctHandles;
        address userAddress;
        address contractAddress;
        uint256 contractChainId;
        bytes extraData;
    }
}

// Must match the Decryption contract of the gateway chain.
alloy_sol_types::sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct UserDecryptRequestVerification {
        bytes publicKey;
        address[] contractAddresses;
        uint256 startTimestamp;
        uint256 durationDays;
        bytes extraData;
    }
}

/// Extra data carried by every request; a single zero byte means "no extension".
pub fn default_extra_data() -> Bytes {
    Bytes::from_static(&[0x00])
}

pub fn decryption_domain(gateway_chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    Eip712Domain::new(
        Some(DECRYPTION_DOMAIN_NAME.into()),
        Some(EIP712_DOMAIN_VERSION.into()),
        Some(U256::from(gateway_chain_id)),
        Some(verifying_contract),
        None,
    )
}

pub fn input_verification_domain(chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    Eip712Domain::new(
        Some(INPUT_VERIFICATION_DOMAIN_NAME.into()),
        Some(EIP712_DOMAIN_VERSION.into()),
        Some(U256::from(chain_id)),
        Some(verifying_contract),
        None,
    )
}

/// Typed data a user signs to allow re-encryption of handles owned by
/// `contract_addresses` towards `public_key` (hex).
pub fn user_decrypt_typed_data(
    gateway_chain_id: u64,
    verifying_contract: Address,
    public_key: &str,
    contract_addresses: &[Address],
    start_timestamp: u64,
    duration_days: u64,
) -> anyhow::Result<TypedData> {
    let public_key = hex::decode(public_key.trim_start_matches("0x"))?;
    let message = UserDecryptRequestVerification {
        publicKey: public_key.into(),
        contractAddresses: contract_addresses.to_vec(),
        startTimestamp: U256::from(start_timestamp),
        durationDays: U256::from(duration_days),
        extraData: default_extra_data(),
    };
    Ok(TypedData::from_struct(
        &message,
        Some(decryption_domain(gateway_chain_id, verifying_contract)),
    ))
}
