//! Signed, time-bounded grants that let a user decrypt handles of a set of
//! contracts, and the cache that lets one grant serve many decryptions.
use crate::anyhow_error_and_log;
use crate::consts::{
    DECRYPTION_SIGNATURE_STORE_PREFIX, DEFAULT_DECRYPTION_DURATION_DAYS, SECONDS_PER_DAY,
};
use crate::error::{FhevmError, Result};
use crate::instance::{DecryptedResults, FhevmInstance, HandleContractPair};
use crate::storage::KeyValueStore;
use crate::unix_now;
use alloy_dyn_abi::TypedData;
use alloy_primitives::{keccak256, Address, Signature};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Everything needed to user-decrypt handles of `contract_addresses`: the ephemeral
/// key pair the results are re-encrypted to, and the user's EIP-712 signature over
/// the grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionAuthorization {
    pub public_key: String,
    pub private_key: String,
    pub signature: String,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    pub start_timestamp: u64,
    pub duration_days: u64,
}

impl DecryptionAuthorization {
    /// Last second (UNIX time) at which the grant is still valid.
    pub fn expires_at(&self) -> u64 {
        self.start_timestamp
            .saturating_add(self.duration_days.saturating_mul(SECONDS_PER_DAY))
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        now <= self.expires_at()
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining_validity(&self, now: u64) -> Option<Duration> {
        self.is_valid_at(now)
            .then(|| Duration::from_secs(self.expires_at() - now))
    }

    /// Whether the grant covers exactly the given set of contracts.
    pub fn covers(&self, contract_addresses: &[Address]) -> bool {
        normalize_addresses(&self.contract_addresses) == normalize_addresses(contract_addresses)
    }
}

/// Sorted, deduplicated copy of `addresses`.
pub fn normalize_addresses(addresses: &[Address]) -> Vec<Address> {
    addresses.iter().copied().sorted().dedup().collect()
}

/// Anything able to sign EIP-712 typed data on behalf of an address, e.g. a wallet.
#[async_trait]
pub trait Eip712Signer: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_typed_data(&self, typed_data: &TypedData) -> anyhow::Result<Signature>;
}

#[async_trait]
impl Eip712Signer for PrivateKeySigner {
    fn address(&self) -> Address {
        PrivateKeySigner::address(self)
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> anyhow::Result<Signature> {
        let hash = typed_data.eip712_signing_hash()?;
        Ok(self.sign_hash_sync(&hash)?)
    }
}

pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Loads a cached [DecryptionAuthorization] for a (user, contract set) pair, or asks
/// the signer for a fresh one and caches it.
#[derive(Clone)]
pub struct DecryptionAuthorizationManager {
    store: Arc<dyn KeyValueStore>,
    duration_days: u64,
    clock: Clock,
}

impl DecryptionAuthorizationManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            duration_days: DEFAULT_DECRYPTION_DURATION_DAYS,
            clock: Arc::new(unix_now),
        }
    }

    pub fn with_duration_days(mut self, duration_days: u64) -> Self {
        self.duration_days = duration_days;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn duration_days(&self) -> u64 {
        self.duration_days
    }

    /// `fhevm.decryptionSignature.<user>.<keccak256 of the normalized contract set>`
    pub fn storage_key(user_address: &Address, contract_addresses: &[Address]) -> String {
        let mut preimage = Vec::with_capacity(contract_addresses.len() * 20);
        for address in normalize_addresses(contract_addresses) {
            preimage.extend_from_slice(address.as_slice());
        }
        format!(
            "{DECRYPTION_SIGNATURE_STORE_PREFIX}.{}.{}",
            user_address.to_string().to_lowercase(),
            hex::encode(keccak256(&preimage))
        )
    }

    async fn load(&self, key: &str) -> Option<DecryptionAuthorization> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(authorization) => Some(authorization),
                Err(e) => {
                    tracing::warn!("ignoring unreadable decryption authorization {key}: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("could not read decryption authorization {key}: {e}");
                None
            }
        }
    }

    /// Return a valid authorization for `signer` over `contract_addresses`, signing a
    /// new one only when no cached grant is usable.
    pub async fn load_or_sign(
        &self,
        instance: &dyn FhevmInstance,
        contract_addresses: &[Address],
        signer: &dyn Eip712Signer,
    ) -> Result<DecryptionAuthorization> {
        let contracts = normalize_addresses(contract_addresses);
        if contracts.is_empty() {
            return Err(FhevmError::Other(anyhow_error_and_log(
                "a decryption authorization needs at least one contract address",
            )));
        }
        let user_address = signer.address();
        let key = Self::storage_key(&user_address, &contracts);
        let now = (self.clock)();

        if let Some(cached) = self.load(&key).await {
            if cached.user_address == user_address
                && cached.covers(&contracts)
                && cached.is_valid_at(now)
            {
                tracing::debug!("reusing decryption authorization {key}");
                return Ok(cached);
            }
            tracing::debug!("cached decryption authorization {key} is stale");
        }

        let keypair = instance.generate_keypair()?;
        let typed_data =
            instance.create_eip712(&keypair.public_key, &contracts, now, self.duration_days)?;
        let signature = signer
            .sign_typed_data(&typed_data)
            .await
            .map_err(|e| FhevmError::SigningDeclined(e.to_string()))?;

        let authorization = DecryptionAuthorization {
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
            contract_addresses: contracts,
            user_address,
            start_timestamp: now,
            duration_days: self.duration_days,
        };
        match serde_json::to_string(&authorization) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&key, raw).await {
                    tracing::warn!("could not persist decryption authorization {key}: {e}");
                }
            }
            Err(e) => tracing::warn!("could not encode decryption authorization {key}: {e}"),
        }
        tracing::info!(
            "signed new decryption authorization for {user_address} valid {} days",
            self.duration_days
        );
        Ok(authorization)
    }

    /// Decrypt `pairs` for `signer`, signing an authorization first if needed.
    pub async fn user_decrypt(
        &self,
        instance: &dyn FhevmInstance,
        pairs: &[HandleContractPair],
        signer: &dyn Eip712Signer,
    ) -> Result<DecryptedResults> {
        let contracts: Vec<Address> = pairs.iter().map(|p| p.contract_address).collect();
        let authorization = self.load_or_sign(instance, &contracts, signer).await?;
        Ok(instance.user_decrypt(pairs, &authorization).await?)
    }
}
