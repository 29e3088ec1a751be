//! FHEVM instance lifecycle and decryption authorization.
//!
//! This crate resolves which backend a network handle talks to (the production
//! relayer SDK or a local mock node), loads and initializes the relayer SDK when
//! needed, caches public key material, and drives all of this through a cancellable
//! state machine. It also produces and caches the EIP-712 signed authorization that
//! every user decryption needs.
use anyhow::anyhow;
use std::{fmt, panic::Location};

pub mod authorization;
pub mod conf;
pub mod consts;
pub mod eip712;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod mock;
pub mod network;
pub mod public_key_cache;
pub mod sdk;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{FhevmError, Result};
pub use lifecycle::controller::{FhevmGoState, InstanceLifecycleController, LifecycleStatus};

#[track_caller]
pub(crate) fn anyhow_error_and_log<S: AsRef<str> + fmt::Display>(msg: S) -> anyhow::Error {
    tracing::error!("Error in {}: {}", Location::caller(), msg);
    anyhow!("Error in {}: {}", Location::caller(), msg)
}

/// Current UNIX time in seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
