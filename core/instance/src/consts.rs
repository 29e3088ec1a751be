use alloy_primitives::{address, Address};

/// Chain id of a local hardhat/anvil development node.
pub const DEFAULT_MOCK_CHAIN_ID: u64 = 31337;
pub const DEFAULT_MOCK_RPC_URL: &str = "http://localhost:8545";

/// Substring of `web3_clientVersion` identifying a development node that can serve a mock instance.
pub const DEVELOPMENT_NODE_MARKER: &str = "hardhat";

pub const SDK_CDN_URL: &str = "https://cdn.zama.ai/relayer-sdk-js/0.2.0/relayer-sdk-js.umd.cjs";
pub const SDK_LOCAL_URL: &str = "/relayer-sdk-js.umd.cjs";

// JSON-RPC methods
pub const RPC_CHAIN_ID: &str = "eth_chainId";
pub const RPC_CLIENT_VERSION: &str = "web3_clientVersion";
pub const RPC_RELAYER_METADATA: &str = "fhevm_relayer_metadata";
pub const RPC_ETH_CALL: &str = "eth_call";

/// Verifying contract of the decryption EIP-712 domain on mock nodes.
pub const MOCK_DECRYPTION_VERIFYING_CONTRACT: Address =
    address!("5ffdaAB0373E62E2ea2944776209aEf29E631A64");

/// Signing key of the coprocessor simulated by the mock instance.
/// This is a publicly known development key and must never hold funds.
pub const MOCK_COPROCESSOR_SIGNER_KEY: &str =
    "7ec8ada6642fc4ccfb7729bc29c17cf8d21b61abd5642d1db992c0b8672ab901";

/// Size of the public params the SDK hands out, in bits.
pub const PUBLIC_PARAMS_BITS: usize = 2048;

/// Maximum number of plaintext bits in a single encrypted input.
pub const MAX_INPUT_BITS: usize = 2048;

/// Handle layout version written in the last byte of a handle.
pub const HANDLE_VERSION: u8 = 0;

pub const DEFAULT_DECRYPTION_DURATION_DAYS: u64 = 365;
pub const SECONDS_PER_DAY: u64 = 86_400;

// EIP-712 domains
pub const DECRYPTION_DOMAIN_NAME: &str = "Decryption";
pub const INPUT_VERIFICATION_DOMAIN_NAME: &str = "InputVerification";
pub const EIP712_DOMAIN_VERSION: &str = "1";

// Store key prefixes
pub const PUBLIC_KEY_STORE_PREFIX: &str = "fhevm.publicKey";
pub const DECRYPTION_SIGNATURE_STORE_PREFIX: &str = "fhevm.decryptionSignature";
