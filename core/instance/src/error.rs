use thiserror::Error;

/// Error type for instance creation and decryption authorization.
#[derive(Debug, Error)]
pub enum FhevmError {
    /// The attempt was superseded or explicitly cancelled. The controller absorbs this
    /// variant and never reports it as an error.
    #[error("FHEVM operation was cancelled")]
    Cancelled,

    #[error("Environment invalid: {0}")]
    EnvironmentInvalid(String),

    #[error("Relayer SDK shape invalid: {0}")]
    SdkShapeInvalid(String),

    #[error("Relayer SDK load failed: {0}")]
    SdkLoadFailed(String),

    #[error("Relayer SDK initialization failed: {0}")]
    SdkInitFailed(String),

    #[error("Invalid ACL address: {0}")]
    AddressInvalid(String),

    #[error("Instance construction failed: {0}")]
    ConstructionFailed(String),

    #[error("Signature request declined: {0}")]
    SigningDeclined(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FhevmError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FhevmError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, FhevmError>;
