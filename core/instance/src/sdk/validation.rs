use super::{RawRelayerSdk, RelayerSdk};
use serde_json::Value;
use std::sync::Arc;

/// Outcome of checking the shape of an installed SDK global.
pub enum SdkValidation {
    Valid(RelayerSdk),
    Invalid(String),
}

impl SdkValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, SdkValidation::Valid(_))
    }
}

impl std::fmt::Debug for SdkValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdkValidation::Valid(_) => f.write_str("Valid"),
            SdkValidation::Invalid(reason) => f.debug_tuple("Invalid").field(reason).finish(),
        }
    }
}

/// Check that `raw` exposes `initSDK` and `createInstance` as callables and a
/// `SepoliaConfig` object. Failures are logged and reported as
/// [SdkValidation::Invalid], never raised.
pub fn validate_sdk(raw: &RawRelayerSdk) -> SdkValidation {
    let invalid = |reason: &str| {
        tracing::warn!("relayer SDK invalid: {reason}");
        SdkValidation::Invalid(reason.to_string())
    };
    let Some(initializer) = &raw.init_sdk else {
        return invalid("missing initSDK");
    };
    let Some(constructor) = &raw.create_instance else {
        return invalid("missing createInstance");
    };
    let sepolia_config = match &raw.sepolia_config {
        None | Some(Value::Null) => return invalid("missing SepoliaConfig"),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return invalid("SepoliaConfig is not an object"),
    };
    SdkValidation::Valid(RelayerSdk {
        initializer: Arc::clone(initializer),
        constructor: Arc::clone(constructor),
        sepolia_config,
    })
}
