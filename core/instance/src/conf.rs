use crate::consts::{DEFAULT_DECRYPTION_DURATION_DAYS, SDK_CDN_URL, SDK_LOCAL_URL};
use crate::network::MockChains;
use observability::conf::{Settings, TelemetryConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::{Validate, ValidationError};

pub const ENV_PREFIX: &str = "FHEVM";

/// Where cached key material and authorizations live.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConf {
    #[default]
    Ram,
    File { path: PathBuf },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct MockChainConf {
    pub chain_id: u64,
    #[validate(url)]
    pub rpc_url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct SdkSourceConf {
    #[validate(length(min = 1))]
    pub cdn_url: String,
    #[validate(length(min = 1))]
    pub local_url: String,
}

impl Default for SdkSourceConf {
    fn default() -> Self {
        Self {
            cdn_url: SDK_CDN_URL.to_string(),
            local_url: SDK_LOCAL_URL.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct DecryptionConf {
    /// Validity window of a freshly signed authorization.
    #[validate(range(min = 1))]
    pub duration_days: u64,
}

impl Default for DecryptionConf {
    fn default() -> Self {
        Self {
            duration_days: DEFAULT_DECRYPTION_DURATION_DAYS,
        }
    }
}

fn validate_unique_mock_chains(chains: &[MockChainConf]) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    if chains.iter().all(|c| seen.insert(c.chain_id)) {
        Ok(())
    } else {
        Err(ValidationError::new("duplicate_mock_chain_id"))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct FhevmConfig {
    /// Chains served by a local development node, on top of the built-in
    /// `31337 -> http://localhost:8545`.
    #[serde(default)]
    #[validate(nested, custom(function = "validate_unique_mock_chains"))]
    pub mock_chains: Vec<MockChainConf>,
    #[serde(default)]
    #[validate(nested)]
    pub sdk: SdkSourceConf,
    #[serde(default)]
    #[validate(nested)]
    pub decryption: DecryptionConf,
    #[serde(default)]
    pub public_key_store: StoreConf,
    #[serde(default)]
    pub signature_store: StoreConf,
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: Option<TelemetryConfig>,
}

impl FhevmConfig {
    /// Configured mock chains as a lookup table. Later entries would win, but
    /// validation rejects duplicates.
    pub fn mock_chains(&self) -> Option<MockChains> {
        if self.mock_chains.is_empty() {
            return None;
        }
        Some(
            self.mock_chains
                .iter()
                .map(|c| (c.chain_id, c.rpc_url.clone()))
                .collect(),
        )
    }
}

/// Load and validate the configuration from the usual layered sources, with `path`
/// as an optional explicit file.
pub fn init_conf(path: Option<&str>) -> anyhow::Result<FhevmConfig> {
    let settings = match path {
        Some(path) => Settings::builder().path(path).env_prefix(ENV_PREFIX).build(),
        None => Settings::builder().env_prefix(ENV_PREFIX).build(),
    };
    let conf: FhevmConfig = settings.init_conf()?;
    conf.validate()?;
    Ok(conf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(dir: &tempfile::TempDir, content: &str) -> String {
        let path = dir.path().join("fhevm.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn full_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_conf(
            &dir,
            r#"
[[mock_chains]]
chain_id = 1337
rpc_url = "http://127.0.0.1:8546"

[sdk]
cdn_url = "https://example.org/sdk.js"
local_url = "/sdk.js"

[decryption]
duration_days = 7

[public_key_store]
type = "file"
path = "/tmp/fhevm/public-keys"

[signature_store]
type = "ram"

[telemetry]
tracing_service_name = "fhevm-cli"
log_filter = "debug"
"#,
        );
        let conf = init_conf(Some(path.as_str())).unwrap();
        assert_eq!(
            conf.mock_chains(),
            Some(MockChains::from([(1337, "http://127.0.0.1:8546".to_string())]))
        );
        assert_eq!(conf.sdk.local_url, "/sdk.js");
        assert_eq!(conf.decryption.duration_days, 7);
        assert_eq!(
            conf.public_key_store,
            StoreConf::File {
                path: PathBuf::from("/tmp/fhevm/public-keys")
            }
        );
        assert_eq!(conf.signature_store, StoreConf::Ram);
        assert_eq!(conf.telemetry.unwrap().log_filter(), Some("debug"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_conf(&dir, "");
        let conf = init_conf(Some(path.as_str())).unwrap();
        assert_eq!(conf, FhevmConfig::default());
        assert_eq!(conf.mock_chains(), None);
        assert_eq!(conf.sdk.cdn_url, SDK_CDN_URL);
        assert_eq!(conf.decryption.duration_days, DEFAULT_DECRYPTION_DURATION_DAYS);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let zero_days = write_conf(&dir, "[decryption]\nduration_days = 0\n");
        assert!(init_conf(Some(zero_days.as_str())).is_err());

        let duplicated = write_conf(
            &dir,
            r#"
[[mock_chains]]
chain_id = 5
rpc_url = "http://a:8545"
[[mock_chains]]
chain_id = 5
rpc_url = "http://b:8545"
"#,
        );
        assert!(init_conf(Some(duplicated.as_str())).is_err());

        let bad_url = write_conf(
            &dir,
            "[[mock_chains]]\nchain_id = 5\nrpc_url = \"not a url\"\n",
        );
        assert!(init_conf(Some(bad_url.as_str())).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_conf(&dir, "[decryption]\nduration_days = 3\nfoo = 1\n");
        assert!(init_conf(Some(path.as_str())).is_err());
    }
}
