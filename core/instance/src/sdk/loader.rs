use super::validation::{validate_sdk, SdkValidation};
use super::{RawRelayerSdk, RelayerSdk};
use crate::consts::{SDK_CDN_URL, SDK_LOCAL_URL};
use crate::error::{FhevmError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;

/// Host facility that fetches and evaluates an SDK source. Evaluating a working
/// source installs the SDK global into the environment it was injected into.
#[async_trait]
pub trait ScriptInjector: Send + Sync {
    async fn inject(&self, url: &str, env: &SdkEnvironment) -> anyhow::Result<()>;
}

type LoadTag = Arc<OnceCell<std::result::Result<(), String>>>;

/// The environment hosting the relayer SDK: the installed global, the sources that
/// were already injected, and whether the SDK has been initialized.
///
/// One environment is normally shared by the whole process; tests build their own.
pub struct SdkEnvironment {
    global: RwLock<Option<RawRelayerSdk>>,
    load_tags: Mutex<HashMap<String, LoadTag>>,
    initialized: OnceCell<()>,
    injector: Option<Arc<dyn ScriptInjector>>,
}

impl SdkEnvironment {
    pub fn new(injector: Arc<dyn ScriptInjector>) -> Self {
        Self {
            global: RwLock::new(None),
            load_tags: Mutex::new(HashMap::new()),
            initialized: OnceCell::new(),
            injector: Some(injector),
        }
    }

    /// An environment that cannot load sources. An SDK can still be installed
    /// directly, e.g. when it is linked into the binary.
    pub fn detached() -> Self {
        Self {
            global: RwLock::new(None),
            load_tags: Mutex::new(HashMap::new()),
            initialized: OnceCell::new(),
            injector: None,
        }
    }

    /// Install (or replace) the SDK global.
    pub fn install(&self, raw: RawRelayerSdk) {
        match self.global.write() {
            Ok(mut guard) => *guard = Some(raw),
            Err(poisoned) => *poisoned.into_inner() = Some(raw),
        }
    }

    pub fn installed(&self) -> Option<RawRelayerSdk> {
        match self.global.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Run the SDK's `initSDK` unless a previous call already succeeded. Concurrent
    /// callers wait for the call in flight. A failed call leaves the environment
    /// uninitialized so a later attempt can retry.
    pub async fn initialize(&self, sdk: &RelayerSdk, options: Option<Value>) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                tracing::info!("initializing relayer SDK");
                match sdk.initializer.init_sdk(options).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(FhevmError::SdkInitFailed(
                        "initSDK reported failure".to_string(),
                    )),
                    Err(e) => Err(FhevmError::SdkInitFailed(e.to_string())),
                }
            })
            .await
            .map(|_| ())
    }

    fn load_tag(&self, url: &str) -> LoadTag {
        let mut tags = match self.load_tags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(tags.entry(url.to_string()).or_default())
    }

    /// Whether `url` was already injected into this environment, successfully or not.
    pub fn was_injected(&self, url: &str) -> bool {
        match self.load_tags.lock() {
            Ok(tags) => tags.get(url).is_some_and(|tag| tag.initialized()),
            Err(poisoned) => poisoned
                .into_inner()
                .get(url)
                .is_some_and(|tag| tag.initialized()),
        }
    }
}

/// Loads the relayer SDK into an [SdkEnvironment] from a primary source, falling
/// back to a secondary one.
#[derive(Clone)]
pub struct SdkLoader {
    env: Arc<SdkEnvironment>,
    primary_url: String,
    fallback_url: String,
}

impl SdkLoader {
    pub fn new(env: Arc<SdkEnvironment>) -> Self {
        Self::with_sources(env, SDK_CDN_URL, SDK_LOCAL_URL)
    }

    pub fn with_sources(env: Arc<SdkEnvironment>, primary_url: &str, fallback_url: &str) -> Self {
        Self {
            env,
            primary_url: primary_url.to_string(),
            fallback_url: fallback_url.to_string(),
        }
    }

    pub fn environment(&self) -> &Arc<SdkEnvironment> {
        &self.env
    }

    /// Whether a structurally valid SDK is installed.
    pub fn is_loaded(&self) -> bool {
        match self.env.installed() {
            Some(raw) => validate_sdk(&raw).is_valid(),
            None => {
                tracing::debug!("relayer SDK is not installed");
                false
            }
        }
    }

    /// Make sure a valid SDK is installed and return it.
    pub async fn load(&self) -> Result<RelayerSdk> {
        if let Some(raw) = self.env.installed() {
            return match validate_sdk(&raw) {
                SdkValidation::Valid(sdk) => Ok(sdk),
                SdkValidation::Invalid(reason) => Err(FhevmError::SdkShapeInvalid(reason)),
            };
        }
        let Some(injector) = self.env.injector.clone() else {
            return Err(FhevmError::EnvironmentInvalid(
                "the relayer SDK can only be loaded in an environment able to inject scripts"
                    .to_string(),
            ));
        };

        match self.try_load(injector.as_ref(), &self.primary_url).await {
            Ok(sdk) => Ok(sdk),
            Err(primary_err) => {
                tracing::warn!("{primary_err}, trying {}", self.fallback_url);
                self.try_load(injector.as_ref(), &self.fallback_url)
                    .await
                    .map_err(|fallback_err| {
                        FhevmError::SdkLoadFailed(format!("{primary_err}; {fallback_err}"))
                    })
            }
        }
    }

    async fn try_load(
        &self,
        injector: &dyn ScriptInjector,
        url: &str,
    ) -> std::result::Result<RelayerSdk, String> {
        let tag = self.env.load_tag(url);
        if tag.initialized() {
            tracing::debug!("{url} already injected, validating only");
        }
        let injected = tag
            .get_or_init(|| async {
                tracing::info!("injecting relayer SDK from {url}");
                injector
                    .inject(url, &self.env)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;
        if let Err(e) = injected {
            return Err(format!("failed to load {url}: {e}"));
        }
        match self.env.installed() {
            None => Err(format!("relayerSDK missing after loading {url}")),
            Some(raw) => match validate_sdk(&raw) {
                SdkValidation::Valid(sdk) => Ok(sdk),
                SdkValidation::Invalid(reason) => {
                    Err(format!("relayerSDK invalid after loading {url}: {reason}"))
                }
            },
        }
    }
}

pub type SdkFactory = Arc<dyn Fn() -> RawRelayerSdk + Send + Sync>;

/// Injector backed by SDK builds registered per source URL, e.g. a copy bundled
/// with the application. Unknown URLs fail the way an unreachable source would.
#[derive(Default, Clone)]
pub struct RegistryInjector {
    sources: HashMap<String, SdkFactory>,
}

impl RegistryInjector {
    pub fn with_source(mut self, url: &str, factory: SdkFactory) -> Self {
        self.sources.insert(url.to_string(), factory);
        self
    }
}

#[async_trait]
impl ScriptInjector for RegistryInjector {
    async fn inject(&self, url: &str, env: &SdkEnvironment) -> anyhow::Result<()> {
        let factory = self
            .sources
            .get(url)
            .ok_or_else(|| anyhow::anyhow!("no source registered for {url}"))?;
        env.install(factory());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingInjector, StubSdk};
    use serde_json::json;

    const ACL: &str = "0x687820221192C5B662b25367F70076A37bc79b6c";
    const PRIMARY: &str = "https://cdn.example/sdk.js";
    const FALLBACK: &str = "/sdk.js";

    fn loader(injector: Arc<CountingInjector>) -> SdkLoader {
        SdkLoader::with_sources(Arc::new(SdkEnvironment::new(injector)), PRIMARY, FALLBACK)
    }

    #[test]
    fn nothing_installed_is_not_loaded() {
        let loader = loader(Arc::new(CountingInjector::new(RegistryInjector::default())));
        assert!(!loader.is_loaded());
    }

    #[tokio::test]
    async fn detached_environment_cannot_load() {
        let loader = SdkLoader::new(Arc::new(SdkEnvironment::detached()));
        assert!(matches!(
            loader.load().await,
            Err(FhevmError::EnvironmentInvalid(_))
        ));
    }

    #[tokio::test]
    async fn detached_environment_accepts_installed_sdk() {
        let env = Arc::new(SdkEnvironment::detached());
        env.install(StubSdk::new(json!(ACL)).raw());
        let loader = SdkLoader::new(env);
        assert!(loader.is_loaded());
        assert!(loader.load().await.is_ok());
    }

    #[tokio::test]
    async fn missing_create_instance_is_not_loaded_and_never_initialized() {
        let stub = StubSdk::new(json!(ACL));
        let env = Arc::new(SdkEnvironment::detached());
        let mut raw = stub.raw();
        raw.create_instance = None;
        env.install(raw);
        let loader = SdkLoader::new(Arc::clone(&env));
        assert!(!loader.is_loaded());
        assert!(matches!(
            loader.load().await,
            Err(FhevmError::SdkShapeInvalid(_))
        ));
        assert_eq!(stub.init_calls(), 0);
        assert!(!env.is_initialized());
    }

    #[tokio::test]
    async fn primary_source_is_used_first() {
        let stub = StubSdk::new(json!(ACL));
        let injector = Arc::new(CountingInjector::new(
            RegistryInjector::default()
                .with_source(PRIMARY, stub.factory())
                .with_source(FALLBACK, stub.factory()),
        ));
        let loader = loader(Arc::clone(&injector));
        loader.load().await.unwrap();
        assert!(loader.is_loaded());
        assert_eq!(injector.injections(PRIMARY), 1);
        assert_eq!(injector.injections(FALLBACK), 0);
    }

    #[tokio::test]
    async fn falls_back_when_primary_fails() {
        let stub = StubSdk::new(json!(ACL));
        let injector = Arc::new(CountingInjector::new(
            RegistryInjector::default().with_source(FALLBACK, stub.factory()),
        ));
        let loader = loader(Arc::clone(&injector));
        loader.load().await.unwrap();
        assert_eq!(injector.injections(PRIMARY), 1);
        assert_eq!(injector.injections(FALLBACK), 1);
    }

    #[tokio::test]
    async fn falls_back_when_primary_installs_a_broken_sdk() {
        let stub = StubSdk::new(json!(ACL));
        let broken: SdkFactory = Arc::new(|| RawRelayerSdk::default());
        let injector = Arc::new(CountingInjector::new(
            RegistryInjector::default()
                .with_source(PRIMARY, broken)
                .with_source(FALLBACK, stub.factory()),
        ));
        let loader = loader(Arc::clone(&injector));
        loader.load().await.unwrap();
        assert_eq!(injector.injections(FALLBACK), 1);
    }

    #[tokio::test]
    async fn both_sources_failing_is_fatal() {
        let injector = Arc::new(CountingInjector::new(RegistryInjector::default()));
        let loader = loader(Arc::clone(&injector));
        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, FhevmError::SdkLoadFailed(_)));
        assert!(err.to_string().contains(PRIMARY));
        assert!(err.to_string().contains(FALLBACK));
    }

    #[tokio::test]
    async fn concurrent_loads_inject_once() {
        let stub = StubSdk::new(json!(ACL));
        let injector = Arc::new(
            CountingInjector::new(RegistryInjector::default().with_source(PRIMARY, stub.factory()))
                .with_delay(std::time::Duration::from_millis(20)),
        );
        let loader = loader(Arc::clone(&injector));
        let (a, b) = tokio::join!(loader.load(), loader.load());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(injector.injections(PRIMARY), 1);
        assert!(loader.environment().was_injected(PRIMARY));
        assert!(!loader.environment().was_injected(FALLBACK));
    }

    #[tokio::test]
    async fn initialization_is_idempotent() {
        let stub = StubSdk::new(json!(ACL));
        let env = Arc::new(SdkEnvironment::detached());
        env.install(stub.raw());
        let sdk = SdkLoader::new(Arc::clone(&env)).load().await.unwrap();
        let (a, b) = tokio::join!(env.initialize(&sdk, None), env.initialize(&sdk, None));
        a.unwrap();
        b.unwrap();
        env.initialize(&sdk, None).await.unwrap();
        assert!(env.is_initialized());
        assert_eq!(stub.init_calls(), 1);
    }

    #[tokio::test]
    async fn failed_initialization_can_be_retried() {
        let stub = StubSdk::new(json!(ACL)).with_init_result(false);
        let env = Arc::new(SdkEnvironment::detached());
        env.install(stub.raw());
        let sdk = SdkLoader::new(Arc::clone(&env)).load().await.unwrap();
        assert!(matches!(
            env.initialize(&sdk, None).await,
            Err(FhevmError::SdkInitFailed(_))
        ));
        assert!(!env.is_initialized());

        stub.set_init_result(true);
        env.initialize(&sdk, None).await.unwrap();
        assert!(env.is_initialized());
        assert_eq!(stub.init_calls(), 2);
    }
}
