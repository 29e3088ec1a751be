use crate::consts::PUBLIC_KEY_STORE_PREFIX;
use crate::instance::{PublicKeyData, PublicParamsData};
use crate::storage::KeyValueStore;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Public key and public params last seen for an ACL contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMaterial {
    pub public_key: Option<PublicKeyData>,
    pub public_params: Option<PublicParamsData>,
}

impl KeyMaterial {
    pub fn is_empty(&self) -> bool {
        self.public_key.is_none() && self.public_params.is_none()
    }
}

/// Cache of [KeyMaterial] keyed by ACL contract address.
///
/// This is purely a performance optimization: every failure degrades into a miss.
#[derive(Clone)]
pub struct PublicKeyCache {
    store: Option<Arc<dyn KeyValueStore>>,
}

impl PublicKeyCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    fn key(acl_address: &Address) -> String {
        format!("{PUBLIC_KEY_STORE_PREFIX}.{}", acl_address.to_string().to_lowercase())
    }

    pub async fn get(&self, acl_address: &Address) -> KeyMaterial {
        let Some(store) = &self.store else {
            return KeyMaterial::default();
        };
        let key = Self::key(acl_address);
        match store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<KeyMaterial>(&raw) {
                Ok(material) => {
                    tracing::debug!("public key cache hit for {acl_address}");
                    material
                }
                Err(e) => {
                    tracing::warn!("ignoring unreadable cached key material for {acl_address}: {e}");
                    KeyMaterial::default()
                }
            },
            Ok(None) => {
                tracing::debug!("public key cache miss for {acl_address}");
                KeyMaterial::default()
            }
            Err(e) => {
                tracing::warn!("public key cache read failed for {acl_address}: {e}");
                KeyMaterial::default()
            }
        }
    }

    /// Replace the whole record for `acl_address`.
    pub async fn set(
        &self,
        acl_address: &Address,
        public_key: Option<PublicKeyData>,
        public_params: Option<PublicParamsData>,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let material = KeyMaterial {
            public_key,
            public_params,
        };
        let raw = match serde_json::to_string(&material) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("could not encode key material for {acl_address}: {e}");
                return;
            }
        };
        if let Err(e) = store.set(&Self::key(acl_address), raw).await {
            tracing::warn!("public key cache write failed for {acl_address}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ram::FailingRamStore;
    use crate::storage::RamStore;
    use alloy_primitives::address;

    const ACL: Address = address!("687820221192C5B662b25367F70076A37bc79b6c");

    fn material() -> (PublicKeyData, PublicParamsData) {
        (
            PublicKeyData {
                id: "pk".to_string(),
                data: vec![1, 2, 3],
            },
            PublicParamsData {
                id: "pp".to_string(),
                data: vec![4, 5],
            },
        )
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = PublicKeyCache::new(Arc::new(RamStore::default()));
        assert!(cache.get(&ACL).await.is_empty());
        let (pk, pp) = material();
        cache.set(&ACL, Some(pk.clone()), Some(pp.clone())).await;
        let got = cache.get(&ACL).await;
        assert_eq!(got.public_key, Some(pk));
        assert_eq!(got.public_params, Some(pp));
    }

    #[tokio::test]
    async fn set_replaces_wholesale() {
        let cache = PublicKeyCache::new(Arc::new(RamStore::default()));
        let (pk, pp) = material();
        cache.set(&ACL, Some(pk.clone()), Some(pp)).await;
        cache.set(&ACL, Some(pk.clone()), None).await;
        let got = cache.get(&ACL).await;
        assert_eq!(got.public_key, Some(pk));
        assert_eq!(got.public_params, None);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let store = Arc::new(RamStore::default());
        store
            .set(&PublicKeyCache::key(&ACL), "{not json".to_string())
            .await
            .unwrap();
        let cache = PublicKeyCache::new(store);
        assert!(cache.get(&ACL).await.is_empty());
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let cache = PublicKeyCache::new(Arc::new(FailingRamStore::new(0)));
        let (pk, pp) = material();
        cache.set(&ACL, Some(pk), Some(pp)).await;
        assert!(cache.get(&ACL).await.is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_always_misses() {
        let cache = PublicKeyCache::disabled();
        let (pk, pp) = material();
        cache.set(&ACL, Some(pk), Some(pp)).await;
        assert!(cache.get(&ACL).await.is_empty());
    }
}
