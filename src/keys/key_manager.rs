// src/keys/key_manager.rs

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::keys::key_fetcher::KeyFetcher;
use crate::keys::EncryptionKey;

/// 多协调方支持的配置面
#[derive(Debug, Clone)]
pub struct CoordinatorPolicy {
    /// 关闭时忽略请求里的协调方参数，一律使用默认协调方
    pub multi_cloud_enabled: bool,
    pub default_coordinator_origin: String,
    pub coordinator_allowlist: Vec<String>,
    /// 缓存过期后是否允许按需回源刷新；缓存为空时总是允许拉取
    pub refresh_keys_on_expiry: bool,
}

/// 协调方公钥管理器
///
/// 每个协调方一份缓存；同一协调方的回源刷新串行化（避免并发重复
/// 拉取），不同协调方互不阻塞。
pub struct EncryptionKeyManager {
    policy: CoordinatorPolicy,
    fetcher: Arc<dyn KeyFetcher>,
    cache: RwLock<HashMap<String, Vec<EncryptionKey>>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EncryptionKeyManager {
    pub fn new(policy: CoordinatorPolicy, fetcher: Arc<dyn KeyFetcher>) -> Self {
        Self {
            policy,
            fetcher,
            cache: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 白名单前置校验：多云开启时，调用方给的协调方必须在名单内。
    /// 任何网络访问之前执行。
    pub fn resolve_coordinator(&self, requested: Option<&str>) -> ExchangeResult<String> {
        if !self.policy.multi_cloud_enabled {
            // 功能关闭时调用方传什么都不生效
            return Ok(self.policy.default_coordinator_origin.clone());
        }
        match requested {
            None => Ok(self.policy.default_coordinator_origin.clone()),
            Some(origin) => {
                if self
                    .policy
                    .coordinator_allowlist
                    .iter()
                    .any(|allowed| allowed == origin)
                {
                    Ok(origin.to_string())
                } else {
                    Err(ExchangeError::invalid_argument(format!(
                        "coordinator origin {origin} is not in the allowlist"
                    )))
                }
            }
        }
    }

    fn latest_active_cached(&self, coordinator: &str, now: DateTime<Utc>) -> Option<EncryptionKey> {
        self.cache
            .read()
            .get(coordinator)?
            .iter()
            .filter(|key| key.is_active(now))
            .max_by_key(|key| key.expiry)
            .cloned()
    }

    fn cache_is_empty(&self, coordinator: &str) -> bool {
        self.cache
            .read()
            .get(coordinator)
            .map(|keys| keys.is_empty())
            .unwrap_or(true)
    }

    fn refresh_lock(&self, coordinator: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(coordinator.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 取该协调方当前可用的 key；必要（且允许）时回源刷新
    pub async fn active_key(
        &self,
        coordinator: &str,
        now: DateTime<Utc>,
    ) -> ExchangeResult<EncryptionKey> {
        if let Some(key) = self.latest_active_cached(coordinator, now) {
            return Ok(key);
        }

        if !self.policy.refresh_keys_on_expiry && !self.cache_is_empty(coordinator) {
            return Err(ExchangeError::internal(format!(
                "no active encryption key for {coordinator} and on-demand refresh is disabled"
            )));
        }

        let lock = self.refresh_lock(coordinator);
        let _guard = lock.lock().await;
        // 拿到锁后再查一次：前一个持锁请求可能已经刷新过了
        if let Some(key) = self.latest_active_cached(coordinator, now) {
            return Ok(key);
        }

        match self.fetcher.fetch_keys(coordinator).await {
            Ok(keys) => {
                info!("Fetched {} encryption keys for {}", keys.len(), coordinator);
                let mut cache = self.cache.write();
                let entry = cache.entry(coordinator.to_string()).or_default();
                entry.extend(keys);
                // 顺手清掉彻底过期的旧 key，缓存有界
                entry.retain(|key| key.is_active(now));
                entry
                    .iter()
                    .filter(|key| key.is_active(now))
                    .max_by_key(|key| key.expiry)
                    .cloned()
                    .ok_or_else(|| {
                        ExchangeError::internal(format!(
                            "coordinator {coordinator} returned no active keys"
                        ))
                    })
            }
            Err(fetch_error) => {
                // 回源失败：仍有未过期缓存就继续用，否则请求失败
                warn!("Key fetch for {} failed: {}", coordinator, fetch_error);
                self.latest_active_cached(coordinator, now)
                    .ok_or(fetch_error)
            }
        }
    }

    /// 直接塞入缓存（启动预热、测试）
    pub fn insert_keys(&self, coordinator: &str, keys: Vec<EncryptionKey>) {
        self.cache
            .write()
            .entry(coordinator.to_string())
            .or_default()
            .extend(keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key_fetcher::KeyFetcher;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ORIGIN: &str = "https://coordinator.example";

    fn key(id: u8, expiry_offset_secs: i64) -> EncryptionKey {
        EncryptionKey {
            coordinator_origin: ORIGIN.into(),
            key_id: id,
            public_key: [id; 32],
            expiry: Utc::now() + Duration::seconds(expiry_offset_secs),
        }
    }

    struct StaticKeyFetcher {
        keys: Vec<EncryptionKey>,
        calls: AtomicUsize,
        delay_ms: u64,
    }

    impl StaticKeyFetcher {
        fn new(keys: Vec<EncryptionKey>) -> Self {
            Self {
                keys,
                calls: AtomicUsize::new(0),
                delay_ms: 0,
            }
        }
    }

    #[async_trait]
    impl KeyFetcher for StaticKeyFetcher {
        async fn fetch_keys(&self, _origin: &str) -> ExchangeResult<Vec<EncryptionKey>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.keys.is_empty() {
                Err(ExchangeError::internal("fetch failed"))
            } else {
                Ok(self.keys.clone())
            }
        }
    }

    fn policy(multi_cloud: bool, refresh: bool) -> CoordinatorPolicy {
        CoordinatorPolicy {
            multi_cloud_enabled: multi_cloud,
            default_coordinator_origin: ORIGIN.into(),
            coordinator_allowlist: vec![ORIGIN.into()],
            refresh_keys_on_expiry: refresh,
        }
    }

    #[tokio::test]
    async fn picks_the_latest_expiring_active_key() {
        let manager = EncryptionKeyManager::new(
            policy(false, true),
            Arc::new(StaticKeyFetcher::new(vec![])),
        );
        manager.insert_keys(ORIGIN, vec![key(1, 60), key(2, 3600), key(3, -10)]);

        let selected = manager.active_key(ORIGIN, Utc::now()).await.unwrap();
        assert_eq!(selected.key_id, 2);
    }

    #[tokio::test]
    async fn empty_cache_triggers_a_fetch_even_without_refresh_flag() {
        let fetcher = Arc::new(StaticKeyFetcher::new(vec![key(9, 3600)]));
        let manager = EncryptionKeyManager::new(policy(false, false), fetcher.clone());

        let selected = manager.active_key(ORIGIN, Utc::now()).await.unwrap();
        assert_eq!(selected.key_id, 9);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // 第二次直接命中缓存
        manager.active_key(ORIGIN, Utc::now()).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cache_without_refresh_flag_fails_without_network() {
        let fetcher = Arc::new(StaticKeyFetcher::new(vec![key(9, 3600)]));
        let manager = EncryptionKeyManager::new(policy(false, false), fetcher.clone());
        manager.insert_keys(ORIGIN, vec![key(1, -60)]);

        assert!(manager.active_key(ORIGIN, Utc::now()).await.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_cache_with_refresh_flag_fetches_a_new_key() {
        let fetcher = Arc::new(StaticKeyFetcher::new(vec![key(9, 3600)]));
        let manager = EncryptionKeyManager::new(policy(false, true), fetcher.clone());
        manager.insert_keys(ORIGIN, vec![key(1, -60)]);

        let selected = manager.active_key(ORIGIN, Utc::now()).await.unwrap();
        assert_eq!(selected.key_id, 9);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_with_no_usable_cache_fails_the_request() {
        let fetcher = Arc::new(StaticKeyFetcher::new(vec![]));
        let manager = EncryptionKeyManager::new(policy(false, true), fetcher);
        assert!(manager.active_key(ORIGIN, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let mut fetcher = StaticKeyFetcher::new(vec![key(5, 3600)]);
        fetcher.delay_ms = 50;
        let fetcher = Arc::new(fetcher);
        let manager = Arc::new(EncryptionKeyManager::new(policy(false, true), fetcher.clone()));

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.active_key(ORIGIN, Utc::now()).await }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.active_key(ORIGIN, Utc::now()).await }
        });
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allowlist_is_enforced_before_any_network_access() {
        let manager = EncryptionKeyManager::new(
            policy(true, true),
            Arc::new(StaticKeyFetcher::new(vec![])),
        );
        assert_eq!(manager.resolve_coordinator(None).unwrap(), ORIGIN);
        assert_eq!(manager.resolve_coordinator(Some(ORIGIN)).unwrap(), ORIGIN);
        assert!(matches!(
            manager.resolve_coordinator(Some("https://random-url")),
            Err(ExchangeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn coordinator_argument_is_ignored_when_multi_cloud_is_off() {
        let manager = EncryptionKeyManager::new(
            policy(false, true),
            Arc::new(StaticKeyFetcher::new(vec![])),
        );
        assert_eq!(
            manager.resolve_coordinator(Some("a/b/c")).unwrap(),
            ORIGIN
        );
    }
}
