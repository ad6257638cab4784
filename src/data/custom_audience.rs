// src/data/custom_audience.rs

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::adtech::AdTechIdentifier;
use crate::model::custom_audience::CustomAudience;

/// 自定义受众仓库接口
///
/// 三个查询分别服务于：出站候选收集、胜出广告主键定位、
/// owner 缺失时的 (buyer, name) 兜底检索。
pub trait CustomAudienceStore: Send + Sync {
    fn active_custom_audiences(&self, now: DateTime<Utc>) -> Vec<CustomAudience>;

    fn custom_audience_by_primary_key(
        &self,
        owner: &str,
        buyer: &AdTechIdentifier,
        name: &str,
    ) -> Option<CustomAudience>;

    fn custom_audiences_for_buyer_and_name(
        &self,
        buyer: &AdTechIdentifier,
        name: &str,
    ) -> Vec<CustomAudience>;
}

/// 内存实现（逻辑形状与生产库一致，测试与单机部署共用）
#[derive(Default)]
pub struct InMemoryCustomAudienceStore {
    audiences: RwLock<Vec<CustomAudience>>,
}

impl InMemoryCustomAudienceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, audience: CustomAudience) {
        let mut audiences = self.audiences.write();
        // 主键 (owner, buyer, name) 去重，后写覆盖
        audiences.retain(|ca| {
            !(ca.owner == audience.owner && ca.buyer == audience.buyer && ca.name == audience.name)
        });
        audiences.push(audience);
    }

    pub fn len(&self) -> usize {
        self.audiences.read().len()
    }
}

impl CustomAudienceStore for InMemoryCustomAudienceStore {
    fn active_custom_audiences(&self, now: DateTime<Utc>) -> Vec<CustomAudience> {
        self.audiences
            .read()
            .iter()
            .filter(|ca| ca.is_active(now))
            .cloned()
            .collect()
    }

    fn custom_audience_by_primary_key(
        &self,
        owner: &str,
        buyer: &AdTechIdentifier,
        name: &str,
    ) -> Option<CustomAudience> {
        self.audiences
            .read()
            .iter()
            .find(|ca| ca.owner == owner && &ca.buyer == buyer && ca.name == name)
            .cloned()
    }

    fn custom_audiences_for_buyer_and_name(
        &self,
        buyer: &AdTechIdentifier,
        name: &str,
    ) -> Vec<CustomAudience> {
        self.audiences
            .read()
            .iter()
            .filter(|ca| &ca.buyer == buyer && ca.name == name)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn audience(owner: &str, buyer: &str, name: &str, expired: bool) -> CustomAudience {
        let now = Utc::now();
        CustomAudience {
            owner: owner.into(),
            buyer: AdTechIdentifier::new(buyer),
            name: name.into(),
            activation_time: now - Duration::hours(1),
            expiration_time: if expired {
                now - Duration::minutes(1)
            } else {
                now + Duration::hours(1)
            },
            priority: 0.0,
            trusted_bidding_keys: vec![],
            user_bidding_signals: String::new(),
            ads: vec![],
        }
    }

    #[test]
    fn active_query_excludes_expired_audiences() {
        let store = InMemoryCustomAudienceStore::new();
        store.insert(audience("o1", "buyer.com", "fresh", false));
        store.insert(audience("o1", "buyer.com", "stale", true));

        let active = store.active_custom_audiences(Utc::now());
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "fresh");
    }

    #[test]
    fn primary_key_lookup_and_fuzzy_lookup() {
        let store = InMemoryCustomAudienceStore::new();
        let buyer = AdTechIdentifier::new("buyer.com");
        store.insert(audience("owner-1", "buyer.com", "shoes", false));
        store.insert(audience("owner-2", "buyer.com", "shoes", false));
        store.insert(audience("owner-1", "buyer.com", "hats", false));

        assert!(store
            .custom_audience_by_primary_key("owner-2", &buyer, "shoes")
            .is_some());
        assert!(store
            .custom_audience_by_primary_key("owner-3", &buyer, "shoes")
            .is_none());
        assert_eq!(
            store.custom_audiences_for_buyer_and_name(&buyer, "shoes").len(),
            2
        );
    }

    #[test]
    fn insert_replaces_on_primary_key() {
        let store = InMemoryCustomAudienceStore::new();
        store.insert(audience("o", "buyer.com", "shoes", false));
        store.insert(audience("o", "buyer.com", "shoes", false));
        assert_eq!(store.len(), 1);
    }
}
