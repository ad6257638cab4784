// src/data/app_install.rs

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::model::adtech::AdTechIdentifier;

/// 应用安装登记：记录哪些买方可以按某个包名做安装过滤
#[derive(Default)]
pub struct AppInstallStore {
    // (buyer, package_name)
    registrations: RwLock<HashSet<(AdTechIdentifier, String)>>,
}

impl AppInstallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, package_name: &str, buyers: &[AdTechIdentifier]) {
        let mut registrations = self.registrations.write();
        for buyer in buyers {
            registrations.insert((buyer.clone(), package_name.to_string()));
        }
    }

    /// 广告的安装条件是否满足：该买方登记过这个包名
    pub fn can_buyer_filter(&self, buyer: &AdTechIdentifier, package_name: &str) -> bool {
        self.registrations
            .read()
            .contains(&(buyer.clone(), package_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_scoped_to_the_buyer() {
        let store = AppInstallStore::new();
        let buyer = AdTechIdentifier::new("buyer.com");
        store.register("com.example.game", &[buyer.clone()]);

        assert!(store.can_buyer_filter(&buyer, "com.example.game"));
        assert!(!store.can_buyer_filter(&buyer, "com.other.app"));
        assert!(!store.can_buyer_filter(&AdTechIdentifier::new("other.com"), "com.example.game"));
    }
}
