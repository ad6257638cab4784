// src/data/signals.rs

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::adtech::AdTechIdentifier;

/// 某买方编码后的应用信号载荷
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedSignalsPayload {
    pub payload: Vec<u8>,
    pub encoding_version: i32,
}

/// 编码信号仓库：买方 → 最新一版编码产物
#[derive(Default)]
pub struct EncodedSignalsStore {
    payloads: RwLock<HashMap<AdTechIdentifier, EncodedSignalsPayload>>,
}

impl EncodedSignalsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, buyer: AdTechIdentifier, payload: EncodedSignalsPayload) {
        self.payloads.write().insert(buyer, payload);
    }

    pub fn all(&self) -> HashMap<AdTechIdentifier, EncodedSignalsPayload> {
        self.payloads.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_payload_wins() {
        let store = EncodedSignalsStore::new();
        let buyer = AdTechIdentifier::new("buyer.com");
        store.put(
            buyer.clone(),
            EncodedSignalsPayload {
                payload: vec![1],
                encoding_version: 1,
            },
        );
        store.put(
            buyer.clone(),
            EncodedSignalsPayload {
                payload: vec![2, 3],
                encoding_version: 2,
            },
        );
        let all = store.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&buyer].payload, vec![2, 3]);
    }
}
