// src/keys/mod.rs

pub mod key_fetcher;
pub mod key_manager;

use chrono::{DateTime, Utc};

/// 协调方发布的加密公钥
///
/// 同一协调方可以同时存在多把 key；选 key 永远取"未过期里过期
/// 时间最晚"的那把。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub coordinator_origin: String,
    pub key_id: u8,
    pub public_key: [u8; 32],
    pub expiry: DateTime<Utc>,
}

impl EncryptionKey {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }
}
