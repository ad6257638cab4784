// src/keys/key_fetcher.rs

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, TimeZone, Utc};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::info;

use crate::error::{ExchangeError, ExchangeResult};
use crate::keys::EncryptionKey;

/// 协调方公钥端点的路径
pub const PUBLIC_KEYS_PATH: &str = "/v1/publicKeys";

/// 公钥拉取接口；内存实现用于测试替身
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch_keys(&self, coordinator_origin: &str) -> ExchangeResult<Vec<EncryptionKey>>;
}

/// 协调方返回的公钥清单
#[derive(Deserialize, Debug)]
struct PublicKeysResponse {
    keys: Vec<PublicKeyEntry>,
}

#[derive(Deserialize, Debug)]
struct PublicKeyEntry {
    id: u8,
    key: String, // base64 的 X25519 公钥
    #[serde(default)]
    expiry_unix_seconds: Option<i64>,
}

/// 走 HTTP 拉取公钥，单次请求有独立超时，不占用整体时限之外的时间
pub struct HttpKeyFetcher {
    client: reqwest::Client,
    fetch_timeout: std::time::Duration,
    /// 响应未带过期时间时按最大存活期折算
    key_max_age: Duration,
}

impl HttpKeyFetcher {
    pub fn new(fetch_timeout_ms: u64, key_max_age_seconds: i64) -> Self {
        Self {
            client: reqwest::Client::new(),
            fetch_timeout: std::time::Duration::from_millis(fetch_timeout_ms),
            key_max_age: Duration::seconds(key_max_age_seconds),
        }
    }

    fn parse_entry(&self, entry: PublicKeyEntry, origin: &str) -> ExchangeResult<EncryptionKey> {
        let raw = BASE64
            .decode(entry.key.as_bytes())
            .map_err(|e| ExchangeError::invalid_argument(format!("bad public key base64: {e}")))?;
        let public_key: [u8; 32] = raw.try_into().map_err(|_| {
            ExchangeError::invalid_argument("coordinator public key must be 32 bytes".to_string())
        })?;
        let expiry = match entry.expiry_unix_seconds {
            Some(seconds) => Utc
                .timestamp_opt(seconds, 0)
                .single()
                .ok_or_else(|| ExchangeError::invalid_argument("bad key expiry".to_string()))?,
            None => Utc::now() + self.key_max_age,
        };
        Ok(EncryptionKey {
            coordinator_origin: origin.to_string(),
            key_id: entry.id,
            public_key,
            expiry,
        })
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch_keys(&self, coordinator_origin: &str) -> ExchangeResult<Vec<EncryptionKey>> {
        let url = format!("{}{}", coordinator_origin.trim_end_matches('/'), PUBLIC_KEYS_PATH);
        info!("Fetching auction encryption keys from {}", url);

        let response = timeout(self.fetch_timeout, self.client.get(&url).send())
            .await
            .map_err(|_| ExchangeError::Timeout(format!("key fetch from {url} timed out")))?
            .map_err(|e| ExchangeError::internal(format!("key fetch from {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ExchangeError::internal(format!(
                "key fetch from {url} returned status {}",
                response.status()
            )));
        }

        let parsed: PublicKeysResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::internal(format!("bad key list from {url}: {e}")))?;

        parsed
            .keys
            .into_iter()
            .map(|entry| self.parse_entry(entry, coordinator_origin))
            .collect()
    }
}
