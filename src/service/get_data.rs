// src/service/get_data.rs
//
// 出站流水线：候选收集 → 组装 ProtectedAuctionInput → 封装 → 加密
// → 落会话。整个编排包在一个总超时里；会话在加密成功之后才登记。

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use tracing::{error, info};

use crate::auction::buyer_input::BuyerInputGenerator;
use crate::codec::formatter::{self, FormatterVersion, UnformattedData};
use crate::config::ServiceConfig;
use crate::crypto::oblivious::{ObliviousEncryptor, SEAL_OVERHEAD_BYTES};
use crate::data::ad_selection::AdSelectionStore;
use crate::error::{ExchangeError, ExchangeResult};
use crate::keys::key_manager::EncryptionKeyManager;
use crate::model::adtech::AdTechIdentifier;
use crate::model::auction::AuctionSession;
use crate::model::custom_audience::SellerConfiguration;
use crate::model::wire::ProtectedAuctionInput;
use crate::service::filter::{FilterOutcome, RequestFilter};

pub const GET_AD_SELECTION_DATA_TIMED_OUT: &str =
    "GetAdSelectionData exceeded allowed time limit";

/// 同意撤回时返回的随机填充长度，让响应体积不暴露过滤结果
pub const REVOKED_CONSENT_RANDOM_DATA_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct GetAdSelectionDataRequest {
    pub seller: AdTechIdentifier,
    pub caller_package_name: String,
    pub coordinator_origin: Option<String>,
    pub seller_configuration: Option<SellerConfiguration>,
}

#[derive(Debug, Clone)]
pub struct GetAdSelectionDataResponse {
    pub ad_selection_id: u64,
    pub ad_selection_data: Vec<u8>,
}

/// 生成会话 id：随机正整数，高位清零与远端约定的带符号 64 位兼容
pub fn generate_ad_selection_id() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.next_u64() >> 1;
        if id != 0 {
            return id;
        }
    }
}

pub struct GetAdSelectionDataRunner {
    config: Arc<ServiceConfig>,
    request_filter: Arc<RequestFilter>,
    buyer_input_generator: Arc<BuyerInputGenerator>,
    key_manager: Arc<EncryptionKeyManager>,
    encryptor: Arc<ObliviousEncryptor>,
    ad_selection_store: Arc<dyn AdSelectionStore>,
}

impl GetAdSelectionDataRunner {
    pub fn new(
        config: Arc<ServiceConfig>,
        request_filter: Arc<RequestFilter>,
        buyer_input_generator: Arc<BuyerInputGenerator>,
        key_manager: Arc<EncryptionKeyManager>,
        encryptor: Arc<ObliviousEncryptor>,
        ad_selection_store: Arc<dyn AdSelectionStore>,
    ) -> Self {
        Self {
            config,
            request_filter,
            buyer_input_generator,
            key_manager,
            encryptor,
            ad_selection_store,
        }
    }

    pub async fn run(
        &self,
        request: GetAdSelectionDataRequest,
    ) -> ExchangeResult<GetAdSelectionDataResponse> {
        if let FilterOutcome::RevokedConsent = self
            .request_filter
            .filter_request(&request.seller, &request.caller_package_name)?
        {
            // 静默失败：随机字节 + 新 id，不触达存储与密钥
            let mut random_data = vec![0u8; REVOKED_CONSENT_RANDOM_DATA_SIZE];
            rand::thread_rng().fill_bytes(&mut random_data);
            return Ok(GetAdSelectionDataResponse {
                ad_selection_id: generate_ad_selection_id(),
                ad_selection_data: random_data,
            });
        }

        // 白名单校验在任何网络访问之前
        let coordinator = self
            .key_manager
            .resolve_coordinator(request.coordinator_origin.as_deref())?;
        let ad_selection_id = generate_ad_selection_id();

        let overall_timeout = std::time::Duration::from_millis(self.config.overall_timeout_ms);
        match tokio::time::timeout(
            overall_timeout,
            self.orchestrate(&request, &coordinator, ad_selection_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!("{GET_AD_SELECTION_DATA_TIMED_OUT}");
                Err(ExchangeError::Timeout(
                    GET_AD_SELECTION_DATA_TIMED_OUT.to_string(),
                ))
            }
        }
    }

    async fn orchestrate(
        &self,
        request: &GetAdSelectionDataRequest,
        coordinator: &str,
        ad_selection_id: u64,
    ) -> ExchangeResult<GetAdSelectionDataResponse> {
        // 先让出一次轻量池，再进入重活
        tokio::task::yield_now().await;
        let now = Utc::now();

        let seller_configuration = request
            .seller_configuration
            .as_ref()
            .filter(|_| self.config.seller_configuration_enabled);

        let generated = self
            .buyer_input_generator
            .create_compressed_buyer_inputs(seller_configuration, now)
            .await?;
        info!(
            "Composed buyer inputs for {} buyers",
            generated.compressed.len()
        );

        let mut protected_auction_input = ProtectedAuctionInput {
            publisher_name: request.caller_package_name.clone(),
            generation_id: ad_selection_id.to_string(),
            enable_debug_reporting: false,
            ..Default::default()
        };
        for (buyer, data) in &generated.compressed {
            protected_auction_input.insert_buyer_input(buyer, &data.data);
        }
        let serialized = serde_json::to_vec(&protected_auction_input).map_err(|e| {
            ExchangeError::internal(format!("protected auction input serialization failed: {e}"))
        })?;

        // 有卖方体积配置时输出确定性体积：加密后恰好等于卖方上限
        let formatter = match seller_configuration {
            Some(configuration) => FormatterVersion::ExactSize {
                target_bytes: configuration
                    .max_payload_size_bytes
                    .saturating_sub(SEAL_OVERHEAD_BYTES),
            },
            None => self.config.payload_formatter(),
        };
        let formatted = formatter::format(
            &UnformattedData { data: serialized },
            &formatter,
            self.config.compressor(),
        )?;

        let key = self.key_manager.active_key(coordinator, now).await?;
        let encryptor = self.encryptor.clone();
        let payload = formatted.data;
        let sealed = tokio::task::spawn_blocking(move || {
            encryptor.seal(&payload, ad_selection_id, &key)
        })
        .await
        .map_err(|e| ExchangeError::internal(format!("seal task failed: {e}")))??;

        // 加密成功之后才登记会话
        self.ad_selection_store.persist_session(
            ad_selection_id,
            AuctionSession {
                seller: request.seller.clone(),
                caller_package_name: request.caller_package_name.clone(),
                creation_time: now,
            },
        )?;
        info!(
            "Ad selection data ready, id={}, {} bytes",
            ad_selection_id,
            sealed.len()
        );

        Ok(GetAdSelectionDataResponse {
            ad_selection_id,
            ad_selection_data: sealed,
        })
    }
}
