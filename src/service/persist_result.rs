// src/service/persist_result.rs
//
// 入站流水线：解密 → 解封装 → 解压 → 结构化解析 → 分类。
// 分类三分支：服务端报错 → invalid-argument；chaff → 空成功且零落库；
// 胜出 → 会话校验 + 结构校验后一次性原子落库。
// 单条报告地址/信标不合法只丢弃该条（记日志），不拖垮整个请求。

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::auction::validator::{
    AdTechUriValidator, AuctionResultValidator, AD_TECH_ROLE_BUYER, AD_TECH_ROLE_COMPONENT_SELLER,
    AD_TECH_ROLE_SELLER,
};
use crate::codec::compressor;
use crate::codec::formatter::{self, FormattedData};
use crate::config::ServiceConfig;
use crate::crypto::oblivious::ObliviousEncryptor;
use crate::data::ad_selection::{AdSelectionStore, AuctionOutcome};
use crate::data::custom_audience::CustomAudienceStore;
use crate::data::frequency_cap::HistogramStore;
use crate::error::{ExchangeError, ExchangeResult};
use crate::model::adtech::AdTechIdentifier;
use crate::model::auction::{
    AdType, AuctionResult, RegisteredAdInteraction, ReportingData, ReportingDestination,
    WinnerRecord,
};
use crate::model::custom_audience::{AdData, AdEventType, HistogramEvent};
use crate::service::filter::{FilterOutcome, RequestFilter};

pub const PERSIST_AD_SELECTION_RESULT_TIMED_OUT: &str =
    "PersistAdSelectionResult exceeded allowed time limit";

const BUYER_WIN_REPORTING_URI_FIELD: &str = "buyer win reporting uri";
const SELLER_WIN_REPORTING_URI_FIELD: &str = "seller win reporting uri";
const COMPONENT_SELLER_WIN_REPORTING_URI_FIELD: &str = "component seller win reporting uri";
const BUYER_INTERACTION_URI_FIELD: &str = "buyer interaction reporting uri";
const SELLER_INTERACTION_URI_FIELD: &str = "seller interaction reporting uri";
const COMPONENT_SELLER_INTERACTION_URI_FIELD: &str =
    "component seller interaction reporting uri";

#[derive(Debug, Clone)]
pub struct PersistAdSelectionResultRequest {
    pub ad_selection_id: u64,
    pub seller: AdTechIdentifier,
    pub caller_package_name: String,
    /// 竞价服务端返回的密文
    pub ad_selection_result: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistAdSelectionResultResponse {
    pub ad_selection_id: u64,
    /// chaff / 同意撤回时为空串
    pub ad_render_uri: String,
}

pub struct PersistAdSelectionResultRunner {
    config: Arc<ServiceConfig>,
    request_filter: Arc<RequestFilter>,
    encryptor: Arc<ObliviousEncryptor>,
    ad_selection_store: Arc<dyn AdSelectionStore>,
    custom_audience_store: Arc<dyn CustomAudienceStore>,
    histogram: Arc<HistogramStore>,
}

impl PersistAdSelectionResultRunner {
    pub fn new(
        config: Arc<ServiceConfig>,
        request_filter: Arc<RequestFilter>,
        encryptor: Arc<ObliviousEncryptor>,
        ad_selection_store: Arc<dyn AdSelectionStore>,
        custom_audience_store: Arc<dyn CustomAudienceStore>,
        histogram: Arc<HistogramStore>,
    ) -> Self {
        Self {
            config,
            request_filter,
            encryptor,
            ad_selection_store,
            custom_audience_store,
            histogram,
        }
    }

    pub async fn run(
        &self,
        request: PersistAdSelectionResultRequest,
    ) -> ExchangeResult<PersistAdSelectionResultResponse> {
        if let FilterOutcome::RevokedConsent = self
            .request_filter
            .filter_request(&request.seller, &request.caller_package_name)?
        {
            // 静默失败：空成功，不触达解密器与存储
            return Ok(PersistAdSelectionResultResponse {
                ad_selection_id: request.ad_selection_id,
                ad_render_uri: String::new(),
            });
        }

        let overall_timeout = std::time::Duration::from_millis(self.config.overall_timeout_ms);
        match tokio::time::timeout(overall_timeout, self.orchestrate(&request)).await {
            Ok(result) => result,
            Err(_) => {
                error!("{PERSIST_AD_SELECTION_RESULT_TIMED_OUT}");
                Err(ExchangeError::Timeout(
                    PERSIST_AD_SELECTION_RESULT_TIMED_OUT.to_string(),
                ))
            }
        }
    }

    async fn orchestrate(
        &self,
        request: &PersistAdSelectionResultRequest,
    ) -> ExchangeResult<PersistAdSelectionResultResponse> {
        tokio::task::yield_now().await;
        self.validate_session(request)?;

        let auction_result = self.decrypt_and_parse(request).await?;

        // 分类：错误 → chaff → 胜出
        if auction_result.has_error() {
            let message = auction_result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            let err = format!("AuctionResult has an error: {message}");
            error!("{err}");
            return Err(ExchangeError::invalid_argument(err));
        }
        if auction_result.is_chaff {
            info!("Result is chaff, truncating persistAdSelectionResult");
            return Ok(PersistAdSelectionResultResponse {
                ad_selection_id: request.ad_selection_id,
                ad_render_uri: String::new(),
            });
        }
        if auction_result.ad_type == AdType::Unknown {
            return Err(ExchangeError::invalid_argument(
                "AuctionResult type is unknown",
            ));
        }

        AuctionResultValidator::validate(&auction_result)?;
        let winning_ad = self.resolve_winning_ad(&auction_result)?;
        self.persist_outcome(request, &auction_result, winning_ad)?;

        Ok(PersistAdSelectionResultResponse {
            ad_selection_id: request.ad_selection_id,
            ad_render_uri: auction_result.ad_render_url.clone(),
        })
    }

    /// 会话完整性：id 必须已登记，seller 与 caller 都要和登记值一致
    fn validate_session(&self, request: &PersistAdSelectionResultRequest) -> ExchangeResult<()> {
        let session = self
            .ad_selection_store
            .session(request.ad_selection_id)
            .ok_or_else(|| {
                ExchangeError::invalid_argument(format!(
                    "Initialization info cannot be found for the given ad selection id: {}",
                    request.ad_selection_id
                ))
            })?;

        if session.seller != request.seller
            || session.caller_package_name != request.caller_package_name
        {
            let err = format!(
                "Initialization info in store (seller={}, caller={}) doesn't match the request \
                 (seller={}, caller={})",
                session.seller, session.caller_package_name, request.seller,
                request.caller_package_name
            );
            error!("{err}");
            return Err(ExchangeError::invalid_argument(err));
        }
        Ok(())
    }

    /// 解密 + 解封装 + 解压 + 解析，整段丢到阻塞池
    async fn decrypt_and_parse(
        &self,
        request: &PersistAdSelectionResultRequest,
    ) -> ExchangeResult<AuctionResult> {
        let encryptor = self.encryptor.clone();
        let ciphertext = request.ad_selection_result.clone();
        let ad_selection_id = request.ad_selection_id;

        tokio::task::spawn_blocking(move || {
            let decrypted = encryptor.open(&ciphertext, ad_selection_id)?;

            // 版本信息全部来自缓冲区自身
            let (_, compressed) = formatter::unformat(&FormattedData { data: decrypted })?;
            let mut plaintext = compressor::decompress(&compressed)?;

            let result: AuctionResult =
                simd_json::serde::from_slice(&mut plaintext).map_err(|e| {
                    ExchangeError::invalid_argument(format!(
                        "error parsing AuctionResult from decrypted bytes: {e}"
                    ))
                })?;
            Ok(result)
        })
        .await
        .map_err(|e| ExchangeError::internal(format!("decrypt task failed: {e}")))?
    }

    /// 定位胜出广告
    ///
    /// remarketing：按 (owner, buyer, name) 主键取；owner 缺失时按兼容
    /// 开关走 (buyer, name) 兜底检索或占位广告。app-install：占位广告，
    /// 计数 key 为空。
    fn resolve_winning_ad(&self, auction_result: &AuctionResult) -> ExchangeResult<AdData> {
        let render_uri = auction_result.ad_render_url.clone();
        if auction_result.ad_type == AdType::AppInstallAd {
            return Ok(placeholder_ad(render_uri));
        }

        let buyer = AdTechIdentifier::new(auction_result.buyer.clone());
        let name = &auction_result.custom_audience_name;
        let owner = &auction_result.custom_audience_owner;
        info!(
            "Fetching winning CA with buyer='{}', name='{}', owner='{}'",
            buyer, name, owner
        );

        if owner.is_empty() {
            return if self.config.force_search_on_absent_owner {
                // 兼容模式：owner 还没从竞价服务端回传时按素材地址匹配
                self.custom_audience_store
                    .custom_audiences_for_buyer_and_name(&buyer, name)
                    .iter()
                    .flat_map(|ca| ca.ads.iter())
                    .find(|ad| ad.render_uri == render_uri)
                    .cloned()
                    .ok_or_else(|| {
                        ExchangeError::invalid_argument(
                            "Winning ad is not found in custom audience's list of ads",
                        )
                    })
            } else {
                info!("Owner absent in AuctionResult, using a placeholder ad");
                Ok(placeholder_ad(render_uri))
            };
        }

        let audience = self
            .custom_audience_store
            .custom_audience_by_primary_key(owner, &buyer, name)
            .ok_or_else(|| {
                ExchangeError::invalid_argument(format!(
                    "Custom Audience is not found by given owner='{owner}', buyer='{buyer}', \
                     name='{name}'"
                ))
            })?;
        if audience.ads.is_empty() {
            return Err(ExchangeError::invalid_argument(
                "Custom Audience has an empty list of ads",
            ));
        }
        audience
            .ads
            .iter()
            .find(|ad| ad.render_uri == render_uri)
            .cloned()
            .ok_or_else(|| {
                ExchangeError::invalid_argument(
                    "Winning ad is not found in custom audience's list of ads",
                )
            })
    }

    /// 一次原子落库 + 软失败的胜出直方图更新
    fn persist_outcome(
        &self,
        request: &PersistAdSelectionResultRequest,
        auction_result: &AuctionResult,
        winning_ad: AdData,
    ) -> ExchangeResult<()> {
        let buyer = AdTechIdentifier::new(auction_result.buyer.clone());
        let urls = &auction_result.win_reporting_urls;

        let buyer_reporting_uri = AdTechUriValidator::new(
            AD_TECH_ROLE_BUYER,
            buyer.clone(),
            BUYER_WIN_REPORTING_URI_FIELD,
        )
        .validate_and_return_empty_if_invalid(&urls.buyer_reporting_urls.reporting_url);
        let seller_reporting_uri = AdTechUriValidator::new(
            AD_TECH_ROLE_SELLER,
            request.seller.clone(),
            SELLER_WIN_REPORTING_URI_FIELD,
        )
        .validate_and_return_empty_if_invalid(
            &urls.top_level_seller_reporting_urls.reporting_url,
        );
        let component_seller_reporting_uri =
            if self.config.report_event_for_component_seller_enabled {
                AdTechUriValidator::new(
                    AD_TECH_ROLE_COMPONENT_SELLER,
                    AdTechIdentifier::new(auction_result.winning_seller.clone()),
                    COMPONENT_SELLER_WIN_REPORTING_URI_FIELD,
                )
                .validate_and_return_empty_if_invalid(
                    &urls.component_seller_reporting_urls.reporting_url,
                )
            } else {
                String::new()
            };

        let mut interactions = self.filter_interactions(
            AD_TECH_ROLE_BUYER,
            buyer.clone(),
            BUYER_INTERACTION_URI_FIELD,
            ReportingDestination::Buyer,
            &urls.buyer_reporting_urls.interaction_reporting_urls,
        );
        interactions.extend(self.filter_interactions(
            AD_TECH_ROLE_SELLER,
            request.seller.clone(),
            SELLER_INTERACTION_URI_FIELD,
            ReportingDestination::Seller,
            &urls.top_level_seller_reporting_urls.interaction_reporting_urls,
        ));
        if self.config.report_event_for_component_seller_enabled {
            interactions.extend(self.filter_interactions(
                AD_TECH_ROLE_COMPONENT_SELLER,
                AdTechIdentifier::new(auction_result.winning_seller.clone()),
                COMPONENT_SELLER_INTERACTION_URI_FIELD,
                ReportingDestination::ComponentSeller,
                &urls.component_seller_reporting_urls.interaction_reporting_urls,
            ));
        }

        let ad_counter_keys: BTreeSet<i32> = winning_ad.ad_counter_keys.clone();
        let winner = WinnerRecord {
            bid: auction_result.bid as f64,
            ad_render_uri: auction_result.ad_render_url.clone(),
            buyer: buyer.clone(),
            custom_audience_owner: auction_result.custom_audience_owner.clone(),
            custom_audience_name: auction_result.custom_audience_name.clone(),
            ad_counter_keys: ad_counter_keys.clone(),
        };

        self.ad_selection_store.persist_auction_outcome(
            request.ad_selection_id,
            AuctionOutcome {
                winner,
                reporting: ReportingData {
                    buyer_win_reporting_uri: buyer_reporting_uri,
                    seller_win_reporting_uri: seller_reporting_uri,
                    component_seller_win_reporting_uri: component_seller_reporting_uri,
                },
                interactions,
                beacon_limits: self.config.beacon_count_limits(),
            },
        )?;

        // 频控不值得让整个落库失败
        let now = Utc::now();
        for ad_counter_key in ad_counter_keys {
            self.histogram.insert_event(HistogramEvent {
                buyer: buyer.clone(),
                ad_counter_key,
                event_type: AdEventType::Win,
                timestamp: now,
            });
        }
        Ok(())
    }

    /// 单条校验交互信标：host 归属 + key/URI 字节上限；失败只丢该条
    fn filter_interactions(
        &self,
        ad_tech_role: &'static str,
        ad_tech: AdTechIdentifier,
        field_name: &'static str,
        destination: ReportingDestination,
        attempted: &std::collections::BTreeMap<String, String>,
    ) -> Vec<RegisteredAdInteraction> {
        let validator = AdTechUriValidator::new(ad_tech_role, ad_tech, field_name);
        attempted
            .iter()
            .filter_map(|(key, uri)| {
                if let Err(e) = validator.validate(uri) {
                    warn!("Interaction data is invalid: {e}");
                    return None;
                }
                if key.len() > self.config.max_interaction_key_size_bytes {
                    warn!("Interaction key `{key}` exceeds the maximum size, skipping this entry");
                    return None;
                }
                if uri.len() > self.config.max_interaction_reporting_uri_size_bytes {
                    warn!("Interaction uri `{uri}` exceeds the maximum size, skipping this entry");
                    return None;
                }
                Some(RegisteredAdInteraction {
                    destination,
                    interaction_key: key.clone(),
                    interaction_reporting_uri: uri.clone(),
                })
            })
            .collect()
    }
}

fn placeholder_ad(render_uri: String) -> AdData {
    AdData {
        render_uri,
        ad_render_id: String::new(),
        metadata: String::new(),
        ad_counter_keys: BTreeSet::new(),
        filters: None,
    }
}
