// src/auction/buyer_input.rs
//
// 出站候选的收集与装箱。三种分配策略：
//   Unbounded      —— 没有卖方体积配置，全量上送（只受封装桶上限约束）
//   SellerMax      —— 只有总量上限，按优先级全局贪心装箱
//   PerBuyerGreedy —— 每个买方有自己的目标体积，先各自填到目标，
//                     剩余预算再按优先级全局补装
//
// 体积估算用"每买方压缩率 × 序列化长度"，留 10% 余量；压缩完成后
// 再按实际体积做一轮硬校验，超出就从优先级最低的受众开始回退重压，
// 保证最终载荷绝不超过上限。

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info};

use crate::auction::filters::AdFilterer;
use crate::codec::compressor::{self, CompressedData, CompressorVersion};
use crate::data::custom_audience::CustomAudienceStore;
use crate::data::signals::EncodedSignalsStore;
use crate::error::{ExchangeError, ExchangeResult};
use crate::model::adtech::AdTechIdentifier;
use crate::model::custom_audience::{CustomAudience, SellerConfiguration};
use crate::model::wire::{BuyerInput, BuyerInputCustomAudience, ProtectedAppSignals};

const PAYLOAD_UTILIZATION_GOAL: f64 = 0.90;
const MINIMUM_SIZE_OF_CA_BYTES: usize = 64;
/// 外层 JSON、封装帧头与加密信封的预留字节
pub const PAYLOAD_ENVELOPE_RESERVE_BYTES: usize = 512;

/// 单个买方压缩产物计入最终载荷的字节数（base64 + map 语法开销）
pub fn payload_contribution(buyer: &AdTechIdentifier, compressed_len: usize) -> usize {
    compressed_len.div_ceil(3) * 4 + buyer.as_str().len() + 8
}

/// 生成结果：买方 → 压缩后的 BuyerInput，附带打点用的受众计数
pub struct GeneratedBuyerInputs {
    pub compressed: BTreeMap<AdTechIdentifier, CompressedData>,
    pub custom_audience_counts: BTreeMap<AdTechIdentifier, usize>,
}

impl GeneratedBuyerInputs {
    pub fn total_payload_contribution(&self) -> usize {
        self.compressed
            .iter()
            .map(|(buyer, data)| payload_contribution(buyer, data.data.len()))
            .sum()
    }
}

enum AllocationPolicy<'a> {
    Unbounded,
    SellerMax {
        max_bytes: usize,
    },
    PerBuyerGreedy {
        max_bytes: usize,
        configuration: &'a SellerConfiguration,
    },
}

/// 买方输入生成器
pub struct BuyerInputGenerator {
    custom_audience_store: Arc<dyn CustomAudienceStore>,
    signals_store: Arc<EncodedSignalsStore>,
    filterer: Arc<AdFilterer>,
    compressor: CompressorVersion,
    seller_configuration_enabled: bool,
    per_buyer_signals_max_size_bytes: usize,
}

impl BuyerInputGenerator {
    pub fn new(
        custom_audience_store: Arc<dyn CustomAudienceStore>,
        signals_store: Arc<EncodedSignalsStore>,
        filterer: Arc<AdFilterer>,
        compressor: CompressorVersion,
        seller_configuration_enabled: bool,
        per_buyer_signals_max_size_bytes: usize,
    ) -> Self {
        Self {
            custom_audience_store,
            signals_store,
            filterer,
            compressor,
            seller_configuration_enabled,
            per_buyer_signals_max_size_bytes,
        }
    }

    pub async fn create_compressed_buyer_inputs(
        &self,
        seller_configuration: Option<&SellerConfiguration>,
        now: DateTime<Utc>,
    ) -> ExchangeResult<GeneratedBuyerInputs> {
        let audiences = self.custom_audience_store.active_custom_audiences(now);
        let audiences = self.filterer.filter_custom_audiences(audiences, now);
        info!("{} custom audiences eligible after filtering", audiences.len());

        let per_buyer = group_by_buyer(audiences);

        // 超过上限的信号载荷直接不带
        let signals: BTreeMap<AdTechIdentifier, ProtectedAppSignals> = self
            .signals_store
            .all()
            .into_iter()
            .filter(|(_, payload)| payload.payload.len() <= self.per_buyer_signals_max_size_bytes)
            .map(|(buyer, payload)| {
                (
                    buyer,
                    ProtectedAppSignals {
                        app_install_signals: payload.payload,
                        encoding_version: payload.encoding_version,
                    },
                )
            })
            .collect();

        let policy = match seller_configuration {
            Some(configuration) if self.seller_configuration_enabled => {
                if configuration.per_buyer_configurations.is_empty() {
                    AllocationPolicy::SellerMax {
                        max_bytes: configuration.max_payload_size_bytes,
                    }
                } else {
                    AllocationPolicy::PerBuyerGreedy {
                        max_bytes: configuration.max_payload_size_bytes,
                        configuration,
                    }
                }
            }
            _ => AllocationPolicy::Unbounded,
        };

        let mut selected = match &policy {
            AllocationPolicy::Unbounded => per_buyer,
            AllocationPolicy::SellerMax { max_bytes } => {
                self.select_seller_max(&per_buyer, &signals, *max_bytes)
            }
            AllocationPolicy::PerBuyerGreedy {
                max_bytes,
                configuration,
            } => self.select_per_buyer_greedy(&per_buyer, &signals, *max_bytes, configuration),
        };

        let mut compressed = self.compress_selected(&selected, &signals).await?;

        // 硬校验：估算失手时从优先级最低的受众开始回退
        if let AllocationPolicy::SellerMax { max_bytes }
        | AllocationPolicy::PerBuyerGreedy { max_bytes, .. } = &policy
        {
            let hard_budget = max_bytes.saturating_sub(PAYLOAD_ENVELOPE_RESERVE_BYTES);
            self.enforce_budget(&mut selected, &signals, &mut compressed, hard_budget)?;
        }

        let custom_audience_counts = selected
            .iter()
            .map(|(buyer, audiences)| (buyer.clone(), audiences.len()))
            .collect();

        Ok(GeneratedBuyerInputs {
            compressed,
            custom_audience_counts,
        })
    }

    /// 全局贪心：所有买方的受众按优先级排队，能放就放
    fn select_seller_max(
        &self,
        per_buyer: &BTreeMap<AdTechIdentifier, Vec<CustomAudience>>,
        signals: &BTreeMap<AdTechIdentifier, ProtectedAppSignals>,
        max_bytes: usize,
    ) -> BTreeMap<AdTechIdentifier, Vec<CustomAudience>> {
        let soft_budget = max_bytes.saturating_sub(PAYLOAD_ENVELOPE_RESERVE_BYTES) as f64
            * PAYLOAD_UTILIZATION_GOAL;
        let ratios = self.estimate_compression_ratios(per_buyer, signals);
        let mut estimated_total = estimated_signals_bytes(signals, &ratios);

        let mut queue: Vec<(AdTechIdentifier, CustomAudience)> = per_buyer
            .iter()
            .flat_map(|(buyer, audiences)| {
                audiences.iter().map(|ca| (buyer.clone(), ca.clone()))
            })
            .collect();
        sort_by_priority_desc(&mut queue);

        let mut selected: BTreeMap<AdTechIdentifier, Vec<CustomAudience>> = BTreeMap::new();
        for (buyer, audience) in queue {
            let ratio = ratios.get(&buyer).copied().unwrap_or(1.0);
            let estimated = estimated_ca_bytes(&audience, ratio);
            if estimated_total + estimated <= soft_budget {
                estimated_total += estimated;
                selected.entry(buyer).or_default().push(audience);
            }
        }
        debug!("seller-max packing estimated {estimated_total:.0} bytes");
        selected
    }

    /// 每买方目标优先，余量全局补装
    fn select_per_buyer_greedy(
        &self,
        per_buyer: &BTreeMap<AdTechIdentifier, Vec<CustomAudience>>,
        signals: &BTreeMap<AdTechIdentifier, ProtectedAppSignals>,
        max_bytes: usize,
        configuration: &SellerConfiguration,
    ) -> BTreeMap<AdTechIdentifier, Vec<CustomAudience>> {
        let soft_budget = max_bytes.saturating_sub(PAYLOAD_ENVELOPE_RESERVE_BYTES) as f64
            * PAYLOAD_UTILIZATION_GOAL;
        let ratios = self.estimate_compression_ratios(per_buyer, signals);
        let mut estimated_total = estimated_signals_bytes(signals, &ratios);

        let mut selected: BTreeMap<AdTechIdentifier, Vec<CustomAudience>> = BTreeMap::new();
        let mut remaining: Vec<(AdTechIdentifier, CustomAudience)> = Vec::new();

        for (buyer, audiences) in per_buyer.iter() {
            let ratio = ratios.get(buyer).copied().unwrap_or(1.0);
            let target = configuration
                .per_buyer_configurations
                .get(buyer)
                .map(|c| c.target_input_size_bytes)
                .unwrap_or(0);
            let mut buyer_limit = target as f64 * PAYLOAD_UTILIZATION_GOAL;
            // 信号载荷先占掉该买方的目标空间
            if let Some(payload) = signals.get(buyer) {
                buyer_limit -= payload.app_install_signals.len() as f64 * ratio + 1.0;
            }

            for (index, audience) in audiences.iter().enumerate() {
                let estimated = estimated_ca_bytes(audience, ratio);
                if estimated <= buyer_limit && estimated_total + estimated <= soft_budget {
                    buyer_limit -= estimated;
                    estimated_total += estimated;
                    selected
                        .entry(buyer.clone())
                        .or_default()
                        .push(audience.clone());
                } else if buyer_limit > MINIMUM_SIZE_OF_CA_BYTES as f64 {
                    remaining.push((buyer.clone(), audience.clone()));
                } else {
                    // 该买方装不下更多了，剩余受众全部进补装队列
                    remaining.extend(
                        audiences[index..]
                            .iter()
                            .map(|ca| (buyer.clone(), ca.clone())),
                    );
                    break;
                }
            }
        }

        // 离利用率目标还有距离时，按优先级补装剩余受众
        if estimated_total <= soft_budget {
            sort_by_priority_desc(&mut remaining);
            for (buyer, audience) in remaining {
                let ratio = ratios.get(&buyer).copied().unwrap_or(1.0);
                let estimated = estimated_ca_bytes(&audience, ratio);
                if estimated_total + estimated <= soft_budget {
                    estimated_total += estimated;
                    selected.entry(buyer).or_default().push(audience);
                }
            }
        }
        debug!("per-buyer greedy packing estimated {estimated_total:.0} bytes");
        selected
    }

    /// 每买方压缩率：把该买方的完整输入压一遍，实测比值
    fn estimate_compression_ratios(
        &self,
        per_buyer: &BTreeMap<AdTechIdentifier, Vec<CustomAudience>>,
        signals: &BTreeMap<AdTechIdentifier, ProtectedAppSignals>,
    ) -> BTreeMap<AdTechIdentifier, f64> {
        let mut ratios = BTreeMap::new();
        for (buyer, audiences) in per_buyer {
            let input = build_buyer_input(audiences, signals.get(buyer));
            let serialized = match serde_json::to_vec(&input) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            if serialized.is_empty() {
                continue;
            }
            if let Ok(compressed) = compressor::compress(&serialized, self.compressor) {
                ratios.insert(
                    buyer.clone(),
                    compressed.data.len() as f64 / serialized.len() as f64,
                );
            }
        }
        ratios
    }

    async fn compress_selected(
        &self,
        selected: &BTreeMap<AdTechIdentifier, Vec<CustomAudience>>,
        signals: &BTreeMap<AdTechIdentifier, ProtectedAppSignals>,
    ) -> ExchangeResult<BTreeMap<AdTechIdentifier, CompressedData>> {
        // 信号是该买方唯一内容时也要出现在载荷里
        let mut buyers: Vec<AdTechIdentifier> = selected.keys().cloned().collect();
        for buyer in signals.keys() {
            if !buyers.contains(buyer) {
                buyers.push(buyer.clone());
            }
        }

        let tasks: Vec<_> = buyers
            .into_iter()
            .map(|buyer| {
                let input = build_buyer_input(
                    selected.get(&buyer).map(Vec::as_slice).unwrap_or(&[]),
                    signals.get(&buyer),
                );
                let compressor_version = self.compressor;
                tokio::task::spawn_blocking(move || {
                    let serialized = serde_json::to_vec(&input).map_err(|e| {
                        ExchangeError::internal(format!("buyer input serialization failed: {e}"))
                    })?;
                    compressor::compress(&serialized, compressor_version)
                        .map(|compressed| (buyer, compressed))
                })
            })
            .collect();

        let mut compressed = BTreeMap::new();
        for joined in join_all(tasks).await {
            let (buyer, data) = joined
                .map_err(|e| ExchangeError::internal(format!("compression task failed: {e}")))??;
            compressed.insert(buyer, data);
        }
        Ok(compressed)
    }

    /// 按实际压缩体积做硬校验，超预算就回退优先级最低的受众
    fn enforce_budget(
        &self,
        selected: &mut BTreeMap<AdTechIdentifier, Vec<CustomAudience>>,
        signals: &BTreeMap<AdTechIdentifier, ProtectedAppSignals>,
        compressed: &mut BTreeMap<AdTechIdentifier, CompressedData>,
        hard_budget: usize,
    ) -> ExchangeResult<()> {
        loop {
            let total: usize = compressed
                .iter()
                .map(|(buyer, data)| payload_contribution(buyer, data.data.len()))
                .sum();
            if total <= hard_budget {
                return Ok(());
            }

            // 找全局优先级最低的已选受众
            let victim = selected
                .iter()
                .filter(|(_, audiences)| !audiences.is_empty())
                .min_by(|(_, a), (_, b)| {
                    let pa = a.last().map(|ca| ca.priority).unwrap_or(f64::MAX);
                    let pb = b.last().map(|ca| ca.priority).unwrap_or(f64::MAX);
                    pa.partial_cmp(&pb).unwrap_or(Ordering::Equal)
                })
                .map(|(buyer, _)| buyer.clone());

            let Some(buyer) = victim else {
                // 没有受众可回退了：逐个丢弃纯信号买方，仍然超限则报错
                let Some(signal_buyer) = compressed.keys().next().cloned() else {
                    return Err(ExchangeError::invalid_argument(format!(
                        "payload cannot fit the seller max budget of {hard_budget} bytes"
                    )));
                };
                compressed.remove(&signal_buyer);
                continue;
            };

            let Some(audiences) = selected.get_mut(&buyer) else {
                continue;
            };
            let dropped = audiences.pop();
            let dropped_name = dropped.map(|ca| ca.name).unwrap_or_default();
            debug!(
                buyer = %buyer,
                dropped = %dropped_name,
                "payload over budget, dropping lowest-priority custom audience"
            );

            if audiences.is_empty() && signals.get(&buyer).is_none() {
                selected.remove(&buyer);
                compressed.remove(&buyer);
                continue;
            }

            let input = build_buyer_input(
                selected.get(&buyer).map(Vec::as_slice).unwrap_or(&[]),
                signals.get(&buyer),
            );
            let serialized = serde_json::to_vec(&input)
                .map_err(|e| ExchangeError::internal(format!("buyer input serialization failed: {e}")))?;
            let recompressed = compressor::compress(&serialized, self.compressor)?;
            compressed.insert(buyer, recompressed);
        }
    }
}

fn group_by_buyer(
    audiences: Vec<CustomAudience>,
) -> BTreeMap<AdTechIdentifier, Vec<CustomAudience>> {
    let mut grouped: BTreeMap<AdTechIdentifier, Vec<CustomAudience>> = BTreeMap::new();
    for audience in audiences {
        grouped.entry(audience.buyer.clone()).or_default().push(audience);
    }
    for audiences in grouped.values_mut() {
        audiences.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
    }
    grouped
}

fn sort_by_priority_desc(queue: &mut [(AdTechIdentifier, CustomAudience)]) {
    queue.sort_by(|(_, a), (_, b)| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
}

fn build_buyer_input(
    audiences: &[CustomAudience],
    signals: Option<&ProtectedAppSignals>,
) -> BuyerInput {
    BuyerInput {
        custom_audiences: audiences
            .iter()
            .map(|ca| BuyerInputCustomAudience {
                name: ca.name.clone(),
                owner: ca.owner.clone(),
                bidding_signals_keys: ca.trusted_bidding_keys.clone(),
                user_bidding_signals: ca.user_bidding_signals.clone(),
                ad_render_ids: ca.ads.iter().map(|ad| ad.ad_render_id.clone()).collect(),
            })
            .collect(),
        protected_app_signals: signals.cloned(),
    }
}

fn estimated_ca_bytes(audience: &CustomAudience, ratio: f64) -> f64 {
    let entry = BuyerInputCustomAudience {
        name: audience.name.clone(),
        owner: audience.owner.clone(),
        bidding_signals_keys: audience.trusted_bidding_keys.clone(),
        user_bidding_signals: audience.user_bidding_signals.clone(),
        ad_render_ids: audience.ads.iter().map(|ad| ad.ad_render_id.clone()).collect(),
    };
    let serialized = serde_json::to_vec(&entry).map(|b| b.len()).unwrap_or(0);
    serialized as f64 * ratio + 1.0
}

fn estimated_signals_bytes(
    signals: &BTreeMap<AdTechIdentifier, ProtectedAppSignals>,
    ratios: &BTreeMap<AdTechIdentifier, f64>,
) -> f64 {
    signals
        .iter()
        .map(|(buyer, payload)| {
            let ratio = ratios.get(buyer).copied().unwrap_or(1.0);
            payload.app_install_signals.len() as f64 * ratio + 1.0
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::app_install::AppInstallStore;
    use crate::data::custom_audience::InMemoryCustomAudienceStore;
    use crate::data::frequency_cap::{HistogramLimits, HistogramStore};
    use crate::data::signals::EncodedSignalsStore;
    use crate::model::custom_audience::{AdData, PerBuyerConfiguration};
    use chrono::Duration;
    use std::collections::BTreeSet;

    /// 压不动的伪随机 hex，防止 gzip 把体积测试压成空气
    fn noise(seed: u64, bytes: usize) -> String {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let mut out = String::with_capacity(bytes);
        while out.len() < bytes {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.push_str(&format!("{state:016x}"));
        }
        out.truncate(bytes);
        out
    }

    fn audience(buyer: &str, name: &str, priority: f64, signal_bytes: usize) -> CustomAudience {
        let now = Utc::now();
        let seed = name.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        CustomAudience {
            owner: "com.example.app".into(),
            buyer: AdTechIdentifier::new(buyer),
            name: name.into(),
            activation_time: now - Duration::hours(1),
            expiration_time: now + Duration::hours(1),
            priority,
            trusted_bidding_keys: vec!["key-1".into()],
            user_bidding_signals: noise(seed, signal_bytes),
            ads: vec![AdData {
                render_uri: format!("https://{buyer}/render/{name}"),
                ad_render_id: format!("{name}-ad"),
                metadata: String::new(),
                ad_counter_keys: BTreeSet::new(),
                filters: None,
            }],
        }
    }

    fn generator(store: Arc<InMemoryCustomAudienceStore>) -> BuyerInputGenerator {
        let histogram = Arc::new(HistogramStore::new(HistogramLimits::default()));
        let installs = Arc::new(AppInstallStore::new());
        BuyerInputGenerator::new(
            store,
            Arc::new(EncodedSignalsStore::new()),
            Arc::new(AdFilterer::new(true, true, histogram, installs)),
            CompressorVersion::Gzip,
            true,
            10 * 1024,
        )
    }

    #[tokio::test]
    async fn unbounded_policy_groups_and_round_trips_per_buyer() {
        let store = Arc::new(InMemoryCustomAudienceStore::new());
        store.insert(audience("buyer-a.com", "shoes", 1.0, 32));
        store.insert(audience("buyer-a.com", "hats", 2.0, 32));
        store.insert(audience("buyer-b.com", "cars", 1.0, 32));

        let generated = generator(store)
            .create_compressed_buyer_inputs(None, Utc::now())
            .await
            .unwrap();

        assert_eq!(generated.compressed.len(), 2);
        assert_eq!(
            generated.custom_audience_counts[&AdTechIdentifier::new("buyer-a.com")],
            2
        );

        let data = &generated.compressed[&AdTechIdentifier::new("buyer-a.com")];
        let decompressed = compressor::decompress(data).unwrap();
        let input: BuyerInput = serde_json::from_slice(&decompressed).unwrap();
        // 组内按优先级降序
        assert_eq!(input.custom_audiences[0].name, "hats");
        assert_eq!(input.custom_audiences[1].name, "shoes");
        assert_eq!(input.custom_audiences[0].ad_render_ids, vec!["hats-ad"]);
    }

    #[tokio::test]
    async fn seller_max_bound_holds_with_far_more_candidates_than_fit() {
        let store = Arc::new(InMemoryCustomAudienceStore::new());
        // 100 个候选，未压缩总量远超上限
        for i in 0..100 {
            store.insert(audience(
                "buyer-a.com",
                &format!("audience-{i:03}"),
                i as f64,
                400,
            ));
        }
        let configuration = SellerConfiguration {
            max_payload_size_bytes: 4096,
            per_buyer_configurations: BTreeMap::new(),
        };

        let generated = generator(store)
            .create_compressed_buyer_inputs(Some(&configuration), Utc::now())
            .await
            .unwrap();

        assert!(
            generated.total_payload_contribution() + PAYLOAD_ENVELOPE_RESERVE_BYTES <= 4096,
            "payload contribution {} exceeds the seller max",
            generated.total_payload_contribution()
        );
        // 至少装进了一部分，而且保留的是高优先级的
        let data = &generated.compressed[&AdTechIdentifier::new("buyer-a.com")];
        let input: BuyerInput =
            serde_json::from_slice(&compressor::decompress(data).unwrap()).unwrap();
        assert!(!input.custom_audiences.is_empty());
        assert!(input.custom_audiences.len() < 100);
        assert_eq!(input.custom_audiences[0].name, "audience-099");
    }

    #[tokio::test]
    async fn per_buyer_targets_skew_the_allocation() {
        let store = Arc::new(InMemoryCustomAudienceStore::new());
        for i in 0..30 {
            store.insert(audience("big-buyer.com", &format!("big-{i:02}"), 1.0, 300));
            store.insert(audience("small-buyer.com", &format!("small-{i:02}"), 1.0, 300));
        }
        let mut per_buyer_configurations = BTreeMap::new();
        per_buyer_configurations.insert(
            AdTechIdentifier::new("big-buyer.com"),
            PerBuyerConfiguration {
                target_input_size_bytes: 6_000,
            },
        );
        per_buyer_configurations.insert(
            AdTechIdentifier::new("small-buyer.com"),
            PerBuyerConfiguration {
                target_input_size_bytes: 600,
            },
        );
        let configuration = SellerConfiguration {
            max_payload_size_bytes: 8_192,
            per_buyer_configurations,
        };

        let generated = generator(store)
            .create_compressed_buyer_inputs(Some(&configuration), Utc::now())
            .await
            .unwrap();

        let big = generated
            .custom_audience_counts
            .get(&AdTechIdentifier::new("big-buyer.com"))
            .copied()
            .unwrap_or(0);
        let small = generated
            .custom_audience_counts
            .get(&AdTechIdentifier::new("small-buyer.com"))
            .copied()
            .unwrap_or(0);
        assert!(big > small, "big buyer ({big}) should out-pack small buyer ({small})");
        assert!(
            generated.total_payload_contribution() + PAYLOAD_ENVELOPE_RESERVE_BYTES <= 8_192
        );
    }

    #[tokio::test]
    async fn empty_store_yields_an_empty_map() {
        let store = Arc::new(InMemoryCustomAudienceStore::new());
        let generated = generator(store)
            .create_compressed_buyer_inputs(None, Utc::now())
            .await
            .unwrap();
        assert!(generated.compressed.is_empty());
    }
}
