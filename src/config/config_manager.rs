// src/config/config_manager.rs
//
// 服务配置：启动时构造一次，不可变，显式传给每个组件。
// 没有任何全局可变状态 —— 想改行为就重建一份配置。

use serde::{Deserialize, Serialize};

use crate::codec::compressor::CompressorVersion;
use crate::codec::formatter::{FormatterVersion, DEFAULT_BUCKET_SIZES};
use crate::data::ad_selection::BeaconCountLimits;
use crate::data::frequency_cap::HistogramLimits;
use crate::keys::key_manager::CoordinatorPolicy;

/// 交换服务的全部可配置项
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    /// 单次操作（出站或入站流水线）的整体时限
    pub overall_timeout_ms: u64,
    /// 协调方公钥拉取的独立时限
    pub key_fetch_timeout_ms: u64,
    /// 公钥清单未带过期时间时的最大存活期
    pub key_max_age_seconds: i64,

    /// 载荷封装版本：0 = 按桶取整，1 = 精确体积
    pub payload_format_version: u8,
    /// 压缩算法版本：0 = identity，2 = gzip
    pub compression_algorithm_version: u8,
    pub payload_bucket_sizes: Vec<usize>,
    /// 精确体积封装的默认目标（未随请求下发卖方配置时用）
    pub exact_size_target_bytes: usize,

    /// 是否启用卖方载荷体积配置
    pub seller_configuration_enabled: bool,
    pub frequency_cap_filtering_enabled: bool,
    pub app_install_filtering_enabled: bool,
    /// 单个买方的编码信号载荷上限
    pub per_buyer_signals_max_size_bytes: usize,

    pub multi_cloud_enabled: bool,
    pub default_coordinator_origin: String,
    pub coordinator_allowlist: Vec<String>,
    pub refresh_keys_on_expiry: bool,

    /// 交互信标 key / 上报地址的字节上限
    pub max_interaction_key_size_bytes: usize,
    pub max_interaction_reporting_uri_size_bytes: usize,
    /// 交互信标的总量 / 每目的地上限
    pub max_registered_beacons_total_count: usize,
    pub max_registered_beacons_per_destination_count: usize,

    /// 频控直方图容量（绝对上限 / 较低目标，全局与按买方）
    pub histogram_absolute_max_total_event_count: usize,
    pub histogram_lower_max_total_event_count: usize,
    pub histogram_absolute_max_per_buyer_event_count: usize,
    pub histogram_lower_max_per_buyer_event_count: usize,

    /// owner 缺失时是否按 (buyer, name) 兜底检索（兼容模式，上游
    /// 保证回填 owner 后移除）
    pub force_search_on_absent_owner: bool,
    /// 是否把组件卖方的报告端点也落库
    pub report_event_for_component_seller_enabled: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            overall_timeout_ms: 10_000,
            key_fetch_timeout_ms: 1_000,
            key_max_age_seconds: 14 * 24 * 3600,

            payload_format_version: FormatterVersion::VERSION_V0,
            compression_algorithm_version: CompressorVersion::GZIP,
            payload_bucket_sizes: DEFAULT_BUCKET_SIZES.clone(),
            exact_size_target_bytes: 65536,

            seller_configuration_enabled: true,
            frequency_cap_filtering_enabled: true,
            app_install_filtering_enabled: true,
            per_buyer_signals_max_size_bytes: 10 * 1024,

            multi_cloud_enabled: false,
            default_coordinator_origin: "https://publickeyservice.pa.gcp.privacysandboxservices.com"
                .to_string(),
            coordinator_allowlist: Vec::new(),
            refresh_keys_on_expiry: true,

            max_interaction_key_size_bytes: 40,
            max_interaction_reporting_uri_size_bytes: 400,
            max_registered_beacons_total_count: 10,
            max_registered_beacons_per_destination_count: 10,

            histogram_absolute_max_total_event_count: 10_000,
            histogram_lower_max_total_event_count: 9_500,
            histogram_absolute_max_per_buyer_event_count: 1_000,
            histogram_lower_max_per_buyer_event_count: 950,

            force_search_on_absent_owner: false,
            report_event_for_component_seller_enabled: false,
        }
    }
}

impl ServiceConfig {
    /// 解析出站侧使用的封装器
    pub fn payload_formatter(&self) -> FormatterVersion {
        match self.payload_format_version {
            FormatterVersion::VERSION_EXACT_SIZE => FormatterVersion::ExactSize {
                target_bytes: self.exact_size_target_bytes,
            },
            _ => FormatterVersion::V0 {
                bucket_sizes: self.payload_bucket_sizes.clone(),
            },
        }
    }

    pub fn compressor(&self) -> CompressorVersion {
        CompressorVersion::from_version(self.compression_algorithm_version)
            .unwrap_or(CompressorVersion::Gzip)
    }

    pub fn histogram_limits(&self) -> HistogramLimits {
        HistogramLimits {
            absolute_max_total_event_count: self.histogram_absolute_max_total_event_count,
            lower_max_total_event_count: self.histogram_lower_max_total_event_count,
            absolute_max_per_buyer_event_count: self.histogram_absolute_max_per_buyer_event_count,
            lower_max_per_buyer_event_count: self.histogram_lower_max_per_buyer_event_count,
        }
    }

    pub fn beacon_count_limits(&self) -> BeaconCountLimits {
        BeaconCountLimits {
            max_total_count: self.max_registered_beacons_total_count,
            max_per_destination_count: self.max_registered_beacons_per_destination_count,
        }
    }

    pub fn coordinator_policy(&self) -> CoordinatorPolicy {
        CoordinatorPolicy {
            multi_cloud_enabled: self.multi_cloud_enabled,
            default_coordinator_origin: self.default_coordinator_origin.clone(),
            coordinator_allowlist: self.coordinator_allowlist.clone(),
            refresh_keys_on_expiry: self.refresh_keys_on_expiry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_v0_buckets_and_gzip() {
        let config = ServiceConfig::default();
        assert!(matches!(
            config.payload_formatter(),
            FormatterVersion::V0 { .. }
        ));
        assert_eq!(config.compressor(), CompressorVersion::Gzip);
    }

    #[test]
    fn exact_size_version_switches_the_formatter() {
        let config = ServiceConfig {
            payload_format_version: FormatterVersion::VERSION_EXACT_SIZE,
            exact_size_target_bytes: 8192,
            ..Default::default()
        };
        assert_eq!(
            config.payload_formatter(),
            FormatterVersion::ExactSize { target_bytes: 8192 }
        );
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = ServiceConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: ServiceConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.overall_timeout_ms, config.overall_timeout_ms);
        assert_eq!(back.payload_bucket_sizes, config.payload_bucket_sizes);
    }
}
