// src/model/custom_audience.rs

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::adtech::AdTechIdentifier;

/// 广告事件类型（频控直方图的维度之一）
///
/// Win 事件只能由落库协调器在胜出时写入，外部更新接口会拒绝。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdEventType {
    Win,
    Impression,
    View,
    Click,
}

/// 单条 keyed 频控规则：key 在 interval 内的事件数达到 max_count 即过滤
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyedFrequencyCap {
    pub ad_counter_key: i32,  // 计数 key
    pub max_count: usize,     // 滚动窗口内允许的最大事件数
    pub interval_seconds: i64, // 滚动窗口长度（秒）
}

impl KeyedFrequencyCap {
    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_seconds)
    }
}

/// 按事件类型分组的频控规则集合
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FrequencyCapFilters {
    #[serde(default)]
    pub for_win_events: Vec<KeyedFrequencyCap>,
    #[serde(default)]
    pub for_impression_events: Vec<KeyedFrequencyCap>,
    #[serde(default)]
    pub for_view_events: Vec<KeyedFrequencyCap>,
    #[serde(default)]
    pub for_click_events: Vec<KeyedFrequencyCap>,
}

impl FrequencyCapFilters {
    pub fn is_empty(&self) -> bool {
        self.for_win_events.is_empty()
            && self.for_impression_events.is_empty()
            && self.for_view_events.is_empty()
            && self.for_click_events.is_empty()
    }
}

/// 应用安装过滤：广告要求这些包名都已对该买方注册安装
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AppInstallFilters {
    #[serde(default)]
    pub package_names: BTreeSet<String>,
}

/// 广告维度的过滤条件
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AdFilters {
    pub frequency_cap_filters: Option<FrequencyCapFilters>,
    pub app_install_filters: Option<AppInstallFilters>,
}

/// 候选广告
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdData {
    pub render_uri: String,          // 素材地址
    pub ad_render_id: String,        // 服务端竞价用的短 id
    #[serde(default)]
    pub metadata: String,            // 买方自定义元数据（JSON 字符串）
    #[serde(default)]
    pub ad_counter_keys: BTreeSet<i32>, // 频控计数 key
    #[serde(default)]
    pub filters: Option<AdFilters>,
}

/// 自定义受众（某买方名下、以 owner+name 定位的一组候选广告）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CustomAudience {
    pub owner: String,               // 创建方包名
    pub buyer: AdTechIdentifier,     // 所属买方
    pub name: String,
    pub activation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    /// 打包优先级，越大越优先进入载荷
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub trusted_bidding_keys: Vec<String>,
    #[serde(default)]
    pub user_bidding_signals: String, // JSON 字符串
    #[serde(default)]
    pub ads: Vec<AdData>,
}

impl CustomAudience {
    /// 当前时刻是否可参与竞价：已激活且未过期
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.activation_time <= now && now < self.expiration_time
    }
}

/// 频控直方图中的一条事件
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramEvent {
    pub buyer: AdTechIdentifier,
    pub ad_counter_key: i32,
    pub event_type: AdEventType,
    pub timestamp: DateTime<Utc>,
}

/// 卖方对载荷体积的要求（可选，随请求下发）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SellerConfiguration {
    /// 最终载荷（压缩+封装后）的总字节上限
    pub max_payload_size_bytes: usize,
    /// 每个买方期望占用的字节数；未列出的买方没有单独目标
    #[serde(default)]
    pub per_buyer_configurations: BTreeMap<AdTechIdentifier, PerBuyerConfiguration>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PerBuyerConfiguration {
    pub target_input_size_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audience(activation_offset_secs: i64, expiry_offset_secs: i64) -> CustomAudience {
        let now = Utc::now();
        CustomAudience {
            owner: "com.example.app".into(),
            buyer: AdTechIdentifier::new("buyer.com"),
            name: "shoes".into(),
            activation_time: now + Duration::seconds(activation_offset_secs),
            expiration_time: now + Duration::seconds(expiry_offset_secs),
            priority: 0.0,
            trusted_bidding_keys: vec![],
            user_bidding_signals: String::new(),
            ads: vec![],
        }
    }

    #[test]
    fn audience_active_only_between_activation_and_expiry() {
        let now = Utc::now();
        assert!(audience(-10, 10).is_active(now));
        assert!(!audience(5, 10).is_active(now), "not yet activated");
        assert!(!audience(-10, -5).is_active(now), "already expired");
    }
}
