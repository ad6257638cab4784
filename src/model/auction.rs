// src/model/auction.rs

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::adtech::AdTechIdentifier;

/// 竞价会话（getAdSelectionData 成功后落库，persist 时校验）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionSession {
    pub seller: AdTechIdentifier,
    pub caller_package_name: String,
    pub creation_time: DateTime<Utc>,
}

/// 竞价服务端返回的广告类型
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdType {
    #[default]
    Unknown,
    RemarketingAd,
    AppInstallAd,
}

/// 服务端报告的业务错误（code 非 0 即有效）
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AuctionResultError {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// 单个角色（买方/卖方/组件卖方）的胜出报告端点
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ReportingUrls {
    #[serde(default)]
    pub reporting_url: String,
    /// 交互 key → 上报地址
    #[serde(default)]
    pub interaction_reporting_urls: BTreeMap<String, String>,
}

/// 胜出报告端点集合
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WinReportingUrls {
    #[serde(default)]
    pub buyer_reporting_urls: ReportingUrls,
    #[serde(default)]
    pub top_level_seller_reporting_urls: ReportingUrls,
    #[serde(default)]
    pub component_seller_reporting_urls: ReportingUrls,
}

/// 解密后的竞价结果（胜出描述符）
///
/// `is_chaff == true` 表示服务端刻意返回的空结果，与业务错误区分开。
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AuctionResult {
    #[serde(default)]
    pub ad_render_url: String,
    #[serde(default)]
    pub custom_audience_name: String,
    /// 兼容期内可能缺失，见 persist 流程的 absent-owner 分支
    #[serde(default)]
    pub custom_audience_owner: String,
    #[serde(default)]
    pub buyer: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub bid: f32,
    #[serde(default)]
    pub is_chaff: bool,
    #[serde(default)]
    pub ad_type: AdType,
    #[serde(default)]
    pub win_reporting_urls: WinReportingUrls,
    #[serde(default)]
    pub error: Option<AuctionResultError>,
    /// 多卖方竞价中实际胜出的卖方
    #[serde(default)]
    pub winning_seller: String,
}

impl AuctionResult {
    pub fn has_error(&self) -> bool {
        self.error.as_ref().map(|e| e.code != 0).unwrap_or(false)
    }
}

/// 胜出广告落库记录
#[derive(Debug, Clone, PartialEq)]
pub struct WinnerRecord {
    pub bid: f64,
    pub ad_render_uri: String,
    pub buyer: AdTechIdentifier,
    pub custom_audience_owner: String,
    pub custom_audience_name: String,
    pub ad_counter_keys: BTreeSet<i32>,
}

/// 胜出报告地址（仅非 chaff、非错误时写入）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportingData {
    pub buyer_win_reporting_uri: String,
    pub seller_win_reporting_uri: String,
    pub component_seller_win_reporting_uri: String,
}

/// 交互信标的归属方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportingDestination {
    Seller,
    Buyer,
    ComponentSeller,
}

/// 一条注册的交互信标
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredAdInteraction {
    pub destination: ReportingDestination,
    pub interaction_key: String,
    pub interaction_reporting_uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_requires_nonzero_code() {
        let mut result = AuctionResult::default();
        assert!(!result.has_error());
        result.error = Some(AuctionResultError {
            code: 0,
            message: "ignored".into(),
        });
        assert!(!result.has_error());
        result.error = Some(AuctionResultError {
            code: -1,
            message: "AuctionServerError: Bad things happened!".into(),
        });
        assert!(result.has_error());
    }

    #[test]
    fn auction_result_round_trips_through_json() {
        let mut result = AuctionResult {
            ad_render_url: "https://winner-buyer.com/render_uri".into(),
            custom_audience_name: "test-name-1".into(),
            custom_audience_owner: "winner-owner".into(),
            buyer: "winner-buyer.com".into(),
            score: 5.0,
            bid: 5.0,
            ad_type: AdType::RemarketingAd,
            ..Default::default()
        };
        result
            .win_reporting_urls
            .buyer_reporting_urls
            .interaction_reporting_urls
            .insert("click".into(), "https://winner-buyer.com/interaction".into());

        let bytes = serde_json::to_vec(&result).unwrap();
        let back: AuctionResult = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(result, back);
    }
}
