// src/auction/validator.rs

use tracing::warn;

use crate::error::{ExchangeError, ExchangeResult};
use crate::model::adtech::{uri_host, AdTechIdentifier};
use crate::model::auction::AuctionResult;

pub const AD_TECH_ROLE_BUYER: &str = "buyer";
pub const AD_TECH_ROLE_SELLER: &str = "seller";
pub const AD_TECH_ROLE_COMPONENT_SELLER: &str = "component seller";

/// 校验某个 URI 是否归属于给定 ad-tech（host 为本域或子域）
pub struct AdTechUriValidator {
    pub ad_tech_role: &'static str,
    pub ad_tech: AdTechIdentifier,
    pub field_name: &'static str,
}

impl AdTechUriValidator {
    pub fn new(
        ad_tech_role: &'static str,
        ad_tech: AdTechIdentifier,
        field_name: &'static str,
    ) -> Self {
        Self {
            ad_tech_role,
            ad_tech,
            field_name,
        }
    }

    pub fn validate(&self, uri: &str) -> ExchangeResult<()> {
        if uri.is_empty() {
            return Err(ExchangeError::invalid_argument(format!(
                "{} is empty",
                self.field_name
            )));
        }
        let host = uri_host(uri).ok_or_else(|| {
            ExchangeError::invalid_argument(format!(
                "{} `{uri}` has no host",
                self.field_name
            ))
        })?;
        if !self.ad_tech.owns_host(host) {
            return Err(ExchangeError::invalid_argument(format!(
                "{} `{uri}` does not belong to the {} {}",
                self.field_name, self.ad_tech_role, self.ad_tech
            )));
        }
        Ok(())
    }

    /// 校验失败返回空串（静默丢弃，只留日志）—— 用于报告地址这类
    /// 单项失败不拖垮整个请求的字段
    pub fn validate_and_return_empty_if_invalid(&self, uri: &str) -> String {
        match self.validate(uri) {
            Ok(()) => uri.to_string(),
            Err(e) => {
                warn!("Dropping {}: {}", self.field_name, e);
                String::new()
            }
        }
    }
}

/// 解密出的竞价结果的结构校验（会话匹配在运行器里另行处理）
pub struct AuctionResultValidator;

impl AuctionResultValidator {
    pub fn validate(result: &AuctionResult) -> ExchangeResult<()> {
        if result.buyer.is_empty() {
            return Err(ExchangeError::invalid_argument(
                "AuctionResult has no buyer".to_string(),
            ));
        }
        if result.bid < 0.0 || result.score < 0.0 {
            return Err(ExchangeError::invalid_argument(format!(
                "AuctionResult has a negative bid ({}) or score ({})",
                result.bid, result.score
            )));
        }
        let buyer = AdTechIdentifier::new(result.buyer.clone());
        AdTechUriValidator::new(AD_TECH_ROLE_BUYER, buyer, "ad render uri")
            .validate(&result.ad_render_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::auction::AdType;

    fn winner() -> AuctionResult {
        AuctionResult {
            ad_render_url: "https://winner-buyer.com/render_uri".into(),
            custom_audience_name: "test-name-1".into(),
            custom_audience_owner: "winner-owner".into(),
            buyer: "winner-buyer.com".into(),
            bid: 5.0,
            score: 5.0,
            ad_type: AdType::RemarketingAd,
            ..Default::default()
        }
    }

    #[test]
    fn well_formed_winner_passes() {
        assert!(AuctionResultValidator::validate(&winner()).is_ok());
    }

    #[test]
    fn render_uri_must_belong_to_the_buyer() {
        let mut result = winner();
        result.ad_render_url = "https://other.com/render_uri".into();
        assert!(AuctionResultValidator::validate(&result).is_err());
    }

    #[test]
    fn negative_bid_is_rejected() {
        let mut result = winner();
        result.bid = -1.0;
        assert!(AuctionResultValidator::validate(&result).is_err());
    }

    #[test]
    fn uri_validator_silently_drops_foreign_hosts() {
        let validator = AdTechUriValidator::new(
            AD_TECH_ROLE_SELLER,
            AdTechIdentifier::new("seller.com"),
            "seller win reporting uri",
        );
        assert_eq!(
            validator.validate_and_return_empty_if_invalid("https://seller.com/reporting"),
            "https://seller.com/reporting"
        );
        assert_eq!(
            validator.validate_and_return_empty_if_invalid("https://attacker.com/reporting"),
            ""
        );
    }
}
