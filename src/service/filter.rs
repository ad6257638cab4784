// src/service/filter.rs
//
// 编排前的请求闸门。同意撤回不是错误：调用方会拿到一个"空成功"，
// 从响应上无法区分自己是否被过滤（避免泄露同意状态）。

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::error::{ExchangeError, ExchangeResult};
use crate::model::adtech::AdTechIdentifier;

/// 过滤结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Allowed,
    /// 调用方已撤回同意：上层返回空成功，不碰任何存储与密钥
    RevokedConsent,
}

/// 请求过滤器
#[derive(Default)]
pub struct RequestFilter {
    revoked_consent_callers: RwLock<HashSet<String>>,
}

impl RequestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke_consent(&self, caller_package_name: &str) {
        self.revoked_consent_callers
            .write()
            .insert(caller_package_name.to_string());
    }

    pub fn filter_request(
        &self,
        seller: &AdTechIdentifier,
        caller_package_name: &str,
    ) -> ExchangeResult<FilterOutcome> {
        if seller.is_empty() {
            return Err(ExchangeError::invalid_argument("seller is empty"));
        }
        if caller_package_name.is_empty() {
            return Err(ExchangeError::invalid_argument(
                "caller package name is empty",
            ));
        }
        if self
            .revoked_consent_callers
            .read()
            .contains(caller_package_name)
        {
            return Ok(FilterOutcome::RevokedConsent);
        }
        Ok(FilterOutcome::Allowed)
    }
}
