// src/model/adtech.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ad-tech 身份标识（eTLD+1 形式的域名，例如 "winner-buyer.com"）
///
/// 买方、卖方、组件卖方都用同一种标识。比较时忽略大小写。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AdTechIdentifier(String);

impl AdTechIdentifier {
    pub fn new(domain: impl Into<String>) -> Self {
        Self(domain.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 判断某个 URI 的 host 是否归属于该 ad-tech（本域或其子域）
    ///
    /// 报告地址、交互地址、广告素材地址都要通过这条规则。
    pub fn owns_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        host == self.0 || host.ends_with(&format!(".{}", self.0))
    }
}

impl fmt::Display for AdTechIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdTechIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 从 URI 中取出 host 部分（不依赖完整的 URL 解析库）
///
/// 支持 `https://host/path`、`host/path` 两种写法；端口会被剥掉。
pub fn uri_host(uri: &str) -> Option<&str> {
    let rest = uri.split_once("://").map(|(_, r)| r).unwrap_or(uri);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').last()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owns_host_matches_domain_and_subdomains() {
        let buyer = AdTechIdentifier::new("winner-buyer.com");
        assert!(buyer.owns_host("winner-buyer.com"));
        assert!(buyer.owns_host("cdn.winner-buyer.com"));
        assert!(buyer.owns_host("WINNER-BUYER.COM"));
        assert!(!buyer.owns_host("evil-winner-buyer.com"));
        assert!(!buyer.owns_host("other.com"));
    }

    #[test]
    fn uri_host_handles_scheme_port_and_bare_forms() {
        assert_eq!(uri_host("https://a.b.com/x?y=1"), Some("a.b.com"));
        assert_eq!(uri_host("a.b.com/render"), Some("a.b.com"));
        assert_eq!(uri_host("https://a.b.com:8443/x"), Some("a.b.com"));
        assert_eq!(uri_host(""), None);
    }
}
