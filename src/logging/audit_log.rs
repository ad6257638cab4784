// src/logging/audit_log.rs

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// **竞价数据交换审计日志**（每次 API 调用一条）
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuctionAuditLog {
    pub timestamp: String,        // 记录时间
    pub log_type: String,         // "get_ad_selection_data" / "persist_ad_selection_result"
    pub trace_id: String,         // 请求级 trace id
    pub ad_selection_id: u64,     // 会话 id（撤回同意时为 0）
    pub caller_package: String,   // 调用方包名
    pub seller: String,           // 卖方
    pub status: String,           // "success" / "invalid_argument" / "timeout" / ...
    pub payload_size_bytes: usize, // 出站密文 / 入站密文体积
    pub winner_type: Option<String>, // "remarketing" / "app_install" / "no_winner"
    pub latency_ms: u128,         // 整体耗时
}

impl AuctionAuditLog {
    pub fn new(log_type: &str, trace_id: &str, caller_package: &str, seller: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            log_type: log_type.to_string(),
            trace_id: trace_id.to_string(),
            ad_selection_id: 0,
            caller_package: caller_package.to_string(),
            seller: seller.to_string(),
            status: "failure".to_string(), // 默认失败，成功路径上更新
            payload_size_bytes: 0,
            winner_type: None,
            latency_ms: 0,
        }
    }

    /// **标记成功**
    pub fn set_success(&mut self, ad_selection_id: u64, payload_size_bytes: usize) {
        self.status = "success".to_string();
        self.ad_selection_id = ad_selection_id;
        self.payload_size_bytes = payload_size_bytes;
    }

    /// **标记失败分类**
    pub fn set_failure(&mut self, status: &str) {
        self.status = status.to_string();
    }

    pub fn set_winner_type(&mut self, winner_type: &str) {
        self.winner_type = Some(winner_type.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_log_records_outcome_transitions() {
        let mut log = AuctionAuditLog::new(
            "persist_ad_selection_result",
            "trace-1",
            "com.example.app",
            "seller.com",
        );
        assert_eq!(log.status, "failure");

        log.set_success(42, 2048);
        log.set_winner_type("remarketing");
        assert_eq!(log.status, "success");
        assert_eq!(log.ad_selection_id, 42);
        assert_eq!(log.winner_type.as_deref(), Some("remarketing"));

        let text = serde_json::to_string(&log).unwrap();
        assert!(text.contains("\"payload_size_bytes\":2048"));
    }
}
