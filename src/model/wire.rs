// src/model/wire.rs
//
// 出站载荷的内层结构：每个买方一份 BuyerInput，单独压缩后以 base64
// 放进 ProtectedAuctionInput 的 map，再整体封装、加密。

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::model::adtech::AdTechIdentifier;

/// 买方输入里的单个自定义受众描述
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BuyerInputCustomAudience {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub bidding_signals_keys: Vec<String>,
    #[serde(default)]
    pub user_bidding_signals: String,
    /// 只上送 render id，素材地址留在设备侧
    #[serde(default)]
    pub ad_render_ids: Vec<String>,
}

/// 编码后的应用信号载荷
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProtectedAppSignals {
    #[serde(default)]
    pub app_install_signals: Vec<u8>,
    #[serde(default)]
    pub encoding_version: i32,
}

/// 单个买方的候选集合
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BuyerInput {
    #[serde(default)]
    pub custom_audiences: Vec<BuyerInputCustomAudience>,
    #[serde(default)]
    pub protected_app_signals: Option<ProtectedAppSignals>,
}

/// 出站载荷外层：买方 → base64(压缩后的 BuyerInput)
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProtectedAuctionInput {
    #[serde(default)]
    pub buyer_input: BTreeMap<String, String>,
    pub publisher_name: String,
    /// 每次请求的会话 id（字符串形式，与竞价服务端约定）
    pub generation_id: String,
    #[serde(default)]
    pub enable_debug_reporting: bool,
}

impl ProtectedAuctionInput {
    pub fn insert_buyer_input(&mut self, buyer: &AdTechIdentifier, compressed: &[u8]) {
        self.buyer_input
            .insert(buyer.as_str().to_string(), BASE64.encode(compressed));
    }

    pub fn buyer_input_bytes(&self, buyer: &str) -> Option<Vec<u8>> {
        let encoded = self.buyer_input.get(buyer)?;
        BASE64.decode(encoded.as_bytes()).ok()
    }
}
