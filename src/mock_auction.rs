// src/mock_auction.rs

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::serve;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::codec::compressor::{self, CompressedData};
use crate::codec::formatter::{self, FormattedData, FormatterVersion, UnformattedData};
use crate::crypto::oblivious::{gateway_open_request, gateway_seal_response};
use crate::model::auction::{AdType, AuctionResult};
use crate::model::wire::{BuyerInput, ProtectedAuctionInput};

/// Mock 竞价服务端的密钥材料（同时充当协调方）
pub struct MockAuctionServer {
    secret: StaticSecret,
    pub key_id: u8,
}

impl MockAuctionServer {
    pub fn generate() -> Arc<Self> {
        Arc::new(Self {
            secret: StaticSecret::random_from_rng(OsRng),
            key_id: 1,
        })
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(PublicKey::from(&self.secret).as_bytes())
    }
}

/// 设备发来的竞价请求（密文走 base64）
#[derive(Deserialize)]
struct MockAuctionRequest {
    ad_selection_id: u64,
    payload: String,
}

#[derive(Serialize)]
struct MockAuctionResponse {
    payload: String,
}

/// 协调方公钥端点，与真实部署的 /v1/publicKeys 形状一致
async fn handle_public_keys(State(server): State<Arc<MockAuctionServer>>) -> Json<serde_json::Value> {
    Json(json!({
        "keys": [
            { "id": server.key_id, "key": server.public_key_base64() }
        ]
    }))
}

/// 模拟竞价：解开设备载荷，从第一个买方输入里挑最靠前的候选当胜者。
/// 没有任何候选时返回 chaff，让设备侧走空成功路径。
async fn handle_auction(
    State(server): State<Arc<MockAuctionServer>>,
    Json(request): Json<MockAuctionRequest>,
) -> Result<Json<MockAuctionResponse>, axum::http::StatusCode> {
    // 模拟服务端竞价耗时（10 ~ 50 毫秒）
    let delay_ms = rand::thread_rng().gen_range(10..50);
    sleep(Duration::from_millis(delay_ms)).await;

    let sealed = BASE64
        .decode(request.payload.as_bytes())
        .map_err(|_| axum::http::StatusCode::BAD_REQUEST)?;

    let (formatted, gateway_context) = gateway_open_request(
        &sealed,
        request.ad_selection_id,
        &server.secret,
        server.key_id,
    )
    .map_err(|e| {
        warn!("Mock auction failed to open payload: {e}");
        axum::http::StatusCode::BAD_REQUEST
    })?;

    let (unformatted, compressed_meta) = formatter::unformat(&FormattedData { data: formatted })
        .map_err(|_| axum::http::StatusCode::BAD_REQUEST)?;
    let protected_auction_input: ProtectedAuctionInput =
        serde_json::from_slice(&unformatted.data)
            .map_err(|_| axum::http::StatusCode::BAD_REQUEST)?;
    info!(
        "Mock auction received payload: generation_id={}, buyers={}",
        protected_auction_input.generation_id,
        protected_auction_input.buyer_input.len()
    );

    let auction_result = pick_winner(&protected_auction_input, compressed_meta.version);

    let serialized =
        serde_json::to_vec(&auction_result).map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    let compressed = compressor::compress(&serialized, compressed_meta.version)
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    let formatted_response = formatter::format(
        &UnformattedData { data: compressed.data },
        &FormatterVersion::v0_default(),
        compressed_meta.version,
    )
    .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    let response = gateway_seal_response(
        &formatted_response.data,
        request.ad_selection_id,
        &gateway_context,
    )
    .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(MockAuctionResponse {
        payload: BASE64.encode(&response),
    }))
}

fn pick_winner(
    input: &ProtectedAuctionInput,
    compressor_version: crate::codec::compressor::CompressorVersion,
) -> AuctionResult {
    for (buyer, _) in input.buyer_input.iter() {
        let Some(bytes) = input.buyer_input_bytes(buyer) else {
            continue;
        };
        let decompressed = match compressor::decompress(&CompressedData {
            version: compressor_version,
            data: bytes,
        }) {
            Ok(data) => data,
            Err(_) => continue,
        };
        let Ok(buyer_input) = serde_json::from_slice::<BuyerInput>(&decompressed) else {
            continue;
        };
        if let Some(audience) = buyer_input.custom_audiences.first() {
            let render_id = audience
                .ad_render_ids
                .first()
                .cloned()
                .unwrap_or_else(|| "ad".to_string());
            let mut result = AuctionResult {
                ad_render_url: format!("https://{buyer}/render/{render_id}"),
                custom_audience_name: audience.name.clone(),
                custom_audience_owner: audience.owner.clone(),
                buyer: buyer.clone(),
                bid: rand::thread_rng().gen_range(1.0..10.0),
                score: rand::thread_rng().gen_range(1.0..10.0),
                is_chaff: false,
                ad_type: AdType::RemarketingAd,
                ..Default::default()
            };
            result.win_reporting_urls.buyer_reporting_urls.reporting_url =
                format!("https://{buyer}/reporting/win");
            return result;
        }
    }

    // 没有候选：chaff
    AuctionResult {
        is_chaff: true,
        ..Default::default()
    }
}

/// 启动 Mock 竞价服务端
/// 监听指定端口，`/v1/publicKeys` 发公钥，`/auction` 做模拟竞价
pub async fn start_mock_auction_server(port: u16, server: Arc<MockAuctionServer>) {
    let app = Router::new()
        .route("/v1/publicKeys", get(handle_public_keys))
        .route("/auction", post(handle_auction))
        .with_state(server);

    let addr = format!("0.0.0.0:{}", port);
    info!("Mock auction server running at http://{}", addr);

    let listener = TcpListener::bind(&addr).await.unwrap();
    serve(listener, app).await.unwrap();
}
