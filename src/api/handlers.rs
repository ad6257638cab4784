// src/api/handlers.rs

use axum::{extract::State, http::StatusCode, Json};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::logging::audit_log::AuctionAuditLog;
use crate::model::adtech::AdTechIdentifier;
use crate::model::custom_audience::{AdEventType, SellerConfiguration};
use crate::service::get_data::GetAdSelectionDataRequest;
use crate::service::histogram_update::UpdateAdCounterHistogramRequest;
use crate::service::persist_result::PersistAdSelectionResultRequest;
use crate::AppState;

/// 统一的错误响应体
#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub status_code: u16,
    pub error_message: String,
}

fn error_response(error: &ExchangeError) -> (StatusCode, Json<ErrorResponse>) {
    let status_code = error.status_code();
    (
        StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse {
            status_code,
            error_message: error.to_string(),
        }),
    )
}

fn audit_status(error: &ExchangeError) -> &'static str {
    match error {
        ExchangeError::InvalidArgument(_) => "invalid_argument",
        ExchangeError::Timeout(_) => "timeout",
        ExchangeError::Decryption(_) => "decryption_failure",
        ExchangeError::Internal(_) => "internal_error",
    }
}

#[derive(Deserialize, Debug)]
pub struct GetAdSelectionDataApiRequest {
    pub seller: String,
    pub caller_package_name: String,
    #[serde(default)]
    pub coordinator_origin: Option<String>,
    #[serde(default)]
    pub seller_configuration: Option<SellerConfiguration>,
}

#[derive(Serialize, Debug)]
pub struct GetAdSelectionDataApiResponse {
    pub ad_selection_id: u64,
    /// 加密载荷，base64
    pub ad_selection_data: String,
}

/// **处理 getAdSelectionData 请求**
pub async fn handle_get_ad_selection_data(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GetAdSelectionDataApiRequest>,
) -> Result<Json<GetAdSelectionDataApiResponse>, (StatusCode, Json<ErrorResponse>)> {
    let start = Instant::now();
    let trace_id = Uuid::new_v4().to_string();
    let mut audit = AuctionAuditLog::new(
        "get_ad_selection_data",
        &trace_id,
        &request.caller_package_name,
        &request.seller,
    );

    let result = state
        .get_data_runner
        .run(GetAdSelectionDataRequest {
            seller: AdTechIdentifier::new(request.seller),
            caller_package_name: request.caller_package_name,
            coordinator_origin: request.coordinator_origin,
            seller_configuration: request.seller_configuration,
        })
        .await;
    audit.latency_ms = start.elapsed().as_millis();

    match result {
        Ok(response) => {
            audit.set_success(response.ad_selection_id, response.ad_selection_data.len());
            state.runtime_logger.log(audit).await;
            Ok(Json(GetAdSelectionDataApiResponse {
                ad_selection_id: response.ad_selection_id,
                ad_selection_data: BASE64.encode(&response.ad_selection_data),
            }))
        }
        Err(error) => {
            audit.set_failure(audit_status(&error));
            state.runtime_logger.log(audit).await;
            Err(error_response(&error))
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct PersistAdSelectionResultApiRequest {
    pub ad_selection_id: u64,
    pub seller: String,
    pub caller_package_name: String,
    /// 竞价服务端返回的密文，base64
    pub ad_selection_result: String,
}

#[derive(Serialize, Debug)]
pub struct PersistAdSelectionResultApiResponse {
    pub ad_selection_id: u64,
    pub ad_render_uri: String,
}

/// **处理 persistAdSelectionResult 请求**
pub async fn handle_persist_ad_selection_result(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PersistAdSelectionResultApiRequest>,
) -> Result<Json<PersistAdSelectionResultApiResponse>, (StatusCode, Json<ErrorResponse>)> {
    let start = Instant::now();
    let trace_id = Uuid::new_v4().to_string();
    let mut audit = AuctionAuditLog::new(
        "persist_ad_selection_result",
        &trace_id,
        &request.caller_package_name,
        &request.seller,
    );

    let ciphertext = BASE64
        .decode(request.ad_selection_result.as_bytes())
        .map_err(|e| {
            error_response(&ExchangeError::invalid_argument(format!(
                "ad_selection_result is not valid base64: {e}"
            )))
        })?;
    audit.payload_size_bytes = ciphertext.len();

    let result = state
        .persist_runner
        .run(PersistAdSelectionResultRequest {
            ad_selection_id: request.ad_selection_id,
            seller: AdTechIdentifier::new(request.seller),
            caller_package_name: request.caller_package_name,
            ad_selection_result: ciphertext,
        })
        .await;
    audit.latency_ms = start.elapsed().as_millis();

    match result {
        Ok(response) => {
            let payload_size = audit.payload_size_bytes;
            audit.set_success(response.ad_selection_id, payload_size);
            audit.set_winner_type(if response.ad_render_uri.is_empty() {
                "no_winner"
            } else {
                "winner"
            });
            state.runtime_logger.log(audit).await;
            Ok(Json(PersistAdSelectionResultApiResponse {
                ad_selection_id: response.ad_selection_id,
                ad_render_uri: response.ad_render_uri,
            }))
        }
        Err(error) => {
            audit.set_failure(audit_status(&error));
            state.runtime_logger.log(audit).await;
            Err(error_response(&error))
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct UpdateAdCounterHistogramApiRequest {
    pub ad_selection_id: u64,
    /// "impression" / "view" / "click"
    pub event_type: AdEventType,
    pub caller_package_name: String,
}

/// **处理 updateAdCounterHistogram 请求**
pub async fn handle_update_ad_counter_histogram(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateAdCounterHistogramApiRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .histogram_updater
        .update(
            &UpdateAdCounterHistogramRequest {
                ad_selection_id: request.ad_selection_id,
                event_type: request.event_type,
                caller_package_name: request.caller_package_name,
            },
            Utc::now(),
        )
        .map(|_| StatusCode::OK)
        .map_err(|error| error_response(&error))
}
