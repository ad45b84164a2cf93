//! Routes for bulk feature import.

use axum::{Json, Router, extract::State, response::Json as ResponseJson, routing::post};
use services::services::import::{ImportRequest, ImportSummary, ImportValidation};
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

pub async fn validate_import(
    State(state): State<AppState>,
    Json(payload): Json<ImportRequest>,
) -> Result<ResponseJson<ApiResponse<ImportValidation>>, ApiError> {
    let validation = state.import.validate(&payload).await?;
    Ok(ResponseJson(ApiResponse::success(validation)))
}

pub async fn import_features(
    State(state): State<AppState>,
    Json(payload): Json<ImportRequest>,
) -> Result<ResponseJson<ApiResponse<ImportSummary>>, ApiError> {
    let summary = state.import.import(&payload).await?;
    Ok(ResponseJson(ApiResponse::success(summary)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/features-batch/validate", post(validate_import))
        .route("/features-batch/import", post(import_features))
}
