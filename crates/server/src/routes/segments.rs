use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    feature_strategy::FeatureStrategy,
    segment::{CreateSegment, Segment},
};
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

pub async fn create_segment(
    State(state): State<AppState>,
    Json(payload): Json<CreateSegment>,
) -> Result<ResponseJson<ApiResponse<Segment>>, ApiError> {
    let segment = state.segments.create(&payload).await?;
    Ok(ResponseJson(ApiResponse::success(segment)))
}

pub async fn get_segment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<ResponseJson<ApiResponse<Segment>>, ApiError> {
    let segment = state.segments.get(id).await?;
    Ok(ResponseJson(ApiResponse::success(segment)))
}

pub async fn delete_segment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.segments.delete(id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn get_segment_strategies(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<ResponseJson<ApiResponse<Vec<FeatureStrategy>>>, ApiError> {
    let strategies = state.segments.strategies_using(id).await?;
    Ok(ResponseJson(ApiResponse::success(strategies)))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/segments",
        Router::new()
            .route("/", post(create_segment))
            .route("/{id}", get(get_segment).delete(delete_segment))
            .route("/{id}/strategies", get(get_segment_strategies)),
    )
}
