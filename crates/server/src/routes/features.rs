//! Routes for feature toggles, their environments and strategies.

use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post, put},
};
use db::models::{
    feature::{CreateFeature, Feature},
    feature_strategy::{
        CreateFeatureStrategy, FeatureOverview, FeatureStrategy, FeatureStrategyUpdate,
        FeatureToggleWithEnvironments,
    },
    variant::Variant,
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Default, Deserialize)]
pub struct ArchivedQuery {
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct CreateFeatureRequest {
    #[serde(flatten)]
    pub feature: CreateFeature,
    /// Initial enabled state per project environment; missing ones start off.
    #[serde(default)]
    pub enabled_in: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SetVariants {
    pub environments: Vec<String>,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct EnabledChange {
    pub changed: bool,
}

pub async fn get_feature_overview(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ArchivedQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<FeatureOverview>>>, ApiError> {
    let overview = state
        .features
        .get_feature_overview(&project_id, query.archived)
        .await?;
    Ok(ResponseJson(ApiResponse::success(overview)))
}

pub async fn create_feature(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(payload): Json<CreateFeatureRequest>,
) -> Result<ResponseJson<ApiResponse<Feature>>, ApiError> {
    if payload.feature.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Feature name must not be empty".to_string()));
    }
    let feature = state
        .features
        .create_feature(&project_id, &payload.feature, &payload.enabled_in)
        .await?;
    Ok(ResponseJson(ApiResponse::success(feature)))
}

pub async fn get_feature(
    State(state): State<AppState>,
    Path((_project_id, feature_name)): Path<(String, String)>,
    Query(query): Query<ArchivedQuery>,
) -> Result<ResponseJson<ApiResponse<FeatureToggleWithEnvironments>>, ApiError> {
    let feature = state.features.get_feature(&feature_name, query.archived).await?;
    Ok(ResponseJson(ApiResponse::success(feature)))
}

pub async fn archive_feature(
    State(state): State<AppState>,
    Path((project_id, feature_name)): Path<(String, String)>,
) -> Result<ResponseJson<ApiResponse<Feature>>, ApiError> {
    let feature = state.features.archive_feature(&project_id, &feature_name).await?;
    Ok(ResponseJson(ApiResponse::success(feature)))
}

pub async fn set_variants(
    State(state): State<AppState>,
    Path((project_id, feature_name)): Path<(String, String)>,
    Json(payload): Json<SetVariants>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state
        .features
        .set_variants(&project_id, &feature_name, &payload.environments, &payload.variants)
        .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn enable_feature_environment(
    State(state): State<AppState>,
    Path((project_id, feature_name, environment)): Path<(String, String, String)>,
) -> Result<ResponseJson<ApiResponse<EnabledChange>>, ApiError> {
    let changed = state
        .features
        .update_enabled(&project_id, &feature_name, &environment, true)
        .await?;
    Ok(ResponseJson(ApiResponse::success(EnabledChange { changed })))
}

pub async fn disable_feature_environment(
    State(state): State<AppState>,
    Path((project_id, feature_name, environment)): Path<(String, String, String)>,
) -> Result<ResponseJson<ApiResponse<EnabledChange>>, ApiError> {
    let changed = state
        .features
        .update_enabled(&project_id, &feature_name, &environment, false)
        .await?;
    Ok(ResponseJson(ApiResponse::success(EnabledChange { changed })))
}

pub async fn get_strategies(
    State(state): State<AppState>,
    Path((project_id, feature_name, environment)): Path<(String, String, String)>,
) -> Result<ResponseJson<ApiResponse<Vec<FeatureStrategy>>>, ApiError> {
    let strategies = state
        .features
        .get_strategies(&project_id, &feature_name, &environment)
        .await?;
    Ok(ResponseJson(ApiResponse::success(strategies)))
}

pub async fn create_strategy(
    State(state): State<AppState>,
    Path((project_id, feature_name, environment)): Path<(String, String, String)>,
    Json(payload): Json<CreateFeatureStrategy>,
) -> Result<ResponseJson<ApiResponse<FeatureStrategy>>, ApiError> {
    let strategy = state
        .features
        .create_strategy(&project_id, &feature_name, &environment, &payload)
        .await?;
    Ok(ResponseJson(ApiResponse::success(strategy)))
}

pub async fn update_strategy(
    State(state): State<AppState>,
    Path((project_id, feature_name, environment, strategy_id)): Path<(String, String, String, Uuid)>,
    Json(payload): Json<FeatureStrategyUpdate>,
) -> Result<ResponseJson<ApiResponse<FeatureStrategy>>, ApiError> {
    let strategy = state
        .features
        .update_strategy(&project_id, &feature_name, &environment, strategy_id, &payload)
        .await?;
    Ok(ResponseJson(ApiResponse::success(strategy)))
}

pub async fn delete_strategy(
    State(state): State<AppState>,
    Path((project_id, feature_name, environment, strategy_id)): Path<(String, String, String, Uuid)>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state
        .features
        .delete_strategy(&project_id, &feature_name, &environment, strategy_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/projects/{project_id}/features",
        Router::new()
            .route("/", get(get_feature_overview).post(create_feature))
            .route("/{feature}", get(get_feature).delete(archive_feature))
            .route("/{feature}/variants", put(set_variants))
            .route("/{feature}/environments/{environment}/on", post(enable_feature_environment))
            .route("/{feature}/environments/{environment}/off", post(disable_feature_environment))
            .route(
                "/{feature}/environments/{environment}/strategies",
                get(get_strategies).post(create_strategy),
            )
            .route(
                "/{feature}/environments/{environment}/strategies/{strategy_id}",
                put(update_strategy).delete(delete_strategy),
            ),
    )
}
