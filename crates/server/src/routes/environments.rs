//! Routes for the global environment list.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post, put},
};
use db::models::environment::{CreateEnvironment, Environment, EnvironmentWithCounts, UpdateEnvironment};
use serde::{Deserialize, Serialize};
use services::services::environment::CloneEnvironment;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct EnabledEnvironments {
    pub environments: Vec<String>,
}

pub async fn get_environments(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<EnvironmentWithCounts>>>, ApiError> {
    let environments = state.environments.get_all().await?;
    Ok(ResponseJson(ApiResponse::success(environments)))
}

pub async fn create_environment(
    State(state): State<AppState>,
    Json(payload): Json<CreateEnvironment>,
) -> Result<ResponseJson<ApiResponse<Environment>>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Environment name must not be empty".to_string()));
    }
    let environment = state.environments.create(&payload).await?;
    Ok(ResponseJson(ApiResponse::success(environment)))
}

pub async fn get_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ResponseJson<ApiResponse<Environment>>, ApiError> {
    let environment = state.environments.get(&name).await?;
    Ok(ResponseJson(ApiResponse::success(environment)))
}

pub async fn update_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<UpdateEnvironment>,
) -> Result<ResponseJson<ApiResponse<Environment>>, ApiError> {
    let environment = state.environments.update(&name, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(environment)))
}

pub async fn delete_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.environments.delete(&name).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn update_sort_order(
    State(state): State<AppState>,
    Json(payload): Json<BTreeMap<String, i32>>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.environments.update_sort_order(&payload).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn enable_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.environments.toggle_environment(&name, true).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn disable_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.environments.toggle_environment(&name, false).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn clone_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<CloneEnvironment>,
) -> Result<ResponseJson<ApiResponse<Environment>>, ApiError> {
    let environment = state.environments.clone_environment(&name, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(environment)))
}

/// Enable exactly the given environments and move project links over.
pub async fn override_enabled(
    State(state): State<AppState>,
    Json(payload): Json<EnabledEnvironments>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state
        .environments
        .override_enabled_projects(&payload.environments)
        .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/environments",
        Router::new()
            .route("/", get(get_environments).post(create_environment))
            .route("/sort-order", put(update_sort_order))
            .route("/enabled-override", post(override_enabled))
            .route(
                "/{name}",
                get(get_environment)
                    .put(update_environment)
                    .delete(delete_environment),
            )
            .route("/{name}/on", post(enable_environment))
            .route("/{name}/off", post(disable_environment))
            .route("/{name}/clone", post(clone_environment)),
    )
}
