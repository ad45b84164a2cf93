//! Routes linking projects to environments.

use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{delete, get, post},
};
use db::models::{
    environment::ProjectEnvironment,
    feature_strategy::CreateFeatureStrategy,
    project::{CreateProject, Project},
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AddEnvironmentToProject {
    pub environment: String,
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(payload): Json<CreateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let project = state.projects.create_project(&payload).await?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let project = state.projects.get(&project_id).await?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

pub async fn get_project_environments(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<Vec<ProjectEnvironment>>>, ApiError> {
    let environments = state.environments.get_project_environments(&project_id).await?;
    Ok(ResponseJson(ApiResponse::success(environments)))
}

pub async fn add_environment_to_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(payload): Json<AddEnvironmentToProject>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state
        .environments
        .add_environment_to_project(&payload.environment, &project_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn remove_environment_from_project(
    State(state): State<AppState>,
    Path((project_id, environment)): Path<(String, String)>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state
        .environments
        .remove_environment_from_project(&environment, &project_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn update_default_strategy(
    State(state): State<AppState>,
    Path((project_id, environment)): Path<(String, String)>,
    Json(payload): Json<CreateFeatureStrategy>,
) -> Result<ResponseJson<ApiResponse<CreateFeatureStrategy>>, ApiError> {
    let strategy = state
        .environments
        .update_default_strategy(&environment, &project_id, &payload)
        .await?;
    Ok(ResponseJson(ApiResponse::success(strategy)))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/projects", post(create_project)).nest(
        "/projects/{project_id}",
        Router::new()
            .route("/", get(get_project))
            .route(
                "/environments",
                get(get_project_environments).post(add_environment_to_project),
            )
            .route(
                "/environments/{environment}",
                delete(remove_environment_from_project),
            )
            .route(
                "/environments/{environment}/default-strategy",
                post(update_default_strategy),
            ),
    )
}
