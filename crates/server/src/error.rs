use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::error::StoreError;
use services::services::{
    environment::EnvironmentServiceError,
    feature_toggle::FeatureToggleError,
    import::{ImportError, ImportValidation},
    project::ProjectServiceError,
    segment::SegmentServiceError,
};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Environment(#[from] EnvironmentServiceError),
    #[error(transparent)]
    Project(#[from] ProjectServiceError),
    #[error(transparent)]
    FeatureToggle(#[from] FeatureToggleError),
    #[error(transparent)]
    Segment(#[from] SegmentServiceError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("{0}")]
    BadRequest(String),
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::ConstraintViolation(_) => StatusCode::CONFLICT,
        StoreError::Database(_) | StoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn feature_toggle_status(err: &FeatureToggleError) -> StatusCode {
    match err {
        FeatureToggleError::Store(e) => store_status(e),
        FeatureToggleError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
        FeatureToggleError::NameExists(_) => StatusCode::CONFLICT,
        FeatureToggleError::WrongProject { .. }
        | FeatureToggleError::EnvironmentNotLinked { .. }
        | FeatureToggleError::StrategyMismatch(_)
        | FeatureToggleError::InvalidVariantWeights(_)
        | FeatureToggleError::VariantWeightOutOfRange { .. } => StatusCode::BAD_REQUEST,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(e) => store_status(e),
            ApiError::Environment(e) => match e {
                EnvironmentServiceError::Store(e) => store_status(e),
                EnvironmentServiceError::NotFound(_) | EnvironmentServiceError::ProjectNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                EnvironmentServiceError::NameExists(_) | EnvironmentServiceError::AlreadyLinked { .. } => {
                    StatusCode::CONFLICT
                }
                EnvironmentServiceError::MinimumOneEnvironment
                | EnvironmentServiceError::Protected(_)
                | EnvironmentServiceError::InvalidDefaultStrategy => StatusCode::BAD_REQUEST,
            },
            ApiError::Project(e) => match e {
                ProjectServiceError::Store(e) => store_status(e),
                ProjectServiceError::NameExists(_) => StatusCode::CONFLICT,
                ProjectServiceError::UnknownEnvironment(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::FeatureToggle(e) => feature_toggle_status(e),
            ApiError::Segment(e) => match e {
                SegmentServiceError::Store(e) => store_status(e),
                SegmentServiceError::InUse { .. } => StatusCode::CONFLICT,
            },
            ApiError::Import(e) => match e {
                ImportError::Store(e) => store_status(e),
                ImportError::FeatureToggle(e) => feature_toggle_status(e),
                ImportError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
                ImportError::Invalid(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let message = self.to_string();
        let body = match self {
            ApiError::Import(ImportError::Invalid(validation)) => {
                ApiResponse::<(), ImportValidation>::error_with_data(&message, validation)
            }
            _ => ApiResponse::<(), ImportValidation>::error(&message),
        };
        (status, Json(body)).into_response()
    }
}
