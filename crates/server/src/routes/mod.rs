use axum::Router;

use crate::AppState;

pub mod environments;
pub mod features;
pub mod import;
pub mod project_environments;
pub mod segments;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(environments::router())
        .merge(project_environments::router())
        .merge(features::router())
        .merge(import::router())
        .merge(segments::router())
}
