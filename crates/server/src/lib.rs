use axum::Router;
use db::Stores;
use services::services::{
    environment::EnvironmentService, feature_toggle::FeatureToggleService, import::ImportService,
    project::ProjectService, segment::SegmentService,
};
use tower_http::trace::TraceLayer;

pub mod error;
pub mod routes;

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub environments: EnvironmentService,
    pub projects: ProjectService,
    pub features: FeatureToggleService,
    pub segments: SegmentService,
    pub import: ImportService,
}

impl AppState {
    pub fn new(stores: Stores) -> Self {
        Self {
            environments: EnvironmentService::new(stores.clone()),
            projects: ProjectService::new(stores.clone()),
            features: FeatureToggleService::new(stores.clone()),
            segments: SegmentService::new(stores.clone()),
            import: ImportService::new(stores),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/admin", routes::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use db::visibility::VisibilityPolicy;
    use serde_json::{Value, json};

    use super::*;

    fn server() -> TestServer {
        let state = AppState::new(Stores::in_memory(VisibilityPolicy::Unrestricted));
        TestServer::new(router(state)).unwrap()
    }

    async fn seed(server: &TestServer) {
        for name in ["default", "production"] {
            server
                .post("/api/admin/environments")
                .json(&json!({ "name": name, "type": "production" }))
                .await
                .assert_status_ok();
        }
        server
            .post("/api/admin/projects")
            .json(&json!({ "id": "web", "name": "Web", "environments": ["default"] }))
            .await
            .assert_status_ok();
        server
            .post("/api/admin/projects/web/features")
            .json(&json!({ "name": "checkout" }))
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn environment_crud_round_trip() {
        let server = server();
        seed(&server).await;

        let body: Value = server.get("/api/admin/environments").await.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"][0]["projectCount"], 1);

        server
            .post("/api/admin/environments/production/off")
            .await
            .assert_status_ok();
        let body: Value = server.get("/api/admin/environments/production").await.json();
        assert_eq!(body["data"]["enabled"], false);

        server
            .get("/api/admin/environments/ghost")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_environment_conflicts() {
        let server = server();
        seed(&server).await;
        let response = server
            .post("/api/admin/environments")
            .json(&json!({ "name": "default", "type": "production" }))
            .await;
        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Environment default already exists");
    }

    #[tokio::test]
    async fn project_environment_links() {
        let server = server();
        seed(&server).await;

        server
            .post("/api/admin/projects/web/environments")
            .json(&json!({ "environment": "production" }))
            .await
            .assert_status_ok();
        server
            .post("/api/admin/projects/web/environments")
            .json(&json!({ "environment": "production" }))
            .await
            .assert_status(StatusCode::CONFLICT);

        let body: Value = server.get("/api/admin/projects/web/features/checkout").await.json();
        assert_eq!(body["data"]["environments"].as_array().unwrap().len(), 2);

        server
            .delete("/api/admin/projects/web/environments/production")
            .await
            .assert_status_ok();
        server
            .delete("/api/admin/projects/web/environments/default")
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn enabling_feature_creates_default_strategy() {
        let server = server();
        seed(&server).await;

        let body: Value = server
            .post("/api/admin/projects/web/features/checkout/environments/default/on")
            .await
            .json();
        assert_eq!(body["data"]["changed"], true);

        let body: Value = server
            .get("/api/admin/projects/web/features/checkout/environments/default/strategies")
            .await
            .json();
        let strategies = body["data"].as_array().unwrap();
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0]["strategyName"], "flexibleRollout");

        let id = strategies[0]["id"].as_str().unwrap();
        server
            .delete(&format!(
                "/api/admin/projects/web/features/checkout/environments/default/strategies/{id}"
            ))
            .await
            .assert_status_ok();
        let body: Value = server.get("/api/admin/projects/web/features/checkout").await.json();
        assert_eq!(body["data"]["environments"][0]["enabled"], false);
    }

    #[tokio::test]
    async fn invalid_import_returns_validation() {
        let server = server();
        seed(&server).await;

        let response = server
            .post("/api/admin/features-batch/import")
            .json(&json!({
                "project": "web",
                "environment": "default",
                "data": { "features": [{ "name": "a" }, { "name": "a" }] }
            }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error_data"]["errors"][0]["affectedItems"], json!(["a"]));
    }

    #[tokio::test]
    async fn unknown_project_import_is_not_found() {
        let server = server();
        server
            .post("/api/admin/features-batch/validate")
            .json(&json!({ "project": "ghost", "environment": "default", "data": { "features": [] } }))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
