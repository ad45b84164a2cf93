use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, types::Json};
use ts_rs::TS;
use utils::instrumentation::{Instrumentation, StoreTimer};

use super::feature_strategy::CreateFeatureStrategy;
use crate::{
    error::{StoreError, StoreResult},
    visibility::VisibilityPolicy,
};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub feature_limit: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct CreateProject {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub feature_limit: Option<i64>,
    /// Environments to link. When absent every enabled environment is linked.
    pub environments: Option<Vec<String>>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create(&self, project: &CreateProject) -> StoreResult<Project>;

    async fn get(&self, id: &str) -> StoreResult<Project>;

    async fn exists(&self, id: &str) -> StoreResult<bool>;

    async fn get_all_ids(&self) -> StoreResult<Vec<String>>;

    async fn get_environments_for_project(&self, id: &str) -> StoreResult<Vec<String>>;

    /// Map of environment name to the projects linked to it.
    async fn get_project_links_for_environments(
        &self,
        environments: &[String],
    ) -> StoreResult<BTreeMap<String, Vec<String>>>;

    async fn get_default_strategy(
        &self,
        project_id: &str,
        environment: &str,
    ) -> StoreResult<Option<CreateFeatureStrategy>>;

    async fn update_default_strategy(
        &self,
        project_id: &str,
        environment: &str,
        strategy: &CreateFeatureStrategy,
    ) -> StoreResult<CreateFeatureStrategy>;
}

#[derive(Debug, Clone)]
pub struct SqliteProjectStore {
    pool: SqlitePool,
    timer: StoreTimer,
    visibility: VisibilityPolicy,
}

impl SqliteProjectStore {
    pub fn new(pool: SqlitePool, instrumentation: &Instrumentation, visibility: VisibilityPolicy) -> Self {
        Self {
            pool,
            timer: instrumentation.for_store("project"),
            visibility,
        }
    }
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn create(&self, project: &CreateProject) -> StoreResult<Project> {
        let _timer = self.timer.time("create");
        sqlx::query_as::<_, Project>(
            r#"INSERT INTO projects (id, name, description, feature_limit)
               VALUES ($1, $2, $3, $4)
               RETURNING id, name, description, feature_limit, created_at"#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.feature_limit)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("project {} already exists", project.id)))
    }

    async fn get(&self, id: &str) -> StoreResult<Project> {
        sqlx::query_as::<_, Project>(
            "SELECT id, name, description, feature_limit, created_at FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("No project with id {id}")))
    }

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        let present: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM projects WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(present)
    }

    async fn get_all_ids(&self) -> StoreResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM projects ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn get_environments_for_project(&self, id: &str) -> StoreResult<Vec<String>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"SELECT pe.environment_name FROM project_environments pe
               INNER JOIN environments e ON e.name = pe.environment_name
               WHERE pe.project_id = "#,
        );
        query.push_bind(id.to_string());
        self.visibility.scope_environments(&mut query, "pe.environment_name");
        query.push(" ORDER BY e.sort_order ASC, e.name ASC");
        let names: Vec<String> = query.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(names)
    }

    async fn get_project_links_for_environments(
        &self,
        environments: &[String],
    ) -> StoreResult<BTreeMap<String, Vec<String>>> {
        if environments.is_empty() {
            return Ok(BTreeMap::new());
        }
        let _timer = self.timer.time("getProjectLinksForEnvironments");
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT environment_name, project_id FROM project_environments WHERE environment_name IN (",
        );
        let mut separated = query.separated(", ");
        for environment in environments {
            separated.push_bind(environment.clone());
        }
        query.push(") ORDER BY environment_name ASC, project_id ASC");
        let rows: Vec<(String, String)> = query.build_query_as().fetch_all(&self.pool).await?;

        let mut links: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (environment, project) in rows {
            links.entry(environment).or_default().push(project);
        }
        Ok(links)
    }

    async fn get_default_strategy(
        &self,
        project_id: &str,
        environment: &str,
    ) -> StoreResult<Option<CreateFeatureStrategy>> {
        let strategy: Option<Option<Json<CreateFeatureStrategy>>> = sqlx::query_scalar(
            "SELECT default_strategy FROM project_environments WHERE project_id = $1 AND environment_name = $2",
        )
        .bind(project_id)
        .bind(environment)
        .fetch_optional(&self.pool)
        .await?;
        Ok(strategy.flatten().map(|Json(strategy)| strategy))
    }

    async fn update_default_strategy(
        &self,
        project_id: &str,
        environment: &str,
        strategy: &CreateFeatureStrategy,
    ) -> StoreResult<CreateFeatureStrategy> {
        let result = sqlx::query(
            "UPDATE project_environments SET default_strategy = $1 WHERE project_id = $2 AND environment_name = $3",
        )
        .bind(Json(strategy))
        .bind(project_id)
        .bind(environment)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "Project {project_id} is not linked to environment {environment}"
            )));
        }
        Ok(strategy.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{link_project_environment, seed_environment, test_db};

    fn store(pool: &SqlitePool) -> SqliteProjectStore {
        SqliteProjectStore::new(pool.clone(), &Instrumentation::default(), VisibilityPolicy::Unrestricted)
    }

    fn project(id: &str) -> CreateProject {
        CreateProject {
            id: id.into(),
            name: id.to_uppercase(),
            description: None,
            feature_limit: Some(10),
            environments: None,
        }
    }

    #[tokio::test]
    async fn create_get_and_duplicate() {
        let db = test_db().await;
        let store = store(&db.pool);

        let created = store.create(&project("web")).await.unwrap();
        assert_eq!(store.get("web").await.unwrap(), created);
        assert_eq!(created.feature_limit, Some(10));

        let err = store.create(&project("web")).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert!(store.get("api").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn links_are_grouped_by_environment() {
        let db = test_db().await;
        let store = store(&db.pool);
        seed_environment(&db.pool, "default", 1).await;
        seed_environment(&db.pool, "staging", 2).await;
        store.create(&project("web")).await.unwrap();
        store.create(&project("api")).await.unwrap();
        link_project_environment(&db.pool, "web", "default").await;
        link_project_environment(&db.pool, "api", "default").await;
        link_project_environment(&db.pool, "web", "staging").await;

        let links = store
            .get_project_links_for_environments(&["default".into(), "staging".into()])
            .await
            .unwrap();
        assert_eq!(links["default"], vec!["api", "web"]);
        assert_eq!(links["staging"], vec!["web"]);
        assert_eq!(
            store.get_environments_for_project("web").await.unwrap(),
            vec!["default", "staging"]
        );
        assert_eq!(store.get_all_ids().await.unwrap(), vec!["api", "web"]);
    }

    #[tokio::test]
    async fn default_strategy_round_trips_through_link() {
        let db = test_db().await;
        let store = store(&db.pool);
        seed_environment(&db.pool, "default", 1).await;
        store.create(&project("web")).await.unwrap();

        let strategy = CreateFeatureStrategy::named("flexibleRollout");
        let err = store
            .update_default_strategy("web", "default", &strategy)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        link_project_environment(&db.pool, "web", "default").await;
        assert!(store.get_default_strategy("web", "default").await.unwrap().is_none());
        store
            .update_default_strategy("web", "default", &strategy)
            .await
            .unwrap();
        assert_eq!(
            store.get_default_strategy("web", "default").await.unwrap(),
            Some(strategy)
        );
    }
}
