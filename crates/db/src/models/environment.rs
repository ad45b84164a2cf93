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

pub const DEFAULT_SORT_ORDER: i32 = 9999;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub environment_type: String,
    pub sort_order: i32,
    pub enabled: bool,
    pub protected: bool,
    pub required_approvals: Option<i32>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentWithCounts {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub environment: Environment,
    pub project_count: i64,
    pub api_token_count: i64,
    pub enabled_toggle_count: i64,
}

/// Environment as seen from one project.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEnvironment {
    #[serde(flatten)]
    pub environment: Environment,
    /// Whether the project has opted into this environment.
    pub linked: bool,
    pub project_api_token_count: i64,
    pub project_enabled_toggle_count: i64,
    pub default_strategy: Option<CreateFeatureStrategy>,
}

#[derive(FromRow)]
struct ProjectEnvironmentRow {
    #[sqlx(flatten)]
    environment: Environment,
    linked: bool,
    project_api_token_count: i64,
    project_enabled_toggle_count: i64,
    default_strategy: Option<Json<CreateFeatureStrategy>>,
}

impl From<ProjectEnvironmentRow> for ProjectEnvironment {
    fn from(row: ProjectEnvironmentRow) -> Self {
        Self {
            environment: row.environment,
            linked: row.linked,
            project_api_token_count: row.project_api_token_count,
            project_enabled_toggle_count: row.project_enabled_toggle_count,
            default_strategy: row.default_strategy.map(|Json(strategy)| strategy),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironment {
    pub name: String,
    #[serde(rename = "type")]
    pub environment_type: String,
    pub sort_order: Option<i32>,
    pub enabled: Option<bool>,
    pub protected: Option<bool>,
    pub required_approvals: Option<i32>,
}

impl CreateEnvironment {
    pub fn new(name: impl Into<String>, environment_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment_type: environment_type.into(),
            sort_order: None,
            enabled: None,
            protected: None,
            required_approvals: None,
        }
    }
}

/// Partial update. Only these three columns can be changed through `update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvironment {
    #[serde(rename = "type")]
    pub environment_type: Option<String>,
    pub protected: Option<bool>,
    pub required_approvals: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentFilter {
    pub enabled: Option<bool>,
    pub environment_type: Option<String>,
    pub protected: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequestEnvironment {
    pub name: String,
    pub required_approvals: i32,
}

#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    async fn create(&self, env: &CreateEnvironment) -> StoreResult<Environment>;

    /// Insert many environments, silently skipping names that already exist.
    /// Returns only the rows that were inserted.
    async fn import_environments(&self, envs: &[Environment]) -> StoreResult<Vec<Environment>>;

    async fn get(&self, name: &str) -> StoreResult<Environment>;

    async fn exists(&self, name: &str) -> StoreResult<bool>;

    async fn count(&self) -> StoreResult<i64>;

    async fn max_sort_order(&self) -> StoreResult<i32>;

    async fn get_all(&self, filter: &EnvironmentFilter) -> StoreResult<Vec<Environment>>;

    async fn get_all_with_counts(
        &self,
        filter: &EnvironmentFilter,
    ) -> StoreResult<Vec<EnvironmentWithCounts>>;

    async fn get_project_environments(&self, project_id: &str) -> StoreResult<Vec<ProjectEnvironment>>;

    /// Returns `None` without touching the row when it is protected or missing.
    async fn update(&self, patch: &UpdateEnvironment, name: &str) -> StoreResult<Option<Environment>>;

    async fn update_sort_order(&self, name: &str, sort_order: i32) -> StoreResult<()>;

    async fn toggle(&self, name: &str, enabled: bool) -> StoreResult<()>;

    async fn enable(&self, names: &[String]) -> StoreResult<()>;

    async fn disable(&self, names: &[String]) -> StoreResult<()>;

    /// No-op for protected environments.
    async fn delete(&self, name: &str) -> StoreResult<()>;

    async fn get_change_request_environments(
        &self,
        names: &[String],
    ) -> StoreResult<Vec<ChangeRequestEnvironment>>;
}

const ENVIRONMENT_COLUMNS: &str = "e.name AS name, e.type AS type, e.sort_order AS sort_order, \
     e.enabled AS enabled, e.protected AS protected, e.required_approvals AS required_approvals";

const ENVIRONMENT_ORDER: &str = " ORDER BY e.sort_order ASC, e.created_at ASC, e.name ASC";

#[derive(Debug, Clone)]
pub struct SqliteEnvironmentStore {
    pool: SqlitePool,
    timer: StoreTimer,
    visibility: VisibilityPolicy,
}

impl SqliteEnvironmentStore {
    pub fn new(pool: SqlitePool, instrumentation: &Instrumentation, visibility: VisibilityPolicy) -> Self {
        Self {
            pool,
            timer: instrumentation.for_store("environment"),
            visibility,
        }
    }

    fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &EnvironmentFilter) {
        if let Some(enabled) = filter.enabled {
            query.push(" AND e.enabled = ").push_bind(enabled);
        }
        if let Some(environment_type) = &filter.environment_type {
            query.push(" AND e.type = ").push_bind(environment_type.clone());
        }
        if let Some(protected) = filter.protected {
            query.push(" AND e.protected = ").push_bind(protected);
        }
    }

    async fn set_enabled(&self, names: &[String], enabled: bool) -> StoreResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE environments SET enabled = ");
        query.push_bind(enabled).push(" WHERE name IN (");
        let mut separated = query.separated(", ");
        for name in names {
            separated.push_bind(name.clone());
        }
        query.push(")");
        query.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EnvironmentStore for SqliteEnvironmentStore {
    async fn create(&self, env: &CreateEnvironment) -> StoreResult<Environment> {
        let _timer = self.timer.time("create");
        sqlx::query_as::<_, Environment>(
            r#"INSERT INTO environments (name, type, sort_order, enabled, protected, required_approvals)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING name, type, sort_order, enabled, protected, required_approvals"#,
        )
        .bind(&env.name)
        .bind(&env.environment_type)
        .bind(env.sort_order.unwrap_or(DEFAULT_SORT_ORDER))
        .bind(env.enabled.unwrap_or(true))
        .bind(env.protected.unwrap_or(false))
        .bind(env.required_approvals)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("environment {} already exists", env.name)))
    }

    async fn import_environments(&self, envs: &[Environment]) -> StoreResult<Vec<Environment>> {
        if envs.is_empty() {
            return Ok(Vec::new());
        }
        let _timer = self.timer.time("importEnvironments");
        let mut query = QueryBuilder::<Sqlite>::new(
            "INSERT INTO environments (name, type, sort_order, enabled, protected, required_approvals) ",
        );
        query.push_values(envs, |mut row, env| {
            row.push_bind(env.name.clone())
                .push_bind(env.environment_type.clone())
                .push_bind(env.sort_order)
                .push_bind(env.enabled)
                .push_bind(env.protected)
                .push_bind(env.required_approvals);
        });
        query.push(
            " ON CONFLICT(name) DO NOTHING \
             RETURNING name, type, sort_order, enabled, protected, required_approvals",
        );
        let rows = query.build_query_as::<Environment>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn get(&self, name: &str) -> StoreResult<Environment> {
        let _timer = self.timer.time("get");
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments e WHERE e.name = "
        ));
        query.push_bind(name.to_string());
        self.visibility.scope_environments(&mut query, "e.name");
        query
            .build_query_as::<Environment>()
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Could not find environment with name: {name}")))
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        let _timer = self.timer.time("exists");
        let present: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM environments WHERE name = $1)")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(present)
    }

    async fn count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM environments")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn max_sort_order(&self) -> StoreResult<i32> {
        let max: Option<i32> = sqlx::query_scalar("SELECT MAX(sort_order) FROM environments")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0))
    }

    async fn get_all(&self, filter: &EnvironmentFilter) -> StoreResult<Vec<Environment>> {
        let _timer = self.timer.time("getAll");
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments e WHERE 1 = 1"
        ));
        Self::push_filter(&mut query, filter);
        self.visibility.scope_environments(&mut query, "e.name");
        query.push(ENVIRONMENT_ORDER);
        let rows = query.build_query_as::<Environment>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn get_all_with_counts(
        &self,
        filter: &EnvironmentFilter,
    ) -> StoreResult<Vec<EnvironmentWithCounts>> {
        let _timer = self.timer.time("getAllWithCounts");
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            r#"SELECT {ENVIRONMENT_COLUMNS},
                 (SELECT COUNT(*) FROM project_environments pe
                   WHERE pe.environment_name = e.name) AS project_count,
                 (SELECT COUNT(*) FROM api_tokens t
                   WHERE t.environment = e.name) AS api_token_count,
                 (SELECT COUNT(*) FROM feature_environments fe
                   WHERE fe.enabled = 1 AND fe.environment = e.name) AS enabled_toggle_count
               FROM environments e
               WHERE 1 = 1"#
        ));
        Self::push_filter(&mut query, filter);
        self.visibility.scope_environments(&mut query, "e.name");
        query.push(ENVIRONMENT_ORDER);
        let rows = query
            .build_query_as::<EnvironmentWithCounts>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn get_project_environments(&self, project_id: &str) -> StoreResult<Vec<ProjectEnvironment>> {
        let _timer = self.timer.time("getProjectEnvironments");
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {ENVIRONMENT_COLUMNS},"));
        query
            .push(
                r#"
                 EXISTS (SELECT 1 FROM project_environments pe
                          WHERE pe.environment_name = e.name AND pe.project_id = "#,
            )
            .push_bind(project_id.to_string())
            .push(
                r#") AS linked,
                 (SELECT COUNT(*) FROM api_tokens t
                    LEFT JOIN api_token_project atp ON t.secret = atp.secret
                   WHERE t.environment = e.name AND (atp.project = "#,
            )
            .push_bind(project_id.to_string())
            .push(
                r#" OR atp.project IS NULL)) AS project_api_token_count,
                 (SELECT COUNT(*) FROM feature_environments fe
                    INNER JOIN features f ON fe.feature_name = f.name
                   WHERE fe.enabled = 1 AND fe.environment = e.name AND f.project = "#,
            )
            .push_bind(project_id.to_string())
            .push(
                r#") AS project_enabled_toggle_count,
                 (SELECT pe.default_strategy FROM project_environments pe
                   WHERE pe.environment_name = e.name AND pe.project_id = "#,
            )
            .push_bind(project_id.to_string())
            .push(") AS default_strategy FROM environments e WHERE 1 = 1");
        self.visibility.scope_environments(&mut query, "e.name");
        query.push(ENVIRONMENT_ORDER);

        let rows = query
            .build_query_as::<ProjectEnvironmentRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ProjectEnvironment::from).collect())
    }

    async fn update(&self, patch: &UpdateEnvironment, name: &str) -> StoreResult<Option<Environment>> {
        let _timer = self.timer.time("update");
        let updated = sqlx::query_as::<_, Environment>(
            r#"UPDATE environments
               SET type = COALESCE($1, type),
                   protected = COALESCE($2, protected),
                   required_approvals = COALESCE($3, required_approvals)
               WHERE name = $4 AND protected = 0
               RETURNING name, type, sort_order, enabled, protected, required_approvals"#,
        )
        .bind(&patch.environment_type)
        .bind(patch.protected)
        .bind(patch.required_approvals)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            tracing::debug!(environment = %name, "Environment update skipped: protected or missing");
        }
        Ok(updated)
    }

    async fn update_sort_order(&self, name: &str, sort_order: i32) -> StoreResult<()> {
        sqlx::query("UPDATE environments SET sort_order = $1 WHERE name = $2")
            .bind(sort_order)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn toggle(&self, name: &str, enabled: bool) -> StoreResult<()> {
        sqlx::query("UPDATE environments SET enabled = $1 WHERE name = $2")
            .bind(enabled)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enable(&self, names: &[String]) -> StoreResult<()> {
        self.set_enabled(names, true).await
    }

    async fn disable(&self, names: &[String]) -> StoreResult<()> {
        self.set_enabled(names, false).await
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM environments WHERE name = $1 AND protected = 0")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_change_request_environments(
        &self,
        names: &[String],
    ) -> StoreResult<Vec<ChangeRequestEnvironment>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let _timer = self.timer.time("getChangeRequestEnvironments");
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT name, required_approvals FROM environments WHERE name IN (",
        );
        let mut separated = query.separated(", ");
        for name in names {
            separated.push_bind(name.clone());
        }
        query.push(") AND required_approvals > 0 ORDER BY sort_order ASC, name ASC");

        let rows: Vec<(String, Option<i32>)> = query.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(name, required_approvals)| ChangeRequestEnvironment {
                name,
                required_approvals: required_approvals.unwrap_or(1),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_feature, seed_project, test_db};

    fn store(pool: &SqlitePool, visibility: VisibilityPolicy) -> SqliteEnvironmentStore {
        SqliteEnvironmentStore::new(pool.clone(), &Instrumentation::default(), visibility)
    }

    fn env(name: &str, sort_order: i32) -> CreateEnvironment {
        CreateEnvironment {
            sort_order: Some(sort_order),
            ..CreateEnvironment::new(name, "development")
        }
    }

    #[tokio::test]
    async fn create_then_get() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);

        let created = store.create(&env("staging", 3)).await.unwrap();
        assert_eq!(created.name, "staging");
        assert!(created.enabled);
        assert!(!created.protected);

        let fetched = store.get("staging").await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn duplicate_create_is_constraint_violation() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);

        store.create(&env("staging", 3)).await.unwrap();
        let err = store.create(&env("staging", 4)).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);

        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn get_all_orders_by_sort_order_then_creation() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);

        store.create(&env("a", 2)).await.unwrap();
        store.create(&env("c", 2)).await.unwrap();
        store.create(&env("b", 1)).await.unwrap();

        let names: Vec<String> = store
            .get_all(&EnvironmentFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn oss_policy_hides_other_environments() {
        let db = test_db().await;
        let unrestricted = store(&db.pool, VisibilityPolicy::Unrestricted);
        unrestricted.create(&env("development", 1)).await.unwrap();
        unrestricted.create(&env("staging", 2)).await.unwrap();

        let oss = store(&db.pool, VisibilityPolicy::Oss);
        let names: Vec<String> = oss
            .get_all(&EnvironmentFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["development"]);
        assert!(oss.get("staging").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn filter_by_enabled() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        store.create(&env("on", 1)).await.unwrap();
        store
            .create(&CreateEnvironment {
                enabled: Some(false),
                ..env("off", 2)
            })
            .await
            .unwrap();

        let enabled = store
            .get_all(&EnvironmentFilter {
                enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "on");
    }

    #[tokio::test]
    async fn counts_are_derived_per_environment() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        store.create(&env("production", 1)).await.unwrap();
        store.create(&env("staging", 2)).await.unwrap();
        seed_project(&db.pool, "web").await;
        seed_feature(&db.pool, "checkout", "web").await;

        sqlx::query("INSERT INTO project_environments (project_id, environment_name) VALUES ('web', 'production')")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO feature_environments (feature_name, environment, enabled) VALUES ('checkout', 'production', 1)")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO api_tokens (secret, token_name, type, environment) VALUES ('s1', 'client', 'client', 'production')")
            .execute(&db.pool)
            .await
            .unwrap();

        let all = store.get_all_with_counts(&EnvironmentFilter::default()).await.unwrap();
        let production = all.iter().find(|e| e.environment.name == "production").unwrap();
        assert_eq!(production.project_count, 1);
        assert_eq!(production.api_token_count, 1);
        assert_eq!(production.enabled_toggle_count, 1);

        let staging = all.iter().find(|e| e.environment.name == "staging").unwrap();
        assert_eq!(staging.project_count, 0);
        assert_eq!(staging.enabled_toggle_count, 0);
    }

    #[tokio::test]
    async fn project_environments_report_link_and_counts() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        store.create(&env("production", 1)).await.unwrap();
        store.create(&env("staging", 2)).await.unwrap();
        seed_project(&db.pool, "web").await;
        seed_feature(&db.pool, "checkout", "web").await;
        sqlx::query(
            r#"INSERT INTO project_environments (project_id, environment_name, default_strategy)
               VALUES ('web', 'production', '{"name":"flexibleRollout","parameters":{"rollout":"50"}}')"#,
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO feature_environments (feature_name, environment, enabled) VALUES ('checkout', 'production', 1)")
            .execute(&db.pool)
            .await
            .unwrap();

        let envs = store.get_project_environments("web").await.unwrap();
        assert_eq!(envs.len(), 2);
        let production = &envs[0];
        assert!(production.linked);
        assert_eq!(production.project_enabled_toggle_count, 1);
        let strategy = production.default_strategy.as_ref().unwrap();
        assert_eq!(strategy.name, "flexibleRollout");
        assert_eq!(strategy.parameters.get("rollout").map(String::as_str), Some("50"));

        assert!(!envs[1].linked);
        assert!(envs[1].default_strategy.is_none());
    }

    #[tokio::test]
    async fn update_protected_environment_is_a_no_op() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        let before = store
            .create(&CreateEnvironment {
                protected: Some(true),
                ..env("production", 1)
            })
            .await
            .unwrap();

        let result = store
            .update(
                &UpdateEnvironment {
                    environment_type: Some("test".into()),
                    protected: Some(false),
                    required_approvals: Some(3),
                },
                "production",
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(store.get("production").await.unwrap(), before);
    }

    #[tokio::test]
    async fn update_applies_only_given_fields() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        store.create(&env("staging", 5)).await.unwrap();

        let updated = store
            .update(
                &UpdateEnvironment {
                    required_approvals: Some(2),
                    ..Default::default()
                },
                "staging",
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.required_approvals, Some(2));
        assert_eq!(updated.environment_type, "development");
        assert_eq!(updated.sort_order, 5);
    }

    #[tokio::test]
    async fn delete_skips_protected() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        store
            .create(&CreateEnvironment {
                protected: Some(true),
                ..env("production", 1)
            })
            .await
            .unwrap();
        store.create(&env("staging", 2)).await.unwrap();

        store.delete("production").await.unwrap();
        store.delete("staging").await.unwrap();

        assert!(store.exists("production").await.unwrap());
        assert!(!store.exists("staging").await.unwrap());
    }

    #[tokio::test]
    async fn enable_and_disable_in_bulk() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        store.create(&env("a", 1)).await.unwrap();
        store.create(&env("b", 2)).await.unwrap();

        store.disable(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert!(!store.get("a").await.unwrap().enabled);
        assert!(!store.get("b").await.unwrap().enabled);

        store.enable(&["b".to_string()]).await.unwrap();
        assert!(!store.get("a").await.unwrap().enabled);
        assert!(store.get("b").await.unwrap().enabled);

        store.toggle("a", true).await.unwrap();
        assert!(store.get("a").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn import_ignores_existing_names() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        store.create(&env("production", 1)).await.unwrap();

        let incoming = vec![
            Environment {
                name: "production".into(),
                environment_type: "production".into(),
                sort_order: 9,
                enabled: false,
                protected: false,
                required_approvals: None,
            },
            Environment {
                name: "qa".into(),
                environment_type: "test".into(),
                sort_order: 4,
                enabled: true,
                protected: false,
                required_approvals: None,
            },
        ];
        let inserted = store.import_environments(&incoming).await.unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].name, "qa");

        // running it again inserts nothing
        assert!(store.import_environments(&incoming).await.unwrap().is_empty());
        assert_eq!(store.get("production").await.unwrap().sort_order, 1);
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.max_sort_order().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn change_request_environments_need_approvals() {
        let db = test_db().await;
        let store = store(&db.pool, VisibilityPolicy::Unrestricted);
        store
            .create(&CreateEnvironment {
                required_approvals: Some(2),
                ..env("prod", 1)
            })
            .await
            .unwrap();
        store
            .create(&CreateEnvironment {
                required_approvals: Some(0),
                ..env("dev", 2)
            })
            .await
            .unwrap();

        let envs = store
            .get_change_request_environments(&["prod".to_string(), "dev".to_string()])
            .await
            .unwrap();
        assert_eq!(
            envs,
            vec![ChangeRequestEnvironment {
                name: "prod".into(),
                required_approvals: 2
            }]
        );
    }
}
