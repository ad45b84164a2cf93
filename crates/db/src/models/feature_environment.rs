use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, types::Json};
use ts_rs::TS;
use utils::instrumentation::{Instrumentation, StoreTimer};
use uuid::Uuid;

use super::{
    feature_strategy::{FeatureStrategy, FeatureStrategyRow, STRATEGY_COLUMNS},
    variant::{Variant, sort_variants},
};
use crate::{
    error::{StoreError, StoreResult},
    visibility::VisibilityPolicy,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEnvironmentKey {
    pub feature_name: String,
    pub environment: String,
}

impl FeatureEnvironmentKey {
    pub fn new(feature_name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            feature_name: feature_name.into(),
            environment: environment.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEnvironment {
    pub feature_name: String,
    pub environment: String,
    pub enabled: bool,
    #[serde(default)]
    pub variants: Vec<Variant>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl FeatureEnvironment {
    pub fn new(feature_name: impl Into<String>, environment: impl Into<String>, enabled: bool) -> Self {
        Self {
            feature_name: feature_name.into(),
            environment: environment.into(),
            enabled,
            variants: Vec::new(),
            last_seen_at: None,
        }
    }

    pub fn key(&self) -> FeatureEnvironmentKey {
        FeatureEnvironmentKey::new(&self.feature_name, &self.environment)
    }
}

#[derive(FromRow)]
struct FeatureEnvironmentRow {
    feature_name: String,
    environment: String,
    enabled: bool,
    variants: Json<Vec<Variant>>,
    last_seen_at: Option<DateTime<Utc>>,
}

impl From<FeatureEnvironmentRow> for FeatureEnvironment {
    fn from(row: FeatureEnvironmentRow) -> Self {
        Self {
            feature_name: row.feature_name,
            environment: row.environment,
            enabled: row.enabled,
            variants: row.variants.0,
            last_seen_at: row.last_seen_at,
        }
    }
}

const FEATURE_ENVIRONMENT_COLUMNS: &str = "feature_name, environment, enabled, variants, last_seen_at";

#[async_trait]
pub trait FeatureEnvironmentStore: Send + Sync {
    async fn get(&self, key: &FeatureEnvironmentKey) -> StoreResult<FeatureEnvironment>;

    async fn get_environment_meta_data(&self, environment: &str, feature_name: &str) -> StoreResult<FeatureEnvironment>;

    async fn exists(&self, key: &FeatureEnvironmentKey) -> StoreResult<bool>;

    async fn feature_has_environment(&self, environment: &str, feature_name: &str) -> StoreResult<bool>;

    /// `false` when the pair does not exist.
    async fn is_environment_enabled(&self, feature_name: &str, environment: &str) -> StoreResult<bool>;

    async fn get_all(&self, feature_name: Option<&str>) -> StoreResult<Vec<FeatureEnvironment>>;

    async fn get_all_by_features(
        &self,
        features: &[String],
        environment: Option<&str>,
    ) -> StoreResult<Vec<FeatureEnvironment>>;

    async fn get_environments_for_feature(&self, feature_name: &str) -> StoreResult<Vec<FeatureEnvironment>>;

    async fn delete(&self, key: &FeatureEnvironmentKey) -> StoreResult<()>;

    async fn remove_environment_for_feature(&self, feature_name: &str, environment: &str) -> StoreResult<()>;

    /// Upsert that merges only `enabled` on conflict.
    async fn add_environment_to_feature(&self, feature_name: &str, environment: &str, enabled: bool) -> StoreResult<()>;

    /// Upsert that merges `enabled` and `variants` on conflict.
    async fn add_feature_environment(&self, feature_environment: &FeatureEnvironment) -> StoreResult<()>;

    /// Link a project to an environment. With `idempotent` an existing link is
    /// left alone, otherwise it is reported as a constraint violation.
    async fn connect_project(&self, environment: &str, project_id: &str, idempotent: bool) -> StoreResult<()>;

    async fn disconnect_project(&self, environment: &str, project_id: &str) -> StoreResult<()>;

    /// Create a disabled join row for every feature in the project that lacks one.
    async fn connect_features(&self, environment: &str, project_id: &str) -> StoreResult<()>;

    async fn disconnect_features(&self, environment: &str, project_id: &str) -> StoreResult<()>;

    async fn connect_feature_to_environments_for_project(
        &self,
        feature_name: &str,
        project_id: &str,
        enabled_in: &HashMap<String, bool>,
    ) -> StoreResult<()>;

    async fn disable_environment_if_no_strategies(&self, feature_name: &str, environment: &str) -> StoreResult<()>;

    /// Returns the number of rows that actually changed (0 or 1).
    async fn set_environment_enabled_status(
        &self,
        environment: &str,
        feature_name: &str,
        enabled: bool,
    ) -> StoreResult<u64>;

    async fn copy_environment_features_by_projects(
        &self,
        source_environment: &str,
        destination_environment: &str,
        projects: &[String],
    ) -> StoreResult<()>;

    /// Copy strategies and their segment attachments in one transaction.
    async fn clone_strategies(
        &self,
        source_environment: &str,
        destination_environment: &str,
        projects: &[String],
    ) -> StoreResult<()>;

    async fn set_variants_to_feature_environments(
        &self,
        feature_name: &str,
        environments: &[String],
        variants: &[Variant],
    ) -> StoreResult<()>;

    async fn add_variants_to_feature_environment(
        &self,
        feature_name: &str,
        environment: &str,
        variants: &[Variant],
    ) -> StoreResult<()> {
        self.set_variants_to_feature_environments(feature_name, &[environment.to_string()], variants)
            .await
    }

    async fn variant_exists(&self, feature_name: &str) -> StoreResult<bool>;

    async fn update_last_seen(&self, feature_name: &str, environment: &str, seen_at: DateTime<Utc>) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteFeatureEnvironmentStore {
    pool: SqlitePool,
    timer: StoreTimer,
    visibility: VisibilityPolicy,
}

impl SqliteFeatureEnvironmentStore {
    pub fn new(pool: SqlitePool, instrumentation: &Instrumentation, visibility: VisibilityPolicy) -> Self {
        Self {
            pool,
            timer: instrumentation.for_store("feature-environment"),
            visibility,
        }
    }

    async fn fetch_one(&self, feature_name: &str, environment: &str) -> StoreResult<Option<FeatureEnvironment>> {
        let row = sqlx::query_as::<_, FeatureEnvironmentRow>(&format!(
            "SELECT {FEATURE_ENVIRONMENT_COLUMNS} FROM feature_environments \
             WHERE feature_name = $1 AND environment = $2"
        ))
        .bind(feature_name)
        .bind(environment)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeatureEnvironment::from))
    }

    async fn fetch_all(&self, query: &mut QueryBuilder<'_, Sqlite>) -> StoreResult<Vec<FeatureEnvironment>> {
        let rows = query
            .build_query_as::<FeatureEnvironmentRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FeatureEnvironment::from).collect())
    }

    fn not_found(feature_name: &str, environment: &str) -> StoreError {
        StoreError::NotFound(format!("Could not find {feature_name} in {environment}"))
    }
}

fn push_in_list<'args>(query: &mut QueryBuilder<'args, Sqlite>, values: &[String]) {
    query.push("(");
    let mut separated = query.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
    query.push(")");
}

#[async_trait]
impl FeatureEnvironmentStore for SqliteFeatureEnvironmentStore {
    async fn get(&self, key: &FeatureEnvironmentKey) -> StoreResult<FeatureEnvironment> {
        self.fetch_one(&key.feature_name, &key.environment)
            .await?
            .ok_or_else(|| Self::not_found(&key.feature_name, &key.environment))
    }

    async fn get_environment_meta_data(&self, environment: &str, feature_name: &str) -> StoreResult<FeatureEnvironment> {
        self.fetch_one(feature_name, environment)
            .await?
            .ok_or_else(|| Self::not_found(feature_name, environment))
    }

    async fn exists(&self, key: &FeatureEnvironmentKey) -> StoreResult<bool> {
        self.feature_has_environment(&key.environment, &key.feature_name).await
    }

    async fn feature_has_environment(&self, environment: &str, feature_name: &str) -> StoreResult<bool> {
        let present: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM feature_environments WHERE feature_name = $1 AND environment = $2)",
        )
        .bind(feature_name)
        .bind(environment)
        .fetch_one(&self.pool)
        .await?;
        Ok(present)
    }

    async fn is_environment_enabled(&self, feature_name: &str, environment: &str) -> StoreResult<bool> {
        let enabled: Option<bool> = sqlx::query_scalar(
            "SELECT enabled FROM feature_environments WHERE feature_name = $1 AND environment = $2",
        )
        .bind(feature_name)
        .bind(environment)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enabled.unwrap_or(false))
    }

    async fn get_all(&self, feature_name: Option<&str>) -> StoreResult<Vec<FeatureEnvironment>> {
        let _timer = self.timer.time("getAll");
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FEATURE_ENVIRONMENT_COLUMNS} FROM feature_environments WHERE 1 = 1"
        ));
        if let Some(feature_name) = feature_name {
            query.push(" AND feature_name = ").push_bind(feature_name.to_string());
        }
        self.visibility.scope_environments(&mut query, "environment");
        query.push(" ORDER BY feature_name ASC, environment ASC");
        self.fetch_all(&mut query).await
    }

    async fn get_all_by_features(
        &self,
        features: &[String],
        environment: Option<&str>,
    ) -> StoreResult<Vec<FeatureEnvironment>> {
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let _timer = self.timer.time("getAllByFeatures");
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FEATURE_ENVIRONMENT_COLUMNS} FROM feature_environments WHERE feature_name IN "
        ));
        push_in_list(&mut query, features);
        if let Some(environment) = environment {
            query.push(" AND environment = ").push_bind(environment.to_string());
        }
        self.visibility.scope_environments(&mut query, "environment");
        query.push(" ORDER BY feature_name ASC, environment ASC");
        self.fetch_all(&mut query).await
    }

    async fn get_environments_for_feature(&self, feature_name: &str) -> StoreResult<Vec<FeatureEnvironment>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FEATURE_ENVIRONMENT_COLUMNS} FROM feature_environments WHERE feature_name = "
        ));
        query.push_bind(feature_name.to_string());
        self.visibility.scope_environments(&mut query, "environment");
        query.push(" ORDER BY environment ASC");
        self.fetch_all(&mut query).await
    }

    async fn delete(&self, key: &FeatureEnvironmentKey) -> StoreResult<()> {
        self.remove_environment_for_feature(&key.feature_name, &key.environment)
            .await
    }

    async fn remove_environment_for_feature(&self, feature_name: &str, environment: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM feature_environments WHERE feature_name = $1 AND environment = $2")
            .bind(feature_name)
            .bind(environment)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_environment_to_feature(&self, feature_name: &str, environment: &str, enabled: bool) -> StoreResult<()> {
        let _timer = self.timer.time("addEnvironmentToFeature");
        sqlx::query(
            r#"INSERT INTO feature_environments (feature_name, environment, enabled)
               VALUES ($1, $2, $3)
               ON CONFLICT(environment, feature_name) DO UPDATE SET enabled = excluded.enabled"#,
        )
        .bind(feature_name)
        .bind(environment)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_feature_environment(&self, feature_environment: &FeatureEnvironment) -> StoreResult<()> {
        let variants = sort_variants(feature_environment.variants.clone());
        sqlx::query(
            r#"INSERT INTO feature_environments (feature_name, environment, enabled, variants)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT(environment, feature_name)
               DO UPDATE SET enabled = excluded.enabled, variants = excluded.variants"#,
        )
        .bind(&feature_environment.feature_name)
        .bind(&feature_environment.environment)
        .bind(feature_environment.enabled)
        .bind(Json(variants))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn connect_project(&self, environment: &str, project_id: &str, idempotent: bool) -> StoreResult<()> {
        let sql = if idempotent {
            "INSERT INTO project_environments (project_id, environment_name) VALUES ($1, $2) \
             ON CONFLICT(project_id, environment_name) DO NOTHING"
        } else {
            "INSERT INTO project_environments (project_id, environment_name) VALUES ($1, $2)"
        };
        sqlx::query(sql)
            .bind(project_id)
            .bind(environment)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StoreError::from_insert(e, format!("project {project_id} is already linked to environment {environment}"))
            })?;
        Ok(())
    }

    async fn disconnect_project(&self, environment: &str, project_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM project_environments WHERE project_id = $1 AND environment_name = $2")
            .bind(project_id)
            .bind(environment)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn connect_features(&self, environment: &str, project_id: &str) -> StoreResult<()> {
        let _timer = self.timer.time("connectFeatures");
        let result = sqlx::query(
            r#"INSERT INTO feature_environments (environment, feature_name, enabled)
               SELECT $1, name, 0 FROM features WHERE project = $2
               ON CONFLICT(environment, feature_name) DO NOTHING"#,
        )
        .bind(environment)
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        tracing::debug!(
            environment = %environment,
            project = %project_id,
            connected = result.rows_affected(),
            "Connected project features to environment"
        );
        Ok(())
    }

    async fn disconnect_features(&self, environment: &str, project_id: &str) -> StoreResult<()> {
        let _timer = self.timer.time("disconnectFeatures");
        sqlx::query(
            r#"DELETE FROM feature_environments
               WHERE environment = $1
                 AND feature_name IN (SELECT name FROM features WHERE project = $2)"#,
        )
        .bind(environment)
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn connect_feature_to_environments_for_project(
        &self,
        feature_name: &str,
        project_id: &str,
        enabled_in: &HashMap<String, bool>,
    ) -> StoreResult<()> {
        let environments: Vec<String> =
            sqlx::query_scalar("SELECT environment_name FROM project_environments WHERE project_id = $1")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        if environments.is_empty() {
            return Ok(());
        }

        let mut query =
            QueryBuilder::<Sqlite>::new("INSERT INTO feature_environments (environment, feature_name, enabled) ");
        query.push_values(&environments, |mut row, environment| {
            row.push_bind(environment.clone())
                .push_bind(feature_name.to_string())
                .push_bind(enabled_in.get(environment).copied().unwrap_or(false));
        });
        query.push(" ON CONFLICT(environment, feature_name) DO NOTHING");
        query.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn disable_environment_if_no_strategies(&self, feature_name: &str, environment: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"UPDATE feature_environments SET enabled = 0
               WHERE feature_name = $1 AND environment = $2
                 AND NOT EXISTS (SELECT 1 FROM feature_strategies
                                  WHERE feature_name = $1 AND environment = $2)"#,
        )
        .bind(feature_name)
        .bind(environment)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            tracing::debug!(
                feature = %feature_name,
                environment = %environment,
                "Disabled environment without strategies"
            );
        }
        Ok(())
    }

    async fn set_environment_enabled_status(
        &self,
        environment: &str,
        feature_name: &str,
        enabled: bool,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE feature_environments SET enabled = $1 \
             WHERE environment = $2 AND feature_name = $3 AND enabled = $4",
        )
        .bind(enabled)
        .bind(environment)
        .bind(feature_name)
        .bind(!enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn copy_environment_features_by_projects(
        &self,
        source_environment: &str,
        destination_environment: &str,
        projects: &[String],
    ) -> StoreResult<()> {
        if projects.is_empty() {
            return Ok(());
        }
        let _timer = self.timer.time("copyEnvironmentFeaturesByProjects");
        let mut query = QueryBuilder::<Sqlite>::new(
            "INSERT INTO feature_environments (environment, feature_name, enabled, variants) SELECT DISTINCT ",
        );
        query
            .push_bind(destination_environment.to_string())
            .push(
                ", fe.feature_name, fe.enabled, fe.variants FROM feature_environments fe \
                 INNER JOIN features f ON fe.feature_name = f.name WHERE fe.environment = ",
            )
            .push_bind(source_environment.to_string())
            .push(" AND f.project IN ");
        push_in_list(&mut query, projects);
        query.push(" ON CONFLICT(environment, feature_name) DO NOTHING");
        query.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn clone_strategies(
        &self,
        source_environment: &str,
        destination_environment: &str,
        projects: &[String],
    ) -> StoreResult<()> {
        if projects.is_empty() {
            return Ok(());
        }
        let _timer = self.timer.time("cloneStrategies");
        let mut tx = self.pool.begin().await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {STRATEGY_COLUMNS} FROM feature_strategies WHERE environment = "
        ));
        select
            .push_bind(source_environment.to_string())
            .push(" AND feature_name IN (SELECT name FROM features WHERE project IN ");
        push_in_list(&mut select, projects);
        select.push(") ORDER BY created_at ASC");
        let sources: Vec<FeatureStrategy> = select
            .build_query_as::<FeatureStrategyRow>()
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(FeatureStrategy::from)
            .collect();

        if sources.is_empty() {
            return Ok(());
        }

        let clones: Vec<(Uuid, &FeatureStrategy)> = sources.iter().map(|s| (Uuid::new_v4(), s)).collect();
        let id_map: HashMap<Uuid, Uuid> = clones.iter().map(|(new_id, s)| (s.id, *new_id)).collect();

        let mut insert = QueryBuilder::<Sqlite>::new(
            "INSERT INTO feature_strategies (id, feature_name, project_name, environment, strategy_name, \
             parameters, constraints, variants, sort_order, title, disabled) ",
        );
        insert.push_values(&clones, |mut row, (new_id, source)| {
            row.push_bind(*new_id)
                .push_bind(source.feature_name.clone())
                .push_bind(source.project_id.clone())
                .push_bind(destination_environment.to_string())
                .push_bind(source.strategy_name.clone())
                .push_bind(Json(source.parameters.clone()))
                .push_bind(Json(source.constraints.clone()))
                .push_bind(Json(source.variants.clone()))
                .push_bind(source.sort_order)
                .push_bind(source.title.clone())
                .push_bind(source.disabled);
        });
        insert.build().execute(&mut *tx).await?;

        let mut segments_query = QueryBuilder::<Sqlite>::new(
            "SELECT feature_strategy_id, segment_id FROM feature_strategy_segment WHERE feature_strategy_id IN (",
        );
        let mut separated = segments_query.separated(", ");
        for source in &sources {
            separated.push_bind(source.id);
        }
        segments_query.push(")");
        let attachments: Vec<(Uuid, i64)> = segments_query.build_query_as().fetch_all(&mut *tx).await?;

        let cloned_attachments: Vec<(Uuid, i64)> = attachments
            .into_iter()
            .filter_map(|(strategy_id, segment_id)| id_map.get(&strategy_id).map(|new_id| (*new_id, segment_id)))
            .collect();
        if !cloned_attachments.is_empty() {
            let mut insert_segments =
                QueryBuilder::<Sqlite>::new("INSERT INTO feature_strategy_segment (feature_strategy_id, segment_id) ");
            insert_segments.push_values(&cloned_attachments, |mut row, (strategy_id, segment_id)| {
                row.push_bind(*strategy_id).push_bind(*segment_id);
            });
            insert_segments.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::info!(
            source = %source_environment,
            destination = %destination_environment,
            strategies = clones.len(),
            segments = cloned_attachments.len(),
            "Cloned strategies between environments"
        );
        Ok(())
    }

    async fn set_variants_to_feature_environments(
        &self,
        feature_name: &str,
        environments: &[String],
        variants: &[Variant],
    ) -> StoreResult<()> {
        if environments.is_empty() {
            return Ok(());
        }
        let sorted = sort_variants(variants.to_vec());
        let serialized = serde_json::to_string(&sorted)?;
        let mut query =
            QueryBuilder::<Sqlite>::new("INSERT INTO feature_environments (feature_name, environment, enabled, variants) ");
        query.push_values(environments, |mut row, environment| {
            row.push_bind(feature_name.to_string())
                .push_bind(environment.clone())
                .push_bind(false)
                .push_bind(serialized.clone());
        });
        query.push(" ON CONFLICT(environment, feature_name) DO UPDATE SET variants = excluded.variants");
        query.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn variant_exists(&self, feature_name: &str) -> StoreResult<bool> {
        let present: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM feature_environments
                              WHERE feature_name = $1 AND json_array_length(variants) > 0)"#,
        )
        .bind(feature_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(present)
    }

    async fn update_last_seen(&self, feature_name: &str, environment: &str, seen_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE feature_environments SET last_seen_at = $1 WHERE feature_name = $2 AND environment = $3")
            .bind(seen_at)
            .bind(feature_name)
            .bind(environment)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
