use std::collections::{BTreeMap, btree_map::Entry};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, types::Json};
use ts_rs::TS;
use utils::instrumentation::{Instrumentation, StoreTimer};
use uuid::Uuid;

use super::variant::{Variant, sort_variants};
use crate::{
    error::{StoreError, StoreResult},
    visibility::VisibilityPolicy,
};

pub type StrategyParameters = BTreeMap<String, String>;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub context_name: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
    pub value: Option<String>,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl Constraint {
    pub fn in_list(context_name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            context_name: context_name.into(),
            operator: "IN".to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
            value: None,
            inverted: false,
            case_insensitive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStrategy {
    pub id: Uuid,
    pub feature_name: String,
    pub project_id: String,
    pub environment: String,
    pub strategy_name: String,
    pub parameters: StrategyParameters,
    pub constraints: Vec<Constraint>,
    pub variants: Vec<Variant>,
    pub sort_order: i32,
    pub title: Option<String>,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
pub(crate) struct FeatureStrategyRow {
    id: Uuid,
    feature_name: String,
    project_name: String,
    environment: String,
    strategy_name: String,
    parameters: Json<StrategyParameters>,
    constraints: Json<Vec<Constraint>>,
    variants: Json<Vec<Variant>>,
    sort_order: i32,
    title: Option<String>,
    disabled: bool,
    created_at: DateTime<Utc>,
}

impl From<FeatureStrategyRow> for FeatureStrategy {
    fn from(row: FeatureStrategyRow) -> Self {
        Self {
            id: row.id,
            feature_name: row.feature_name,
            project_id: row.project_name,
            environment: row.environment,
            strategy_name: row.strategy_name,
            parameters: row.parameters.0,
            constraints: row.constraints.0,
            variants: row.variants.0,
            sort_order: row.sort_order,
            title: row.title,
            disabled: row.disabled,
            created_at: row.created_at,
        }
    }
}

pub(crate) const STRATEGY_COLUMNS: &str = "id, feature_name, project_name, environment, strategy_name, parameters, \
     constraints, variants, sort_order, title, disabled, created_at";

/// Everything needed to insert a strategy row; the id is generated by the store.
#[derive(Debug, Clone)]
pub struct NewFeatureStrategy {
    pub feature_name: String,
    pub project_id: String,
    pub environment: String,
    pub strategy_name: String,
    pub parameters: StrategyParameters,
    pub constraints: Vec<Constraint>,
    pub variants: Vec<Variant>,
    pub sort_order: Option<i32>,
    pub title: Option<String>,
    pub disabled: bool,
}

impl NewFeatureStrategy {
    pub fn from_request(
        request: &CreateFeatureStrategy,
        project_id: &str,
        feature_name: &str,
        environment: &str,
    ) -> Self {
        Self {
            feature_name: feature_name.to_string(),
            project_id: project_id.to_string(),
            environment: environment.to_string(),
            strategy_name: request.name.clone(),
            parameters: request.parameters.clone(),
            constraints: request.constraints.clone(),
            variants: request.variants.clone(),
            sort_order: request.sort_order,
            title: request.title.clone(),
            disabled: request.disabled.unwrap_or(false),
        }
    }
}

/// Partial strategy update. `constraints` is always written, falling back to
/// an empty list when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStrategyUpdate {
    pub strategy_name: Option<String>,
    pub parameters: Option<StrategyParameters>,
    pub constraints: Option<Vec<Constraint>>,
    pub variants: Option<Vec<Variant>>,
    pub title: Option<String>,
    pub disabled: Option<bool>,
}

/// Strategy payload as accepted over the API and stored as a project default.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct CreateFeatureStrategy {
    pub name: String,
    pub title: Option<String>,
    pub disabled: Option<bool>,
    #[serde(default)]
    pub parameters: StrategyParameters,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    pub sort_order: Option<i32>,
    #[serde(default)]
    pub segments: Vec<i64>,
}

impl CreateFeatureStrategy {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            disabled: None,
            parameters: StrategyParameters::new(),
            constraints: Vec::new(),
            variants: Vec::new(),
            sort_order: None,
            segments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEnvironmentDetail {
    pub name: String,
    #[serde(rename = "type")]
    pub environment_type: String,
    pub enabled: bool,
    pub sort_order: i32,
    pub variants: Vec<Variant>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub strategies: Vec<FeatureStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggleWithEnvironments {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub feature_type: String,
    pub project: String,
    pub stale: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub environments: Vec<FeatureEnvironmentDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEnvironmentSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub environment_type: String,
    pub enabled: bool,
    pub sort_order: i32,
    pub has_strategies: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureOverview {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub feature_type: String,
    pub stale: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub environments: Vec<FeatureEnvironmentSummary>,
}

/// One row of the wide feature/environment/strategy join.
#[derive(FromRow)]
struct FeatureEnvironmentStrategyRow {
    name: String,
    description: Option<String>,
    feature_type: String,
    project: String,
    stale: bool,
    archived_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    environment: Option<String>,
    environment_type: Option<String>,
    environment_sort_order: Option<i32>,
    environment_enabled: Option<bool>,
    environment_variants: Option<Json<Vec<Variant>>>,
    last_seen_at: Option<DateTime<Utc>>,
    strategy_id: Option<Uuid>,
    strategy_name: Option<String>,
    strategy_parameters: Option<Json<StrategyParameters>>,
    strategy_constraints: Option<Json<Vec<Constraint>>>,
    strategy_variants: Option<Json<Vec<Variant>>>,
    strategy_sort_order: Option<i32>,
    strategy_title: Option<String>,
    strategy_disabled: Option<bool>,
    strategy_created_at: Option<DateTime<Utc>>,
}

impl FeatureEnvironmentStrategyRow {
    fn strategy(&self, environment: &str) -> Option<FeatureStrategy> {
        let id = self.strategy_id?;
        Some(FeatureStrategy {
            id,
            feature_name: self.name.clone(),
            project_id: self.project.clone(),
            environment: environment.to_string(),
            strategy_name: self.strategy_name.clone().unwrap_or_default(),
            parameters: self
                .strategy_parameters
                .as_ref()
                .map(|p| p.0.clone())
                .unwrap_or_default(),
            constraints: self
                .strategy_constraints
                .as_ref()
                .map(|c| c.0.clone())
                .unwrap_or_default(),
            variants: self
                .strategy_variants
                .as_ref()
                .map(|v| v.0.clone())
                .unwrap_or_default(),
            sort_order: self.strategy_sort_order.unwrap_or(0),
            title: self.strategy_title.clone(),
            disabled: self.strategy_disabled.unwrap_or(false),
            created_at: self.strategy_created_at.unwrap_or(self.created_at),
        })
    }
}

/// Fold the flat join rows into one aggregate per feature.
///
/// Pass one groups environments by name and collects strategies, deduplicating
/// by id. Pass two orders environments by `(sort_order, name)`, strategies by
/// `(sort_order, created_at)` and variants by name.
fn fold_feature_rows(rows: Vec<FeatureEnvironmentStrategyRow>) -> Option<FeatureToggleWithEnvironments> {
    let first = rows.first()?;
    let mut feature = FeatureToggleWithEnvironments {
        name: first.name.clone(),
        description: first.description.clone(),
        feature_type: first.feature_type.clone(),
        project: first.project.clone(),
        stale: first.stale,
        archived: first.archived_at.is_some(),
        created_at: first.created_at,
        last_seen_at: None,
        environments: Vec::new(),
    };

    let mut environments: BTreeMap<String, FeatureEnvironmentDetail> = BTreeMap::new();
    for row in &rows {
        let Some(env_name) = row.environment.as_deref() else {
            continue;
        };
        let env = match environments.entry(env_name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(FeatureEnvironmentDetail {
                name: env_name.to_string(),
                environment_type: row.environment_type.clone().unwrap_or_default(),
                enabled: row.environment_enabled.unwrap_or(false),
                sort_order: row.environment_sort_order.unwrap_or(0),
                variants: row
                    .environment_variants
                    .as_ref()
                    .map(|v| v.0.clone())
                    .unwrap_or_default(),
                last_seen_at: row.last_seen_at,
                strategies: Vec::new(),
            }),
        };
        if let Some(strategy) = row.strategy(env_name) {
            if !env.strategies.iter().any(|s| s.id == strategy.id) {
                env.strategies.push(strategy);
            }
        }
    }

    feature.environments = environments.into_values().collect();
    feature.order_environments();
    Some(feature)
}

impl FeatureToggleWithEnvironments {
    /// Second pass of the fold: order environments, their strategies and
    /// variants, and derive the feature-level last seen timestamp.
    pub(crate) fn order_environments(&mut self) {
        self.environments
            .sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        for env in &mut self.environments {
            env.strategies.sort_by(|a, b| {
                a.sort_order
                    .cmp(&b.sort_order)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });
            env.variants = sort_variants(std::mem::take(&mut env.variants));
        }
        self.last_seen_at = self.environments.iter().filter_map(|e| e.last_seen_at).max();
    }
}

#[derive(FromRow)]
struct FeatureOverviewRow {
    name: String,
    description: Option<String>,
    feature_type: String,
    stale: bool,
    archived_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    environment: Option<String>,
    environment_type: Option<String>,
    environment_sort_order: Option<i32>,
    environment_enabled: Option<bool>,
    last_seen_at: Option<DateTime<Utc>>,
    has_strategies: Option<bool>,
}

fn fold_overview_rows(rows: Vec<FeatureOverviewRow>) -> Vec<FeatureOverview> {
    let mut features: BTreeMap<String, FeatureOverview> = BTreeMap::new();
    for row in rows {
        let feature = features.entry(row.name.clone()).or_insert_with(|| FeatureOverview {
            name: row.name.clone(),
            description: row.description.clone(),
            feature_type: row.feature_type.clone(),
            stale: row.stale,
            archived: row.archived_at.is_some(),
            created_at: row.created_at,
            last_seen_at: None,
            environments: Vec::new(),
        });
        if let Some(environment) = row.environment {
            feature.last_seen_at = feature.last_seen_at.max(row.last_seen_at);
            feature.environments.push(FeatureEnvironmentSummary {
                name: environment,
                environment_type: row.environment_type.unwrap_or_default(),
                enabled: row.environment_enabled.unwrap_or(false),
                sort_order: row.environment_sort_order.unwrap_or(0),
                has_strategies: row.has_strategies.unwrap_or(false),
            });
        }
    }

    features
        .into_values()
        .map(|mut feature| {
            feature.order_environments();
            feature
        })
        .collect()
}

impl FeatureOverview {
    pub(crate) fn order_environments(&mut self) {
        self.environments
            .sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
    }
}

#[async_trait]
pub trait FeatureStrategyStore: Send + Sync {
    async fn create_strategy_feature_env(&self, strategy: &NewFeatureStrategy) -> StoreResult<FeatureStrategy>;

    async fn get_strategy_by_id(&self, id: Uuid) -> StoreResult<FeatureStrategy>;

    async fn exists(&self, id: Uuid) -> StoreResult<bool>;

    async fn delete(&self, id: Uuid) -> StoreResult<()>;

    async fn get_strategies_for_feature_env(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
    ) -> StoreResult<Vec<FeatureStrategy>>;

    async fn get_strategies_for_toggle(&self, feature_name: &str) -> StoreResult<Vec<FeatureStrategy>>;

    async fn get_strategies_for_environment(&self, environment: &str) -> StoreResult<Vec<FeatureStrategy>>;

    async fn remove_all_strategies_for_feature_env(&self, feature_name: &str, environment: &str) -> StoreResult<()>;

    async fn update_strategy(&self, id: Uuid, update: &FeatureStrategyUpdate) -> StoreResult<FeatureStrategy>;

    async fn update_sort_order(&self, id: Uuid, sort_order: i32) -> StoreResult<()>;

    async fn get_feature_toggle_with_envs(
        &self,
        feature_name: &str,
        archived: bool,
    ) -> StoreResult<FeatureToggleWithEnvironments>;

    async fn get_feature_overview(&self, project_id: &str, archived: bool) -> StoreResult<Vec<FeatureOverview>>;

    async fn get_strategies_by_segment(&self, segment_id: i64) -> StoreResult<Vec<FeatureStrategy>>;

    async fn delete_configurations_for_project_and_environment(
        &self,
        project_id: &str,
        environment: &str,
    ) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteFeatureStrategyStore {
    pool: SqlitePool,
    timer: StoreTimer,
    visibility: VisibilityPolicy,
}

impl SqliteFeatureStrategyStore {
    pub fn new(pool: SqlitePool, instrumentation: &Instrumentation, visibility: VisibilityPolicy) -> Self {
        Self {
            pool,
            timer: instrumentation.for_store("feature-strategy"),
            visibility,
        }
    }

    async fn fetch_strategies(&self, query: &mut QueryBuilder<'_, Sqlite>) -> StoreResult<Vec<FeatureStrategy>> {
        let rows = query
            .build_query_as::<FeatureStrategyRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FeatureStrategy::from).collect())
    }
}

#[async_trait]
impl FeatureStrategyStore for SqliteFeatureStrategyStore {
    async fn create_strategy_feature_env(&self, strategy: &NewFeatureStrategy) -> StoreResult<FeatureStrategy> {
        let _timer = self.timer.time("createStrategyFeatureEnv");
        let id = Uuid::new_v4();
        let row = sqlx::query_as::<_, FeatureStrategyRow>(&format!(
            r#"INSERT INTO feature_strategies
                 (id, feature_name, project_name, environment, strategy_name, parameters,
                  constraints, variants, sort_order, title, disabled)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, 9999), $10, $11)
               RETURNING {STRATEGY_COLUMNS}"#
        ))
        .bind(id)
        .bind(&strategy.feature_name)
        .bind(&strategy.project_id)
        .bind(&strategy.environment)
        .bind(&strategy.strategy_name)
        .bind(Json(&strategy.parameters))
        .bind(Json(&strategy.constraints))
        .bind(Json(&strategy.variants))
        .bind(strategy.sort_order)
        .bind(&strategy.title)
        .bind(strategy.disabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("strategy {id} already exists")))?;

        tracing::debug!(
            strategy_id = %id,
            feature = %strategy.feature_name,
            environment = %strategy.environment,
            "Created feature strategy"
        );
        Ok(row.into())
    }

    async fn get_strategy_by_id(&self, id: Uuid) -> StoreResult<FeatureStrategy> {
        sqlx::query_as::<_, FeatureStrategyRow>(&format!(
            "SELECT {STRATEGY_COLUMNS} FROM feature_strategies WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(FeatureStrategy::from)
        .ok_or_else(|| StoreError::NotFound(format!("Could not find strategy with id: {id}")))
    }

    async fn exists(&self, id: Uuid) -> StoreResult<bool> {
        let present: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM feature_strategies WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(present)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM feature_strategies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_strategies_for_feature_env(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
    ) -> StoreResult<Vec<FeatureStrategy>> {
        let _timer = self.timer.time("getForFeatureEnv");
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {STRATEGY_COLUMNS} FROM feature_strategies WHERE project_name = "
        ));
        query
            .push_bind(project_id.to_string())
            .push(" AND feature_name = ")
            .push_bind(feature_name.to_string())
            .push(" AND environment = ")
            .push_bind(environment.to_string())
            .push(" ORDER BY sort_order ASC, created_at ASC");
        self.fetch_strategies(&mut query).await
    }

    async fn get_strategies_for_toggle(&self, feature_name: &str) -> StoreResult<Vec<FeatureStrategy>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {STRATEGY_COLUMNS} FROM feature_strategies WHERE feature_name = "
        ));
        query.push_bind(feature_name.to_string());
        self.visibility.scope_environments(&mut query, "environment");
        query.push(" ORDER BY environment ASC, sort_order ASC, created_at ASC");
        self.fetch_strategies(&mut query).await
    }

    async fn get_strategies_for_environment(&self, environment: &str) -> StoreResult<Vec<FeatureStrategy>> {
        let _timer = self.timer.time("getStrategiesForEnvironment");
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {STRATEGY_COLUMNS} FROM feature_strategies WHERE environment = "
        ));
        query
            .push_bind(environment.to_string())
            .push(" ORDER BY feature_name ASC, sort_order ASC, created_at ASC");
        self.fetch_strategies(&mut query).await
    }

    async fn remove_all_strategies_for_feature_env(&self, feature_name: &str, environment: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM feature_strategies WHERE feature_name = $1 AND environment = $2")
            .bind(feature_name)
            .bind(environment)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_strategy(&self, id: Uuid, update: &FeatureStrategyUpdate) -> StoreResult<FeatureStrategy> {
        let _timer = self.timer.time("updateStrategy");
        let constraints = update.constraints.clone().unwrap_or_default();
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE feature_strategies SET constraints = ");
        query.push_bind(Json(constraints));
        if let Some(strategy_name) = &update.strategy_name {
            query.push(", strategy_name = ").push_bind(strategy_name.clone());
        }
        if let Some(parameters) = &update.parameters {
            query.push(", parameters = ").push_bind(Json(parameters.clone()));
        }
        if let Some(variants) = &update.variants {
            query.push(", variants = ").push_bind(Json(variants.clone()));
        }
        if let Some(title) = &update.title {
            query.push(", title = ").push_bind(title.clone());
        }
        if let Some(disabled) = update.disabled {
            query.push(", disabled = ").push_bind(disabled);
        }
        query
            .push(" WHERE id = ")
            .push_bind(id)
            .push(format!(" RETURNING {STRATEGY_COLUMNS}"));

        query
            .build_query_as::<FeatureStrategyRow>()
            .fetch_optional(&self.pool)
            .await?
            .map(FeatureStrategy::from)
            .ok_or_else(|| StoreError::NotFound(format!("Could not find strategy with id: {id}")))
    }

    async fn update_sort_order(&self, id: Uuid, sort_order: i32) -> StoreResult<()> {
        sqlx::query("UPDATE feature_strategies SET sort_order = $1 WHERE id = $2")
            .bind(sort_order)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_feature_toggle_with_envs(
        &self,
        feature_name: &str,
        archived: bool,
    ) -> StoreResult<FeatureToggleWithEnvironments> {
        let _timer = self.timer.time("getFeatureAdmin");
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"SELECT f.name AS name,
                      f.description AS description,
                      f.type AS feature_type,
                      f.project AS project,
                      f.stale AS stale,
                      f.archived_at AS archived_at,
                      f.created_at AS created_at,
                      fe.environment AS environment,
                      e.type AS environment_type,
                      e.sort_order AS environment_sort_order,
                      fe.enabled AS environment_enabled,
                      fe.variants AS environment_variants,
                      fe.last_seen_at AS last_seen_at,
                      fs.id AS strategy_id,
                      fs.strategy_name AS strategy_name,
                      fs.parameters AS strategy_parameters,
                      fs.constraints AS strategy_constraints,
                      fs.variants AS strategy_variants,
                      fs.sort_order AS strategy_sort_order,
                      fs.title AS strategy_title,
                      fs.disabled AS strategy_disabled,
                      fs.created_at AS strategy_created_at
               FROM features f
               LEFT JOIN feature_environments fe ON fe.feature_name = f.name"#,
        );
        self.visibility.scope_environments(&mut query, "fe.environment");
        query
            .push(
                r#"
               LEFT JOIN environments e ON e.name = fe.environment
               LEFT JOIN feature_strategies fs
                      ON fs.feature_name = f.name AND fs.environment = fe.environment
               WHERE f.name = "#,
            )
            .push_bind(feature_name.to_string())
            .push(" AND (f.archived_at IS NOT NULL) = ")
            .push_bind(archived);

        let rows = query
            .build_query_as::<FeatureEnvironmentStrategyRow>()
            .fetch_all(&self.pool)
            .await?;
        fold_feature_rows(rows).ok_or_else(|| {
            StoreError::NotFound(format!("Could not find feature toggle with name {feature_name}"))
        })
    }

    async fn get_feature_overview(&self, project_id: &str, archived: bool) -> StoreResult<Vec<FeatureOverview>> {
        let _timer = self.timer.time("getFeatureOverview");
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"SELECT f.name AS name,
                      f.description AS description,
                      f.type AS feature_type,
                      f.stale AS stale,
                      f.archived_at AS archived_at,
                      f.created_at AS created_at,
                      fe.environment AS environment,
                      e.type AS environment_type,
                      e.sort_order AS environment_sort_order,
                      fe.enabled AS environment_enabled,
                      fe.last_seen_at AS last_seen_at,
                      EXISTS (SELECT 1 FROM feature_strategies fs
                               WHERE fs.feature_name = f.name
                                 AND fs.environment = fe.environment) AS has_strategies
               FROM features f
               LEFT JOIN feature_environments fe ON fe.feature_name = f.name"#,
        );
        self.visibility.scope_environments(&mut query, "fe.environment");
        query
            .push(
                r#"
               LEFT JOIN environments e ON e.name = fe.environment
               WHERE f.project = "#,
            )
            .push_bind(project_id.to_string())
            .push(" AND (f.archived_at IS NOT NULL) = ")
            .push_bind(archived);

        let rows = query
            .build_query_as::<FeatureOverviewRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(fold_overview_rows(rows))
    }

    async fn get_strategies_by_segment(&self, segment_id: i64) -> StoreResult<Vec<FeatureStrategy>> {
        let rows = sqlx::query_as::<_, FeatureStrategyRow>(
            r#"SELECT fs.id AS id, fs.feature_name AS feature_name, fs.project_name AS project_name,
                      fs.environment AS environment, fs.strategy_name AS strategy_name,
                      fs.parameters AS parameters, fs.constraints AS constraints,
                      fs.variants AS variants, fs.sort_order AS sort_order, fs.title AS title,
                      fs.disabled AS disabled, fs.created_at AS created_at
               FROM feature_strategies fs
               INNER JOIN feature_strategy_segment fss ON fss.feature_strategy_id = fs.id
               WHERE fss.segment_id = $1
               ORDER BY fs.feature_name ASC, fs.sort_order ASC"#,
        )
        .bind(segment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeatureStrategy::from).collect())
    }

    async fn delete_configurations_for_project_and_environment(
        &self,
        project_id: &str,
        environment: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM feature_strategies WHERE project_name = $1 AND environment = $2")
            .bind(project_id)
            .bind(environment)
            .execute(&self.pool)
            .await?;
        tracing::debug!(
            project = %project_id,
            environment = %environment,
            deleted = result.rows_affected(),
            "Removed strategies for project environment"
        );
        Ok(())
    }
}
