//! Feature toggles and their per-environment strategies.

use std::collections::HashMap;

use db::{
    Stores,
    error::StoreError,
    models::{
        feature::{CreateFeature, Feature},
        feature_strategy::{
            CreateFeatureStrategy, FeatureOverview, FeatureStrategy, FeatureStrategyUpdate,
            FeatureToggleWithEnvironments, NewFeatureStrategy, StrategyParameters,
        },
        variant::Variant,
    },
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::environment::DEFAULT_STRATEGY_NAME;

#[derive(Debug, Error)]
pub enum FeatureToggleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Could not find project {0}")]
    ProjectNotFound(String),
    #[error("A feature named {0} already exists")]
    NameExists(String),
    #[error("Feature {feature} does not belong to project {project}")]
    WrongProject { feature: String, project: String },
    #[error("Environment {environment} is not enabled for project {project}")]
    EnvironmentNotLinked { project: String, environment: String },
    #[error("Strategy {0} does not belong to this feature environment")]
    StrategyMismatch(Uuid),
    #[error("Variant weights must add up to 1000, got {0}")]
    InvalidVariantWeights(i64),
    #[error("Variant {name} has weight {weight}, expected a value between 0 and 1000")]
    VariantWeightOutOfRange { name: String, weight: i32 },
}

/// The strategy added when an environment is enabled with nothing to evaluate.
pub fn default_rollout_strategy(feature_name: &str) -> CreateFeatureStrategy {
    let parameters: StrategyParameters = [
        ("rollout", "100"),
        ("stickiness", "default"),
        ("groupId", feature_name),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    CreateFeatureStrategy {
        parameters,
        ..CreateFeatureStrategy::named(DEFAULT_STRATEGY_NAME)
    }
}

#[derive(Clone)]
pub struct FeatureToggleService {
    stores: Stores,
}

impl FeatureToggleService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Create a feature and give it a row in every environment of its project.
    pub async fn create_feature(
        &self,
        project_id: &str,
        request: &CreateFeature,
        enabled_in: &HashMap<String, bool>,
    ) -> Result<Feature, FeatureToggleError> {
        if !self.stores.projects.exists(project_id).await? {
            return Err(FeatureToggleError::ProjectNotFound(project_id.to_string()));
        }
        let feature = self
            .stores
            .features
            .create(project_id, request)
            .await
            .map_err(|e| match e {
                StoreError::ConstraintViolation(_) => FeatureToggleError::NameExists(request.name.clone()),
                other => other.into(),
            })?;
        self.stores
            .feature_environments
            .connect_feature_to_environments_for_project(&feature.name, project_id, enabled_in)
            .await?;
        info!(feature = %feature.name, project = project_id, "Feature created");
        Ok(feature)
    }

    pub async fn get_feature(&self, name: &str, archived: bool) -> Result<FeatureToggleWithEnvironments, FeatureToggleError> {
        Ok(self
            .stores
            .feature_strategies
            .get_feature_toggle_with_envs(name, archived)
            .await?)
    }

    pub async fn get_feature_overview(
        &self,
        project_id: &str,
        archived: bool,
    ) -> Result<Vec<FeatureOverview>, FeatureToggleError> {
        Ok(self
            .stores
            .feature_strategies
            .get_feature_overview(project_id, archived)
            .await?)
    }

    pub async fn archive_feature(&self, project_id: &str, name: &str) -> Result<Feature, FeatureToggleError> {
        self.feature_in_project(project_id, name).await?;
        let feature = self.stores.features.archive(name).await?;
        info!(feature = name, project = project_id, "Feature archived");
        Ok(feature)
    }

    pub async fn get_strategies(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
    ) -> Result<Vec<FeatureStrategy>, FeatureToggleError> {
        self.feature_in_project(project_id, feature_name).await?;
        Ok(self
            .stores
            .feature_strategies
            .get_strategies_for_feature_env(project_id, feature_name, environment)
            .await?)
    }

    pub async fn create_strategy(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
        request: &CreateFeatureStrategy,
    ) -> Result<FeatureStrategy, FeatureToggleError> {
        self.feature_in_project(project_id, feature_name).await?;
        self.environment_linked(project_id, environment).await?;

        if !self
            .stores
            .feature_environments
            .feature_has_environment(environment, feature_name)
            .await?
        {
            self.stores
                .feature_environments
                .add_environment_to_feature(feature_name, environment, false)
                .await?;
        }
        let strategy = self
            .stores
            .feature_strategies
            .create_strategy_feature_env(&NewFeatureStrategy::from_request(
                request,
                project_id,
                feature_name,
                environment,
            ))
            .await?;
        for segment in &request.segments {
            self.stores.segments.add_to_strategy(strategy.id, *segment).await?;
        }
        debug!(
            strategy = %strategy.id,
            feature = feature_name,
            environment,
            "Strategy created"
        );
        Ok(strategy)
    }

    /// Apply a partial update. Omitted constraints keep their current value.
    pub async fn update_strategy(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
        id: Uuid,
        update: &FeatureStrategyUpdate,
    ) -> Result<FeatureStrategy, FeatureToggleError> {
        let existing = self.owned_strategy(project_id, feature_name, environment, id).await?;
        let update = FeatureStrategyUpdate {
            constraints: Some(update.constraints.clone().unwrap_or(existing.constraints)),
            ..update.clone()
        };
        Ok(self.stores.feature_strategies.update_strategy(id, &update).await?)
    }

    /// Delete a strategy; the environment is disabled once it has none left.
    pub async fn delete_strategy(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
        id: Uuid,
    ) -> Result<(), FeatureToggleError> {
        self.owned_strategy(project_id, feature_name, environment, id).await?;
        self.stores.feature_strategies.delete(id).await?;
        self.stores
            .feature_environments
            .disable_environment_if_no_strategies(feature_name, environment)
            .await?;
        Ok(())
    }

    /// Turn a feature on or off in one environment. Enabling an environment
    /// with no active strategy first adds the project's default strategy.
    /// Returns whether the stored state changed.
    pub async fn update_enabled(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
        enabled: bool,
    ) -> Result<bool, FeatureToggleError> {
        self.feature_in_project(project_id, feature_name).await?;
        self.stores
            .feature_environments
            .get_environment_meta_data(environment, feature_name)
            .await?;

        if enabled {
            let strategies = self
                .stores
                .feature_strategies
                .get_strategies_for_feature_env(project_id, feature_name, environment)
                .await?;
            if !strategies.iter().any(|s| !s.disabled) {
                let default_strategy = self
                    .stores
                    .projects
                    .get_default_strategy(project_id, environment)
                    .await?
                    .unwrap_or_else(|| default_rollout_strategy(feature_name));
                self.create_strategy(project_id, feature_name, environment, &default_strategy)
                    .await?;
            }
        }

        let changed = self
            .stores
            .feature_environments
            .set_environment_enabled_status(environment, feature_name, enabled)
            .await?
            > 0;
        if changed {
            info!(feature = feature_name, environment, enabled, "Feature environment toggled");
        }
        Ok(changed)
    }

    /// Replace the variants of `feature_name` in each of `environments`.
    pub async fn set_variants(
        &self,
        project_id: &str,
        feature_name: &str,
        environments: &[String],
        variants: &[Variant],
    ) -> Result<(), FeatureToggleError> {
        self.feature_in_project(project_id, feature_name).await?;
        if !variants.is_empty() {
            if let Some(variant) = variants.iter().find(|v| !(0..=1000).contains(&v.weight)) {
                return Err(FeatureToggleError::VariantWeightOutOfRange {
                    name: variant.name.clone(),
                    weight: variant.weight,
                });
            }
            let total: i64 = variants.iter().map(|v| i64::from(v.weight)).sum();
            if total != 1000 {
                return Err(FeatureToggleError::InvalidVariantWeights(total));
            }
        }
        self.stores
            .feature_environments
            .set_variants_to_feature_environments(feature_name, environments, variants)
            .await?;
        Ok(())
    }

    async fn feature_in_project(&self, project_id: &str, feature_name: &str) -> Result<Feature, FeatureToggleError> {
        let feature = self.stores.features.get(feature_name).await?;
        if feature.project != project_id {
            return Err(FeatureToggleError::WrongProject {
                feature: feature_name.to_string(),
                project: project_id.to_string(),
            });
        }
        Ok(feature)
    }

    async fn environment_linked(&self, project_id: &str, environment: &str) -> Result<(), FeatureToggleError> {
        let linked = self
            .stores
            .projects
            .get_environments_for_project(project_id)
            .await?;
        if linked.iter().any(|name| name == environment) {
            Ok(())
        } else {
            Err(FeatureToggleError::EnvironmentNotLinked {
                project: project_id.to_string(),
                environment: environment.to_string(),
            })
        }
    }

    async fn owned_strategy(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
        id: Uuid,
    ) -> Result<FeatureStrategy, FeatureToggleError> {
        self.feature_in_project(project_id, feature_name).await?;
        let strategy = self.stores.feature_strategies.get_strategy_by_id(id).await?;
        if strategy.feature_name != feature_name || strategy.environment != environment {
            return Err(FeatureToggleError::StrategyMismatch(id));
        }
        Ok(strategy)
    }
}
