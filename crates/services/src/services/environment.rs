//! Environment lifecycle and project links.

use std::collections::{BTreeMap, BTreeSet};

use db::{
    Stores,
    error::StoreError,
    models::{
        environment::{
            CreateEnvironment, Environment, EnvironmentFilter, EnvironmentWithCounts, ProjectEnvironment,
            UpdateEnvironment,
        },
        feature_strategy::CreateFeatureStrategy,
    },
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use ts_rs::TS;

pub const DEFAULT_STRATEGY_NAME: &str = "flexibleRollout";

#[derive(Debug, Error)]
pub enum EnvironmentServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Could not find environment {0}")]
    NotFound(String),
    #[error("Could not find project {0}")]
    ProjectNotFound(String),
    #[error("Environment {0} already exists")]
    NameExists(String),
    #[error("{project} already has the environment {environment} enabled")]
    AlreadyLinked { project: String, environment: String },
    #[error("You must always have one active environment")]
    MinimumOneEnvironment,
    #[error("Environment {0} is protected")]
    Protected(String),
    #[error("Only \"flexibleRollout\" strategy can be used as a default strategy for an environment")]
    InvalidDefaultStrategy,
}

/// Request to create `name` as a copy of an existing environment.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct CloneEnvironment {
    pub name: String,
    #[serde(rename = "type")]
    pub environment_type: String,
    /// Projects to carry over; defaults to every project linked to the source.
    pub projects: Option<Vec<String>>,
    #[serde(default)]
    pub clone_strategies: bool,
}

#[derive(Clone)]
pub struct EnvironmentService {
    stores: Stores,
}

impl EnvironmentService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn get_all(&self) -> Result<Vec<EnvironmentWithCounts>, EnvironmentServiceError> {
        Ok(self
            .stores
            .environments
            .get_all_with_counts(&EnvironmentFilter::default())
            .await?)
    }

    pub async fn get(&self, name: &str) -> Result<Environment, EnvironmentServiceError> {
        self.stores.environments.get(name).await.map_err(|e| match e {
            StoreError::NotFound(_) => EnvironmentServiceError::NotFound(name.to_string()),
            other => other.into(),
        })
    }

    pub async fn get_project_environments(
        &self,
        project_id: &str,
    ) -> Result<Vec<ProjectEnvironment>, EnvironmentServiceError> {
        self.ensure_project(project_id).await?;
        Ok(self
            .stores
            .environments
            .get_project_environments(project_id)
            .await?)
    }

    pub async fn create(&self, request: &CreateEnvironment) -> Result<Environment, EnvironmentServiceError> {
        let created = self.stores.environments.create(request).await.map_err(|e| match e {
            StoreError::ConstraintViolation(_) => EnvironmentServiceError::NameExists(request.name.clone()),
            other => other.into(),
        })?;
        info!(environment = %created.name, "Environment created");
        Ok(created)
    }

    pub async fn update(
        &self,
        name: &str,
        patch: &UpdateEnvironment,
    ) -> Result<Environment, EnvironmentServiceError> {
        match self.stores.environments.update(patch, name).await? {
            Some(updated) => Ok(updated),
            None => {
                // Either missing or protected; report which.
                self.get(name).await?;
                Err(EnvironmentServiceError::Protected(name.to_string()))
            }
        }
    }

    pub async fn delete(&self, name: &str) -> Result<(), EnvironmentServiceError> {
        if self.get(name).await?.protected {
            return Err(EnvironmentServiceError::Protected(name.to_string()));
        }
        self.stores.environments.delete(name).await?;
        info!(environment = %name, "Environment deleted");
        Ok(())
    }

    pub async fn update_sort_order(&self, sort_order: &BTreeMap<String, i32>) -> Result<(), EnvironmentServiceError> {
        for (name, order) in sort_order {
            self.stores.environments.update_sort_order(name, *order).await?;
        }
        Ok(())
    }

    pub async fn toggle_environment(&self, name: &str, enabled: bool) -> Result<(), EnvironmentServiceError> {
        if !self.stores.environments.exists(name).await? {
            return Err(EnvironmentServiceError::NotFound(name.to_string()));
        }
        self.stores.environments.toggle(name, enabled).await?;
        Ok(())
    }

    /// Link `environment` to `project_id` and give every project feature a
    /// (disabled) row in it.
    pub async fn add_environment_to_project(
        &self,
        environment: &str,
        project_id: &str,
    ) -> Result<(), EnvironmentServiceError> {
        self.ensure_environment(environment).await?;
        self.ensure_project(project_id).await?;
        self.link(environment, project_id, false).await?;
        info!(environment, project = project_id, "Environment added to project");
        Ok(())
    }

    pub async fn remove_environment_from_project(
        &self,
        environment: &str,
        project_id: &str,
    ) -> Result<(), EnvironmentServiceError> {
        let linked = self.stores.projects.get_environments_for_project(project_id).await?;
        if linked.len() <= 1 {
            return Err(EnvironmentServiceError::MinimumOneEnvironment);
        }
        self.force_remove_environment_from_project(environment, project_id)
            .await?;
        info!(environment, project = project_id, "Environment removed from project");
        Ok(())
    }

    pub async fn force_remove_environment_from_project(
        &self,
        environment: &str,
        project_id: &str,
    ) -> Result<(), EnvironmentServiceError> {
        self.stores
            .feature_environments
            .disconnect_features(environment, project_id)
            .await?;
        self.stores
            .feature_strategies
            .delete_configurations_for_project_and_environment(project_id, environment)
            .await?;
        self.stores
            .feature_environments
            .disconnect_project(environment, project_id)
            .await?;
        Ok(())
    }

    pub async fn update_default_strategy(
        &self,
        environment: &str,
        project_id: &str,
        strategy: &CreateFeatureStrategy,
    ) -> Result<CreateFeatureStrategy, EnvironmentServiceError> {
        if strategy.name != DEFAULT_STRATEGY_NAME {
            return Err(EnvironmentServiceError::InvalidDefaultStrategy);
        }
        let previous = self
            .stores
            .projects
            .get_default_strategy(project_id, environment)
            .await?;
        let updated = self
            .stores
            .projects
            .update_default_strategy(project_id, environment, strategy)
            .await?;
        info!(
            environment,
            project = project_id,
            had_previous = previous.is_some(),
            "Default strategy updated"
        );
        Ok(updated)
    }

    /// Enable exactly `names`, disabling every other environment, and move
    /// project links from the disabled environments to the newly enabled ones.
    pub async fn override_enabled_projects(&self, names: &[String]) -> Result<(), EnvironmentServiceError> {
        if names.is_empty() {
            return Ok(());
        }
        let all = self
            .stores
            .environments
            .get_all(&EnvironmentFilter::default())
            .await?;
        let existing: Vec<&Environment> = all.iter().filter(|env| names.contains(&env.name)).collect();
        let requested: BTreeSet<&String> = names.iter().collect();
        if existing.len() != requested.len() {
            warn!(
                ?names,
                "Found environment enabled overrides but some of the specified environments don't exist, no overrides will be executed"
            );
            return Ok(());
        }

        let to_enable: Vec<String> = existing
            .iter()
            .filter(|env| !env.enabled)
            .map(|env| env.name.clone())
            .collect();
        let to_disable: Vec<String> = all
            .iter()
            .filter(|env| env.enabled && !names.contains(&env.name))
            .map(|env| env.name.clone())
            .collect();

        self.stores.environments.disable(&to_disable).await?;
        self.stores.environments.enable(&to_enable).await?;
        self.remap_project_links(&to_disable, &to_enable).await
    }

    async fn remap_project_links(
        &self,
        disabled: &[String],
        enabled: &[String],
    ) -> Result<(), EnvironmentServiceError> {
        let links = self
            .stores
            .projects
            .get_project_links_for_environments(disabled)
            .await?;

        let mut projects = BTreeSet::new();
        for (environment, linked_projects) in &links {
            for project in linked_projects {
                self.force_remove_environment_from_project(environment, project)
                    .await?;
                projects.insert(project.clone());
            }
        }
        for project in &projects {
            for environment in enabled {
                self.link(environment, project, true).await?;
            }
        }
        Ok(())
    }

    /// Create a new environment from `source`, carrying over its project
    /// links and feature states, and optionally its strategies.
    pub async fn clone_environment(
        &self,
        source: &str,
        request: &CloneEnvironment,
    ) -> Result<Environment, EnvironmentServiceError> {
        let source_env = self.get(source).await?;
        let created = self
            .create(&CreateEnvironment {
                sort_order: Some(source_env.sort_order),
                required_approvals: source_env.required_approvals,
                ..CreateEnvironment::new(&request.name, &request.environment_type)
            })
            .await?;

        let projects = match &request.projects {
            Some(projects) => projects.clone(),
            None => self
                .stores
                .projects
                .get_project_links_for_environments(&[source.to_string()])
                .await?
                .remove(source)
                .unwrap_or_default(),
        };
        for project in &projects {
            self.stores
                .feature_environments
                .connect_project(&created.name, project, true)
                .await?;
        }
        self.stores
            .feature_environments
            .copy_environment_features_by_projects(source, &created.name, &projects)
            .await?;
        if request.clone_strategies {
            self.stores
                .feature_environments
                .clone_strategies(source, &created.name, &projects)
                .await?;
        }
        info!(
            source,
            environment = %created.name,
            projects = projects.len(),
            "Environment cloned"
        );
        Ok(created)
    }

    async fn link(&self, environment: &str, project_id: &str, idempotent: bool) -> Result<(), EnvironmentServiceError> {
        self.stores
            .feature_environments
            .connect_project(environment, project_id, idempotent)
            .await
            .map_err(|e| match e {
                StoreError::ConstraintViolation(_) => EnvironmentServiceError::AlreadyLinked {
                    project: project_id.to_string(),
                    environment: environment.to_string(),
                },
                other => other.into(),
            })?;
        self.stores
            .feature_environments
            .connect_features(environment, project_id)
            .await?;
        Ok(())
    }

    async fn ensure_environment(&self, name: &str) -> Result<(), EnvironmentServiceError> {
        if self.stores.environments.exists(name).await? {
            Ok(())
        } else {
            Err(EnvironmentServiceError::NotFound(name.to_string()))
        }
    }

    async fn ensure_project(&self, project_id: &str) -> Result<(), EnvironmentServiceError> {
        if self.stores.projects.exists(project_id).await? {
            Ok(())
        } else {
            Err(EnvironmentServiceError::ProjectNotFound(project_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use db::models::feature_strategy::NewFeatureStrategy;

    use super::*;
    use crate::services::test_support::{environment, feature, project, stores};

    async fn setup() -> (Stores, EnvironmentService) {
        let stores = stores();
        environment(&stores, "default", 1).await;
        environment(&stores, "production", 2).await;
        project(&stores, "web", &["default"]).await;
        feature(&stores, "web", "checkout").await;
        (stores.clone(), EnvironmentService::new(stores))
    }

    fn strategy(feature: &str, environment: &str) -> NewFeatureStrategy {
        NewFeatureStrategy::from_request(
            &CreateFeatureStrategy::named("default"),
            "web",
            feature,
            environment,
        )
    }

    #[tokio::test]
    async fn adding_environment_connects_features() {
        let (stores, service) = setup().await;

        service
            .add_environment_to_project("production", "web")
            .await
            .unwrap();

        assert!(stores
            .feature_environments
            .feature_has_environment("production", "checkout")
            .await
            .unwrap());
        assert!(!stores
            .feature_environments
            .is_environment_enabled("checkout", "production")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn adding_twice_reports_already_linked() {
        let (_, service) = setup().await;
        let err = service
            .add_environment_to_project("default", "web")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentServiceError::AlreadyLinked { .. }));
        assert_eq!(err.to_string(), "web already has the environment default enabled");
    }

    #[tokio::test]
    async fn adding_unknown_environment_is_not_found() {
        let (_, service) = setup().await;
        let err = service
            .add_environment_to_project("staging", "web")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn last_environment_cannot_be_removed() {
        let (_, service) = setup().await;
        let err = service
            .remove_environment_from_project("default", "web")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentServiceError::MinimumOneEnvironment));
    }

    #[tokio::test]
    async fn removing_environment_drops_rows_and_strategies() {
        let (stores, service) = setup().await;
        service
            .add_environment_to_project("production", "web")
            .await
            .unwrap();
        stores
            .feature_strategies
            .create_strategy_feature_env(&strategy("checkout", "production"))
            .await
            .unwrap();

        service
            .remove_environment_from_project("production", "web")
            .await
            .unwrap();

        assert!(!stores
            .feature_environments
            .feature_has_environment("production", "checkout")
            .await
            .unwrap());
        assert!(stores
            .feature_strategies
            .get_strategies_for_environment("production")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            stores.projects.get_environments_for_project("web").await.unwrap(),
            vec!["default"]
        );
    }

    #[tokio::test]
    async fn toggle_unknown_environment_is_not_found() {
        let (stores, service) = setup().await;
        service.toggle_environment("production", false).await.unwrap();
        assert!(!stores.environments.get("production").await.unwrap().enabled);
        assert!(matches!(
            service.toggle_environment("nope", true).await.unwrap_err(),
            EnvironmentServiceError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn default_strategy_must_be_flexible_rollout() {
        let (_, service) = setup().await;
        let err = service
            .update_default_strategy("default", "web", &CreateFeatureStrategy::named("default"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentServiceError::InvalidDefaultStrategy));

        let strategy = CreateFeatureStrategy::named(DEFAULT_STRATEGY_NAME);
        let stored = service
            .update_default_strategy("default", "web", &strategy)
            .await
            .unwrap();
        assert_eq!(stored, strategy);
    }

    #[tokio::test]
    async fn override_moves_project_links() {
        let (stores, service) = setup().await;
        service.toggle_environment("production", false).await.unwrap();

        service
            .override_enabled_projects(&["production".to_string()])
            .await
            .unwrap();

        assert!(!stores.environments.get("default").await.unwrap().enabled);
        assert!(stores.environments.get("production").await.unwrap().enabled);
        assert_eq!(
            stores.projects.get_environments_for_project("web").await.unwrap(),
            vec!["production"]
        );
        assert!(stores
            .feature_environments
            .feature_has_environment("production", "checkout")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn override_with_unknown_name_does_nothing() {
        let (stores, service) = setup().await;
        service
            .override_enabled_projects(&["production".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert!(stores.environments.get("default").await.unwrap().enabled);
        assert_eq!(
            stores.projects.get_environments_for_project("web").await.unwrap(),
            vec!["default"]
        );
    }

    #[tokio::test]
    async fn clone_copies_links_states_and_strategies() {
        let (stores, service) = setup().await;
        stores
            .feature_environments
            .set_environment_enabled_status("default", "checkout", true)
            .await
            .unwrap();
        stores
            .feature_strategies
            .create_strategy_feature_env(&strategy("checkout", "default"))
            .await
            .unwrap();

        let created = service
            .clone_environment(
                "default",
                &CloneEnvironment {
                    name: "staging".into(),
                    environment_type: "test".into(),
                    projects: None,
                    clone_strategies: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(created.sort_order, 1);
        assert!(stores
            .feature_environments
            .is_environment_enabled("checkout", "staging")
            .await
            .unwrap());
        assert_eq!(
            stores
                .feature_strategies
                .get_strategies_for_feature_env("web", "checkout", "staging")
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(stores
            .projects
            .get_environments_for_project("web")
            .await
            .unwrap()
            .contains(&"staging".to_string()));
    }

    #[tokio::test]
    async fn protected_environment_cannot_change() {
        let (stores, service) = setup().await;
        service
            .create(&CreateEnvironment {
                protected: Some(true),
                ..CreateEnvironment::new("locked", "production")
            })
            .await
            .unwrap();

        let patch = UpdateEnvironment {
            environment_type: Some("test".into()),
            ..Default::default()
        };
        assert!(matches!(
            service.update("locked", &patch).await.unwrap_err(),
            EnvironmentServiceError::Protected(_)
        ));
        assert!(matches!(
            service.update("ghost", &patch).await.unwrap_err(),
            EnvironmentServiceError::NotFound(_)
        ));
        assert!(matches!(
            service.delete("locked").await.unwrap_err(),
            EnvironmentServiceError::Protected(_)
        ));
        assert!(stores.environments.exists("locked").await.unwrap());
    }
}
