//! Bulk import of feature toggles into one project environment.

use std::collections::{BTreeSet, HashMap};

use db::{
    Stores,
    error::StoreError,
    models::{
        feature::{CreateFeature, FeatureType},
        feature_strategy::CreateFeatureStrategy,
        import_toggles::{FeatureLink, FeatureTag},
        variant::Variant,
    },
};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use tracing::info;
use ts_rs::TS;

use super::feature_toggle::{FeatureToggleError, FeatureToggleService};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    FeatureToggle(#[from] FeatureToggleError),
    #[error("Could not find project {0}")]
    ProjectNotFound(String),
    #[error("Import validation failed")]
    Invalid(ImportValidation),
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImportFeature {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub feature_type: FeatureType,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImportFeatureEnvironment {
    pub feature_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImportStrategy {
    pub feature_name: String,
    #[serde(flatten)]
    pub strategy: CreateFeatureStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImportData {
    pub features: Vec<ImportFeature>,
    #[serde(default)]
    pub feature_environments: Vec<ImportFeatureEnvironment>,
    #[serde(default)]
    pub feature_strategies: Vec<ImportStrategy>,
    #[serde(default)]
    pub feature_tags: Vec<FeatureTag>,
    #[serde(default)]
    pub links: Vec<FeatureLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub project: String,
    pub environment: String,
    pub data: ImportData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImportMessage {
    pub message: String,
    pub affected_items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct ImportValidation {
    pub errors: Vec<ImportMessage>,
    pub warnings: Vec<ImportMessage>,
}

impl ImportValidation {
    fn error(&mut self, message: impl Into<String>, affected_items: Vec<String>) {
        if !affected_items.is_empty() {
            self.errors.push(ImportMessage {
                message: message.into(),
                affected_items,
            });
        }
    }

    fn warning(&mut self, message: impl Into<String>, affected_items: Vec<String>) {
        if !affected_items.is_empty() {
            self.warnings.push(ImportMessage {
                message: message.into(),
                affected_items,
            });
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub skipped_archived: Vec<String>,
}

fn find_duplicates(names: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            duplicates.insert(name.clone());
        }
    }
    duplicates.into_iter().collect()
}

#[derive(Clone)]
pub struct ImportService {
    stores: Stores,
    features: FeatureToggleService,
}

impl ImportService {
    pub fn new(stores: Stores) -> Self {
        Self {
            features: FeatureToggleService::new(stores.clone()),
            stores,
        }
    }

    pub async fn validate(&self, request: &ImportRequest) -> Result<ImportValidation, ImportError> {
        if !self.stores.projects.exists(&request.project).await? {
            return Err(ImportError::ProjectNotFound(request.project.clone()));
        }
        let names: Vec<String> = request.data.features.iter().map(|f| f.name.clone()).collect();
        let unique: Vec<String> = names.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let import = &self.stores.import_toggles;
        let mut validation = ImportValidation::default();

        let linked = self
            .stores
            .projects
            .get_environments_for_project(&request.project)
            .await?;
        if !linked.contains(&request.environment) {
            validation.error(
                format!(
                    "The environment is not enabled for project {}.",
                    request.project
                ),
                vec![request.environment.clone()],
            );
        }

        validation.error(
            "We detected the following features are duplicate in your import data:",
            find_duplicates(&names),
        );

        let other_projects = import
            .get_features_in_other_projects(&unique, &request.project)
            .await?
            .into_iter()
            .map(|f| format!("{} (in project {})", f.name, f.project))
            .collect();
        validation.error(
            format!(
                "You cannot import a features that already exist in other projects. You already have the following features defined outside of project {}:",
                request.project
            ),
            other_projects,
        );

        let limit = import
            .get_project_features_limit(&unique, &request.project)
            .await?;
        if limit.is_exceeded() {
            validation.error(
                format!(
                    "We detected you want to create {} new features to a project that already has {} existing features, exceeding the maximum limit of {}.",
                    limit.new_features_count,
                    limit.current_features_count,
                    limit.limit.unwrap_or_default()
                ),
                vec![request.project.clone()],
            );
        }

        validation.warning(
            "The following features will not be imported as they are currently archived. To import them, please unarchive them first:",
            import.get_archived_features(&unique).await?,
        );

        let existing = import
            .get_features_in_project(&unique, &request.project)
            .await?;
        if import
            .strategies_exist_for_features(&existing, &request.environment)
            .await?
        {
            validation.warning(
                "There are features that already exist in this project. The following features will be overwritten:",
                existing,
            );
        }

        Ok(validation)
    }

    /// Validate, then write every part of `request` into its project and
    /// environment. Strategies, tags and links of imported features are
    /// replaced, not merged.
    pub async fn import(&self, request: &ImportRequest) -> Result<ImportSummary, ImportError> {
        let validation = self.validate(request).await?;
        if !validation.is_valid() {
            return Err(ImportError::Invalid(validation));
        }

        let import = &self.stores.import_toggles;
        let project = request.project.as_str();
        let environment = request.environment.as_str();
        let requested: Vec<String> = request.data.features.iter().map(|f| f.name.clone()).collect();
        let archived: BTreeSet<String> = import
            .get_archived_features(&requested)
            .await?
            .into_iter()
            .collect();
        let included = |name: &str| !archived.contains(name);
        let names: Vec<String> = requested.iter().filter(|n| included(n)).cloned().collect();
        let existing: BTreeSet<String> = import
            .get_features_in_project(&names, project)
            .await?
            .into_iter()
            .collect();

        let mut summary = ImportSummary {
            skipped_archived: archived.iter().cloned().collect(),
            ..Default::default()
        };
        for feature in request.data.features.iter().filter(|f| included(&f.name)) {
            if existing.contains(&feature.name) {
                summary.updated.push(feature.name.clone());
                continue;
            }
            self.features
                .create_feature(
                    project,
                    &CreateFeature {
                        name: feature.name.clone(),
                        description: feature.description.clone(),
                        feature_type: feature.feature_type,
                    },
                    &HashMap::new(),
                )
                .await?;
            summary.created.push(feature.name.clone());
        }

        for fe in request
            .data
            .feature_environments
            .iter()
            .filter(|fe| included(&fe.feature_name) && !fe.variants.is_empty())
        {
            self.features
                .set_variants(project, &fe.feature_name, &[environment.to_string()], &fe.variants)
                .await?;
        }

        import.delete_tags_for_features(&names).await?;
        let tags: Vec<FeatureTag> = request
            .data
            .feature_tags
            .iter()
            .filter(|t| included(&t.feature_name))
            .cloned()
            .collect();
        import.add_tags(&tags).await?;

        let links: Vec<FeatureLink> = request
            .data
            .links
            .iter()
            .filter(|l| included(&l.feature_name))
            .cloned()
            .collect();
        let linked_features: Vec<String> = links
            .iter()
            .map(|l| l.feature_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        import.delete_links_for_features(&linked_features).await?;
        import.add_links(&links).await?;

        import.delete_strategies_for_features(&names, environment).await?;
        for entry in request
            .data
            .feature_strategies
            .iter()
            .filter(|s| included(&s.feature_name))
        {
            self.features
                .create_strategy(project, &entry.feature_name, environment, &entry.strategy)
                .await?;
        }
        for fe in request
            .data
            .feature_environments
            .iter()
            .filter(|fe| included(&fe.feature_name))
        {
            self.features
                .update_enabled(project, &fe.feature_name, environment, fe.enabled)
                .await?;
        }

        info!(
            project,
            environment,
            created = summary.created.len(),
            updated = summary.updated.len(),
            "Features imported"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use db::models::project::CreateProject;

    use super::*;
    use crate::services::test_support::{environment, feature, project, stores};

    fn feature_entry(name: &str) -> ImportFeature {
        ImportFeature {
            name: name.into(),
            description: None,
            feature_type: FeatureType::Release,
        }
    }

    fn request(features: &[&str]) -> ImportRequest {
        ImportRequest {
            project: "web".into(),
            environment: "default".into(),
            data: ImportData {
                features: features.iter().map(|n| feature_entry(n)).collect(),
                ..Default::default()
            },
        }
    }

    async fn setup() -> (Stores, ImportService) {
        let stores = stores();
        environment(&stores, "default", 1).await;
        project(&stores, "web", &["default"]).await;
        (stores.clone(), ImportService::new(stores))
    }

    #[tokio::test]
    async fn duplicates_and_foreign_features_are_errors() {
        let (stores, service) = setup().await;
        project(&stores, "api", &["default"]).await;
        feature(&stores, "api", "owned").await;

        let validation = service
            .validate(&request(&["new", "new", "owned"]))
            .await
            .unwrap();

        assert_eq!(validation.errors.len(), 2);
        assert_eq!(validation.errors[0].affected_items, vec!["new"]);
        assert_eq!(validation.errors[1].affected_items, vec!["owned (in project api)"]);
        assert!(matches!(
            service.import(&request(&["new", "new"])).await.unwrap_err(),
            ImportError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn feature_limit_is_enforced() {
        let stores = stores();
        environment(&stores, "default", 1).await;
        stores
            .projects
            .create(&CreateProject {
                id: "web".into(),
                name: "web".into(),
                description: None,
                feature_limit: Some(1),
                environments: None,
            })
            .await
            .unwrap();
        stores
            .feature_environments
            .connect_project("default", "web", false)
            .await
            .unwrap();
        feature(&stores, "web", "existing").await;
        feature(&stores, "web", "old").await;
        stores.features.archive("old").await.unwrap();
        let service = ImportService::new(stores);

        let validation = service.validate(&request(&["existing"])).await.unwrap();
        assert!(validation.is_valid());

        let validation = service.validate(&request(&["old"])).await.unwrap();
        assert!(validation.is_valid());
        assert_eq!(validation.warnings[0].affected_items, vec!["old"]);

        let validation = service.validate(&request(&["fresh"])).await.unwrap();
        assert_eq!(validation.errors.len(), 1);
        assert_eq!(validation.errors[0].affected_items, vec!["web"]);
    }

    #[tokio::test]
    async fn import_creates_features_with_state() {
        let (stores, service) = setup().await;
        let mut req = request(&["checkout"]);
        req.data.feature_environments = vec![ImportFeatureEnvironment {
            feature_name: "checkout".into(),
            enabled: true,
            variants: vec![Variant::new("b", 500), Variant::new("a", 500)],
        }];
        req.data.feature_strategies = vec![ImportStrategy {
            feature_name: "checkout".into(),
            strategy: CreateFeatureStrategy::named("default"),
        }];
        req.data.feature_tags = vec![FeatureTag {
            feature_name: "checkout".into(),
            tag_type: "simple".into(),
            tag_value: "payments".into(),
        }];

        let summary = service.import(&req).await.unwrap();
        assert_eq!(summary.created, vec!["checkout"]);

        let feature = stores
            .feature_strategies
            .get_feature_toggle_with_envs("checkout", false)
            .await
            .unwrap();
        let env = &feature.environments[0];
        assert!(env.enabled);
        assert_eq!(env.strategies.len(), 1);
        assert_eq!(env.strategies[0].strategy_name, "default");
        assert_eq!(env.variants[0].name, "a");
    }

    #[tokio::test]
    async fn reimport_replaces_strategies() {
        let (stores, service) = setup().await;
        let mut req = request(&["checkout"]);
        req.data.feature_strategies = vec![
            ImportStrategy {
                feature_name: "checkout".into(),
                strategy: CreateFeatureStrategy::named("default"),
            },
            ImportStrategy {
                feature_name: "checkout".into(),
                strategy: CreateFeatureStrategy::named("userWithId"),
            },
        ];
        service.import(&req).await.unwrap();

        let validation = service.validate(&req).await.unwrap();
        assert_eq!(validation.warnings.len(), 1);
        assert_eq!(validation.warnings[0].affected_items, vec!["checkout"]);

        req.data.feature_strategies.truncate(1);
        let summary = service.import(&req).await.unwrap();
        assert_eq!(summary.updated, vec!["checkout"]);
        assert_eq!(
            stores
                .feature_strategies
                .get_strategies_for_feature_env("web", "checkout", "default")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn archived_features_are_skipped() {
        let (stores, service) = setup().await;
        feature(&stores, "web", "old").await;
        stores.features.archive("old").await.unwrap();
        let mut req = request(&["old"]);
        req.data.feature_strategies = vec![ImportStrategy {
            feature_name: "old".into(),
            strategy: CreateFeatureStrategy::named("default"),
        }];

        let validation = service.validate(&req).await.unwrap();
        assert!(validation.is_valid());
        assert_eq!(validation.warnings[0].affected_items, vec!["old"]);

        let summary = service.import(&req).await.unwrap();
        assert_eq!(summary.skipped_archived, vec!["old"]);
        assert!(stores
            .feature_strategies
            .get_strategies_for_environment("default")
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn duplicates_are_reported_once() {
        let names: Vec<String> = ["a", "b", "a", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(find_duplicates(&names), vec!["a"]);
    }
}
