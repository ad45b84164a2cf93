use db::{
    Stores,
    error::StoreError,
    models::{
        environment::EnvironmentFilter,
        project::{CreateProject, Project},
    },
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProjectServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Project {0} already exists")]
    NameExists(String),
    #[error("Could not find environment {0}")]
    UnknownEnvironment(String),
}

#[derive(Clone)]
pub struct ProjectService {
    stores: Stores,
}

impl ProjectService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn get(&self, id: &str) -> Result<Project, ProjectServiceError> {
        Ok(self.stores.projects.get(id).await?)
    }

    /// Create a project linked to the requested environments, or to every
    /// enabled environment when none are named.
    pub async fn create_project(&self, request: &CreateProject) -> Result<Project, ProjectServiceError> {
        let environments = match &request.environments {
            Some(names) => {
                for name in names {
                    if !self.stores.environments.exists(name).await? {
                        return Err(ProjectServiceError::UnknownEnvironment(name.clone()));
                    }
                }
                names.clone()
            }
            None => self
                .stores
                .environments
                .get_all(&EnvironmentFilter {
                    enabled: Some(true),
                    ..Default::default()
                })
                .await?
                .into_iter()
                .map(|env| env.name)
                .collect(),
        };

        let project = self.stores.projects.create(request).await.map_err(|e| match e {
            StoreError::ConstraintViolation(_) => ProjectServiceError::NameExists(request.id.clone()),
            other => other.into(),
        })?;
        for environment in &environments {
            self.stores
                .feature_environments
                .connect_project(environment, &project.id, true)
                .await?;
        }
        info!(project = %project.id, ?environments, "Project created");
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{environment, stores};

    fn request(id: &str, environments: Option<Vec<String>>) -> CreateProject {
        CreateProject {
            id: id.into(),
            name: id.into(),
            description: None,
            feature_limit: None,
            environments,
        }
    }

    #[tokio::test]
    async fn links_enabled_environments_by_default() {
        let stores = stores();
        environment(&stores, "default", 1).await;
        environment(&stores, "production", 2).await;
        environment(&stores, "archive", 3).await;
        stores.environments.toggle("archive", false).await.unwrap();
        let service = ProjectService::new(stores.clone());

        service.create_project(&request("web", None)).await.unwrap();

        assert_eq!(
            stores.projects.get_environments_for_project("web").await.unwrap(),
            vec!["default", "production"]
        );
    }

    #[tokio::test]
    async fn links_only_requested_environments() {
        let stores = stores();
        environment(&stores, "default", 1).await;
        environment(&stores, "production", 2).await;
        let service = ProjectService::new(stores.clone());

        service
            .create_project(&request("web", Some(vec!["production".into()])))
            .await
            .unwrap();
        assert_eq!(
            stores.projects.get_environments_for_project("web").await.unwrap(),
            vec!["production"]
        );

        let err = service
            .create_project(&request("api", Some(vec!["ghost".into()])))
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectServiceError::UnknownEnvironment(_)));
        assert!(!stores.projects.exists("api").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_project_is_rejected() {
        let stores = stores();
        let service = ProjectService::new(stores);
        service.create_project(&request("web", None)).await.unwrap();
        assert!(matches!(
            service.create_project(&request("web", None)).await.unwrap_err(),
            ProjectServiceError::NameExists(_)
        ));
    }
}
