use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use utils::instrumentation::{Instrumentation, StoreTimer};

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FeatureType {
    #[default]
    Release,
    Experiment,
    Operational,
    KillSwitch,
    Permission,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub name: String,
    pub description: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub feature_type: String,
    pub project: String,
    pub stale: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Feature {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct CreateFeature {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub feature_type: FeatureType,
}

impl CreateFeature {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            feature_type: FeatureType::default(),
        }
    }
}

const FEATURE_COLUMNS: &str = "name, description, type, project, stale, archived_at, created_at";

#[async_trait]
pub trait FeatureToggleStore: Send + Sync {
    async fn create(&self, project_id: &str, feature: &CreateFeature) -> StoreResult<Feature>;

    async fn get(&self, name: &str) -> StoreResult<Feature>;

    async fn exists(&self, name: &str) -> StoreResult<bool>;

    async fn archive(&self, name: &str) -> StoreResult<Feature>;

    async fn delete(&self, name: &str) -> StoreResult<()>;

    async fn get_all_by_project(&self, project_id: &str, archived: bool) -> StoreResult<Vec<Feature>>;
}

#[derive(Debug, Clone)]
pub struct SqliteFeatureToggleStore {
    pool: SqlitePool,
    timer: StoreTimer,
}

impl SqliteFeatureToggleStore {
    pub fn new(pool: SqlitePool, instrumentation: &Instrumentation) -> Self {
        Self {
            pool,
            timer: instrumentation.for_store("feature-toggle"),
        }
    }
}

#[async_trait]
impl FeatureToggleStore for SqliteFeatureToggleStore {
    async fn create(&self, project_id: &str, feature: &CreateFeature) -> StoreResult<Feature> {
        let _timer = self.timer.time("create");
        sqlx::query_as::<_, Feature>(&format!(
            "INSERT INTO features (name, description, type, project) VALUES ($1, $2, $3, $4) \
             RETURNING {FEATURE_COLUMNS}"
        ))
        .bind(&feature.name)
        .bind(&feature.description)
        .bind(feature.feature_type.to_string())
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("A feature named {} already exists", feature.name)))
    }

    async fn get(&self, name: &str) -> StoreResult<Feature> {
        sqlx::query_as::<_, Feature>(&format!("SELECT {FEATURE_COLUMNS} FROM features WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("No feature toggle named {name}")))
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        let present: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM features WHERE name = $1)")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(present)
    }

    async fn archive(&self, name: &str) -> StoreResult<Feature> {
        sqlx::query_as::<_, Feature>(&format!(
            "UPDATE features SET archived_at = datetime('now', 'subsec') WHERE name = $1 \
             RETURNING {FEATURE_COLUMNS}"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("No feature toggle named {name}")))
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM features WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_all_by_project(&self, project_id: &str, archived: bool) -> StoreResult<Vec<Feature>> {
        let features = sqlx::query_as::<_, Feature>(&format!(
            "SELECT {FEATURE_COLUMNS} FROM features \
             WHERE project = $1 AND (archived_at IS NOT NULL) = $2 ORDER BY name ASC"
        ))
        .bind(project_id)
        .bind(archived)
        .fetch_all(&self.pool)
        .await?;
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{link_feature_environment, seed_environment, seed_project, test_db};

    fn store(pool: &SqlitePool) -> SqliteFeatureToggleStore {
        SqliteFeatureToggleStore::new(pool.clone(), &Instrumentation::default())
    }

    #[tokio::test]
    async fn create_archive_and_list() {
        let db = test_db().await;
        seed_project(&db.pool, "web").await;
        let store = store(&db.pool);

        let created = store
            .create(
                "web",
                &CreateFeature {
                    feature_type: FeatureType::KillSwitch,
                    ..CreateFeature::named("checkout")
                },
            )
            .await
            .unwrap();
        assert_eq!(created.feature_type, "kill-switch");
        assert!(!created.is_archived());
        store.create("web", &CreateFeature::named("banner")).await.unwrap();

        let err = store.create("web", &CreateFeature::named("banner")).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        assert!(store.archive("checkout").await.unwrap().is_archived());
        let active: Vec<String> = store
            .get_all_by_project("web", false)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(active, vec!["banner"]);
        assert_eq!(store.get_all_by_project("web", true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_cascades_to_environment_rows() {
        let db = test_db().await;
        seed_project(&db.pool, "web").await;
        seed_environment(&db.pool, "default", 1).await;
        let store = store(&db.pool);
        store.create("web", &CreateFeature::named("checkout")).await.unwrap();
        link_feature_environment(&db.pool, "checkout", "default", true).await;

        store.delete("checkout").await.unwrap();

        assert!(!store.exists("checkout").await.unwrap());
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feature_environments")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
