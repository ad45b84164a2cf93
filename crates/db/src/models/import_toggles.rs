use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use ts_rs::TS;
use utils::instrumentation::{Instrumentation, StoreTimer};
use uuid::Uuid;

use crate::error::StoreResult;

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, TS)]
pub struct FeatureNameProject {
    pub name: String,
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFeaturesLimit {
    pub limit: Option<i64>,
    pub current_features_count: i64,
    pub new_features_count: i64,
}

impl ProjectFeaturesLimit {
    pub fn is_exceeded(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.current_features_count + self.new_features_count > limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureTag {
    pub feature_name: String,
    pub tag_type: String,
    pub tag_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct FeatureLink {
    pub feature_name: String,
    pub url: String,
    pub title: Option<String>,
}

/// Bulk checks and cleanup used while importing feature definitions.
#[async_trait]
pub trait ImportTogglesStore: Send + Sync {
    async fn get_archived_features(&self, names: &[String]) -> StoreResult<Vec<String>>;

    async fn get_existing_features(&self, names: &[String]) -> StoreResult<Vec<String>>;

    async fn get_features_in_other_projects(
        &self,
        names: &[String],
        project_id: &str,
    ) -> StoreResult<Vec<FeatureNameProject>>;

    async fn get_features_in_project(&self, names: &[String], project_id: &str) -> StoreResult<Vec<String>>;

    /// `true` for an empty name list.
    async fn strategies_exist_for_features(&self, names: &[String], environment: &str) -> StoreResult<bool>;

    async fn delete_strategies_for_features(&self, names: &[String], environment: &str) -> StoreResult<()>;

    async fn delete_tags_for_features(&self, names: &[String]) -> StoreResult<()>;

    async fn delete_links_for_features(&self, names: &[String]) -> StoreResult<()>;

    async fn get_project_features_limit(
        &self,
        names: &[String],
        project_id: &str,
    ) -> StoreResult<ProjectFeaturesLimit>;

    async fn add_tags(&self, tags: &[FeatureTag]) -> StoreResult<()>;

    async fn add_links(&self, links: &[FeatureLink]) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteImportTogglesStore {
    pool: SqlitePool,
    timer: StoreTimer,
}

impl SqliteImportTogglesStore {
    pub fn new(pool: SqlitePool, instrumentation: &Instrumentation) -> Self {
        Self {
            pool,
            timer: instrumentation.for_store("import-toggles"),
        }
    }

    async fn select_names(&self, prefix: &str, names: &[String], suffix: Option<(&str, &str)>) -> StoreResult<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(prefix);
        push_names(&mut query, names);
        if let Some((clause, value)) = suffix {
            query.push(clause).push_bind(value.to_string());
        }
        query.push(" ORDER BY name ASC");
        let found: Vec<String> = query.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(found)
    }

    async fn delete_by_names(&self, prefix: &str, names: &[String], suffix: Option<(&str, &str)>) -> StoreResult<u64> {
        if names.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Sqlite>::new(prefix);
        push_names(&mut query, names);
        if let Some((clause, value)) = suffix {
            query.push(clause).push_bind(value.to_string());
        }
        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn push_names<'args>(query: &mut QueryBuilder<'args, Sqlite>, names: &[String]) {
    query.push("(");
    let mut separated = query.separated(", ");
    for name in names {
        separated.push_bind(name.clone());
    }
    query.push(")");
}

#[async_trait]
impl ImportTogglesStore for SqliteImportTogglesStore {
    async fn get_archived_features(&self, names: &[String]) -> StoreResult<Vec<String>> {
        self.select_names(
            "SELECT name FROM features WHERE archived_at IS NOT NULL AND name IN ",
            names,
            None,
        )
        .await
    }

    async fn get_existing_features(&self, names: &[String]) -> StoreResult<Vec<String>> {
        self.select_names("SELECT name FROM features WHERE name IN ", names, None)
            .await
    }

    async fn get_features_in_other_projects(
        &self,
        names: &[String],
        project_id: &str,
    ) -> StoreResult<Vec<FeatureNameProject>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new("SELECT name, project FROM features WHERE name IN ");
        push_names(&mut query, names);
        query
            .push(" AND project <> ")
            .push_bind(project_id.to_string())
            .push(" ORDER BY name ASC");
        let rows = query
            .build_query_as::<FeatureNameProject>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn get_features_in_project(&self, names: &[String], project_id: &str) -> StoreResult<Vec<String>> {
        self.select_names(
            "SELECT name FROM features WHERE name IN ",
            names,
            Some((" AND project = ", project_id)),
        )
        .await
    }

    async fn strategies_exist_for_features(&self, names: &[String], environment: &str) -> StoreResult<bool> {
        if names.is_empty() {
            return Ok(true);
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT EXISTS (SELECT 1 FROM feature_strategies WHERE feature_name IN ",
        );
        push_names(&mut query, names);
        query
            .push(" AND environment = ")
            .push_bind(environment.to_string())
            .push(")");
        let present: bool = query.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(present)
    }

    async fn delete_strategies_for_features(&self, names: &[String], environment: &str) -> StoreResult<()> {
        let _timer = self.timer.time("deleteStrategiesForFeatures");
        let deleted = self
            .delete_by_names(
                "DELETE FROM feature_strategies WHERE feature_name IN ",
                names,
                Some((" AND environment = ", environment)),
            )
            .await?;
        tracing::debug!(environment = %environment, deleted, "Deleted strategies before import");
        Ok(())
    }

    async fn delete_tags_for_features(&self, names: &[String]) -> StoreResult<()> {
        self.delete_by_names("DELETE FROM feature_tag WHERE feature_name IN ", names, None)
            .await?;
        Ok(())
    }

    async fn delete_links_for_features(&self, names: &[String]) -> StoreResult<()> {
        self.delete_by_names("DELETE FROM feature_link WHERE feature_name IN ", names, None)
            .await?;
        Ok(())
    }

    async fn get_project_features_limit(
        &self,
        names: &[String],
        project_id: &str,
    ) -> StoreResult<ProjectFeaturesLimit> {
        let _timer = self.timer.time("getProjectFeaturesLimit");
        let limit: Option<Option<i64>> = sqlx::query_scalar("SELECT feature_limit FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        let current_features_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM features WHERE project = $1 AND archived_at IS NULL")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;

        let already_in_project = if names.is_empty() {
            0
        } else {
            // archived names are skipped on import, so they never count as new
            let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM features WHERE project = ");
            query.push_bind(project_id.to_string()).push(" AND name IN ");
            push_names(&mut query, names);
            let count: i64 = query.build_query_scalar().fetch_one(&self.pool).await?;
            count
        };

        Ok(ProjectFeaturesLimit {
            limit: limit.flatten(),
            current_features_count,
            new_features_count: names.len() as i64 - already_in_project,
        })
    }

    async fn add_tags(&self, tags: &[FeatureTag]) -> StoreResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut query = QueryBuilder::<Sqlite>::new("INSERT INTO feature_tag (feature_name, tag_type, tag_value) ");
        query.push_values(tags, |mut row, tag| {
            row.push_bind(tag.feature_name.clone())
                .push_bind(tag.tag_type.clone())
                .push_bind(tag.tag_value.clone());
        });
        query.push(" ON CONFLICT(feature_name, tag_type, tag_value) DO NOTHING");
        query.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn add_links(&self, links: &[FeatureLink]) -> StoreResult<()> {
        if links.is_empty() {
            return Ok(());
        }
        let mut query = QueryBuilder::<Sqlite>::new("INSERT INTO feature_link (id, feature_name, url, title) ");
        query.push_values(links, |mut row, link| {
            row.push_bind(Uuid::new_v4())
                .push_bind(link.feature_name.clone())
                .push_bind(link.url.clone())
                .push_bind(link.title.clone());
        });
        query.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_environment, seed_feature, seed_project, test_db};

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn seeded() -> (crate::DBService, SqliteImportTogglesStore) {
        let db = test_db().await;
        seed_environment(&db.pool, "default", 1).await;
        seed_project(&db.pool, "web").await;
        seed_project(&db.pool, "api").await;
        seed_feature(&db.pool, "checkout", "web").await;
        seed_feature(&db.pool, "old", "web").await;
        seed_feature(&db.pool, "login", "api").await;
        sqlx::query("UPDATE features SET archived_at = datetime('now', 'subsec') WHERE name = 'old'")
            .execute(&db.pool)
            .await
            .unwrap();
        let store = SqliteImportTogglesStore::new(db.pool.clone(), &Instrumentation::default());
        (db, store)
    }

    #[tokio::test]
    async fn existence_checks() {
        let (_db, store) = seeded().await;
        let incoming = names(&["checkout", "old", "login", "fresh"]);

        assert_eq!(store.get_archived_features(&incoming).await.unwrap(), names(&["old"]));
        assert_eq!(
            store.get_existing_features(&incoming).await.unwrap(),
            names(&["checkout", "login", "old"])
        );
        assert_eq!(
            store.get_features_in_other_projects(&incoming, "web").await.unwrap(),
            vec![FeatureNameProject {
                name: "login".into(),
                project: "api".into()
            }]
        );
        assert_eq!(
            store.get_features_in_project(&incoming, "web").await.unwrap(),
            names(&["checkout", "old"])
        );
        assert!(store.get_existing_features(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn strategy_existence_is_vacuously_true() {
        let (db, store) = seeded().await;
        assert!(store.strategies_exist_for_features(&[], "default").await.unwrap());
        assert!(!store
            .strategies_exist_for_features(&names(&["checkout"]), "default")
            .await
            .unwrap());

        sqlx::query(
            "INSERT INTO feature_strategies (id, feature_name, project_name, environment, strategy_name) \
             VALUES ($1, 'checkout', 'web', 'default', 'default')",
        )
        .bind(Uuid::new_v4())
        .execute(&db.pool)
        .await
        .unwrap();
        assert!(store
            .strategies_exist_for_features(&names(&["checkout"]), "default")
            .await
            .unwrap());

        store
            .delete_strategies_for_features(&names(&["checkout"]), "default")
            .await
            .unwrap();
        assert!(!store
            .strategies_exist_for_features(&names(&["checkout"]), "default")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn tags_and_links_are_replaced() {
        let (db, store) = seeded().await;
        let tag = FeatureTag {
            feature_name: "checkout".into(),
            tag_type: "simple".into(),
            tag_value: "payments".into(),
        };
        store.add_tags(&[tag.clone(), tag]).await.unwrap();
        store
            .add_links(&[FeatureLink {
                feature_name: "checkout".into(),
                url: "https://example.com/ticket".into(),
                title: None,
            }])
            .await
            .unwrap();

        let count = |table: &'static str| {
            let pool = db.pool.clone();
            async move {
                let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                    .fetch_one(&pool)
                    .await
                    .unwrap();
                count
            }
        };
        assert_eq!(count("feature_tag").await, 1);
        assert_eq!(count("feature_link").await, 1);

        store.delete_tags_for_features(&names(&["checkout"])).await.unwrap();
        store.delete_links_for_features(&names(&["checkout"])).await.unwrap();
        assert_eq!(count("feature_tag").await, 0);
        assert_eq!(count("feature_link").await, 0);
    }

    #[tokio::test]
    async fn feature_limit_counts_only_new_names() {
        let (db, store) = seeded().await;
        sqlx::query("UPDATE projects SET feature_limit = 2 WHERE id = 'web'")
            .execute(&db.pool)
            .await
            .unwrap();

        let limit = store
            .get_project_features_limit(&names(&["checkout", "fresh", "another"]), "web")
            .await
            .unwrap();
        assert_eq!(
            limit,
            ProjectFeaturesLimit {
                limit: Some(2),
                current_features_count: 1,
                new_features_count: 2,
            }
        );
        assert!(limit.is_exceeded());

        let unlimited = store
            .get_project_features_limit(&names(&["fresh"]), "api")
            .await
            .unwrap();
        assert_eq!(unlimited.limit, None);
        assert!(!unlimited.is_exceeded());
    }

    #[tokio::test]
    async fn archived_names_are_not_new_features() {
        let (db, store) = seeded().await;
        sqlx::query("UPDATE projects SET feature_limit = 1 WHERE id = 'web'")
            .execute(&db.pool)
            .await
            .unwrap();

        let limit = store.get_project_features_limit(&names(&["old"]), "web").await.unwrap();
        assert_eq!(limit.current_features_count, 1);
        assert_eq!(limit.new_features_count, 0);
        assert!(!limit.is_exceeded());
    }
}
