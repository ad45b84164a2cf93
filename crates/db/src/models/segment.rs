use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, types::Json};
use ts_rs::TS;
use utils::instrumentation::{Instrumentation, StoreTimer};
use uuid::Uuid;

use super::feature_strategy::Constraint;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub constraints: Vec<Constraint>,
    pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct SegmentRow {
    id: i64,
    name: String,
    description: Option<String>,
    constraints: Json<Vec<Constraint>>,
    created_at: DateTime<Utc>,
}

impl From<SegmentRow> for Segment {
    fn from(row: SegmentRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            constraints: row.constraints.0,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct CreateSegment {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

#[async_trait]
pub trait SegmentStore: Send + Sync {
    async fn create(&self, segment: &CreateSegment) -> StoreResult<Segment>;

    async fn get(&self, id: i64) -> StoreResult<Segment>;

    async fn delete(&self, id: i64) -> StoreResult<()>;

    async fn add_to_strategy(&self, strategy_id: Uuid, segment_id: i64) -> StoreResult<()>;

    async fn get_by_strategy(&self, strategy_id: Uuid) -> StoreResult<Vec<Segment>>;
}

#[derive(Debug, Clone)]
pub struct SqliteSegmentStore {
    pool: SqlitePool,
    timer: StoreTimer,
}

impl SqliteSegmentStore {
    pub fn new(pool: SqlitePool, instrumentation: &Instrumentation) -> Self {
        Self {
            pool,
            timer: instrumentation.for_store("segment"),
        }
    }
}

#[async_trait]
impl SegmentStore for SqliteSegmentStore {
    async fn create(&self, segment: &CreateSegment) -> StoreResult<Segment> {
        let _timer = self.timer.time("create");
        let row = sqlx::query_as::<_, SegmentRow>(
            r#"INSERT INTO segments (name, description, constraints) VALUES ($1, $2, $3)
               RETURNING id, name, description, constraints, created_at"#,
        )
        .bind(&segment.name)
        .bind(&segment.description)
        .bind(Json(&segment.constraints))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, format!("segment {} already exists", segment.name)))?;
        Ok(row.into())
    }

    async fn get(&self, id: i64) -> StoreResult<Segment> {
        sqlx::query_as::<_, SegmentRow>(
            "SELECT id, name, description, constraints, created_at FROM segments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Segment::from)
        .ok_or_else(|| StoreError::NotFound(format!("No segment with id {id}")))
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM segments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_to_strategy(&self, strategy_id: Uuid, segment_id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO feature_strategy_segment (feature_strategy_id, segment_id) VALUES ($1, $2)
               ON CONFLICT(feature_strategy_id, segment_id) DO NOTHING"#,
        )
        .bind(strategy_id)
        .bind(segment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_strategy(&self, strategy_id: Uuid) -> StoreResult<Vec<Segment>> {
        let rows = sqlx::query_as::<_, SegmentRow>(
            r#"SELECT s.id AS id, s.name AS name, s.description AS description,
                      s.constraints AS constraints, s.created_at AS created_at
               FROM segments s
               INNER JOIN feature_strategy_segment fss ON fss.segment_id = s.id
               WHERE fss.feature_strategy_id = $1
               ORDER BY s.id ASC"#,
        )
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Segment::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::feature_strategy::{FeatureStrategyStore, NewFeatureStrategy, SqliteFeatureStrategyStore},
        test_support::{seed_environment, seed_feature, seed_project, test_db},
        visibility::VisibilityPolicy,
    };

    #[tokio::test]
    async fn attach_and_list_segments() {
        let db = test_db().await;
        seed_environment(&db.pool, "default", 1).await;
        seed_project(&db.pool, "web").await;
        seed_feature(&db.pool, "checkout", "web").await;
        let instrumentation = Instrumentation::default();
        let segments = SqliteSegmentStore::new(db.pool.clone(), &instrumentation);
        let strategies =
            SqliteFeatureStrategyStore::new(db.pool.clone(), &instrumentation, VisibilityPolicy::Unrestricted);

        let beta = segments
            .create(&CreateSegment {
                name: "beta".into(),
                description: None,
                constraints: vec![Constraint::in_list("email", &["a@example.com"])],
            })
            .await
            .unwrap();
        let strategy = strategies
            .create_strategy_feature_env(&NewFeatureStrategy {
                feature_name: "checkout".into(),
                project_id: "web".into(),
                environment: "default".into(),
                strategy_name: "default".into(),
                parameters: Default::default(),
                constraints: Vec::new(),
                variants: Vec::new(),
                sort_order: None,
                title: None,
                disabled: false,
            })
            .await
            .unwrap();

        segments.add_to_strategy(strategy.id, beta.id).await.unwrap();
        segments.add_to_strategy(strategy.id, beta.id).await.unwrap();

        let attached = segments.get_by_strategy(strategy.id).await.unwrap();
        assert_eq!(attached, vec![beta.clone()]);

        segments.delete(beta.id).await.unwrap();
        assert!(segments.get(beta.id).await.unwrap_err().is_not_found());
        assert!(segments.get_by_strategy(strategy.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let db = test_db().await;
        let segments = SqliteSegmentStore::new(db.pool.clone(), &Instrumentation::default());
        let request = CreateSegment {
            name: "beta".into(),
            description: None,
            constraints: Vec::new(),
        };
        segments.create(&request).await.unwrap();
        assert!(matches!(
            segments.create(&request).await.unwrap_err(),
            StoreError::ConstraintViolation(_)
        ));
    }
}
