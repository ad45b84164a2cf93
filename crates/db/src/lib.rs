use std::{str::FromStr, sync::Arc, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use utils::instrumentation::Instrumentation;

pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod models;
pub mod visibility;

use models::{
    environment::{EnvironmentStore, SqliteEnvironmentStore},
    feature::{FeatureToggleStore, SqliteFeatureToggleStore},
    feature_environment::{FeatureEnvironmentStore, SqliteFeatureEnvironmentStore},
    feature_strategy::{FeatureStrategyStore, SqliteFeatureStrategyStore},
    import_toggles::{ImportTogglesStore, SqliteImportTogglesStore},
    project::{ProjectStore, SqliteProjectStore},
    segment::{SegmentStore, SqliteSegmentStore},
};
use visibility::VisibilityPolicy;

#[derive(Clone)]
pub struct DBService {
    pub pool: SqlitePool,
}

impl DBService {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<DBService, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(url = %database_url, "Database ready");
        Ok(DBService { pool })
    }

    /// Private in-memory database. A single connection that never expires,
    /// otherwise each new connection would see an empty schema.
    pub async fn new_in_memory() -> Result<DBService, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }
}

/// Every store the services need, behind their traits.
#[derive(Clone)]
pub struct Stores {
    pub environments: Arc<dyn EnvironmentStore>,
    pub feature_environments: Arc<dyn FeatureEnvironmentStore>,
    pub feature_strategies: Arc<dyn FeatureStrategyStore>,
    pub import_toggles: Arc<dyn ImportTogglesStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub features: Arc<dyn FeatureToggleStore>,
    pub segments: Arc<dyn SegmentStore>,
}

impl Stores {
    pub fn sqlite(db: &DBService, instrumentation: &Instrumentation, visibility: VisibilityPolicy) -> Self {
        let pool = db.pool.clone();
        Self {
            environments: Arc::new(SqliteEnvironmentStore::new(pool.clone(), instrumentation, visibility)),
            feature_environments: Arc::new(SqliteFeatureEnvironmentStore::new(
                pool.clone(),
                instrumentation,
                visibility,
            )),
            feature_strategies: Arc::new(SqliteFeatureStrategyStore::new(pool.clone(), instrumentation, visibility)),
            import_toggles: Arc::new(SqliteImportTogglesStore::new(pool.clone(), instrumentation)),
            projects: Arc::new(SqliteProjectStore::new(pool.clone(), instrumentation, visibility)),
            features: Arc::new(SqliteFeatureToggleStore::new(pool.clone(), instrumentation)),
            segments: Arc::new(SqliteSegmentStore::new(pool, instrumentation)),
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_memory(visibility: VisibilityPolicy) -> Self {
        let memory = Arc::new(memory::MemoryStores::new(visibility));
        Self {
            environments: memory.clone(),
            feature_environments: memory.clone(),
            feature_strategies: memory.clone(),
            import_toggles: memory.clone(),
            projects: memory.clone(),
            features: memory.clone(),
            segments: memory,
        }
    }
}
