use db::{
    Stores,
    error::StoreError,
    models::{
        feature_strategy::FeatureStrategy,
        segment::{CreateSegment, Segment},
    },
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SegmentServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Segment {id} is still used by {strategies} strategies")]
    InUse { id: i64, strategies: usize },
}

#[derive(Clone)]
pub struct SegmentService {
    stores: Stores,
}

impl SegmentService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn create(&self, request: &CreateSegment) -> Result<Segment, SegmentServiceError> {
        let segment = self.stores.segments.create(request).await?;
        info!(segment = segment.id, name = %segment.name, "Segment created");
        Ok(segment)
    }

    pub async fn get(&self, id: i64) -> Result<Segment, SegmentServiceError> {
        Ok(self.stores.segments.get(id).await?)
    }

    pub async fn strategies_using(&self, id: i64) -> Result<Vec<FeatureStrategy>, SegmentServiceError> {
        Ok(self.stores.feature_strategies.get_strategies_by_segment(id).await?)
    }

    pub async fn delete(&self, id: i64) -> Result<(), SegmentServiceError> {
        self.stores.segments.get(id).await?;
        let strategies = self.strategies_using(id).await?;
        if !strategies.is_empty() {
            return Err(SegmentServiceError::InUse {
                id,
                strategies: strategies.len(),
            });
        }
        self.stores.segments.delete(id).await?;
        info!(segment = id, "Segment deleted");
        Ok(())
    }
}
