//! Collaborator contracts for the aggregation pipeline. The event log, the
//! aggregate table, and the cluster-partition row are external concerns; the
//! engines only consume these traits. [`MemoryStore`] is the in-process
//! reference implementation used by tests and embedders.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use routelens_core::{ClusterPartition, Event, Route, RouteAggregate};

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable during {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The single current cluster partition plus the event watermark it was
/// computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPartition {
    pub partition: ClusterPartition,
    pub watermark: u64,
}

/// Append-only request-log store. Sequence ids are assigned at ingestion,
/// monotonic and unique across all routes.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, route: Route, timestamp_ms: i64) -> Result<Event>;

    async fn append_events(&self, batch: &[(Route, i64)]) -> Result<Vec<Event>>;

    /// All events for one route with `sequence_id > after_sequence_id`.
    async fn events_after(&self, route: &Route, after_sequence_id: u64) -> Result<Vec<Event>>;

    async fn highest_sequence_id(&self) -> Result<Option<u64>>;

    /// Change feed of newly appended events. Delivery is at-least-once and
    /// per-route ordering is not guaranteed; subscribers must tolerate
    /// reordering, which aggregation does because folding is commutative.
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn load_aggregate(&self, route: &Route) -> Result<Option<RouteAggregate>>;

    /// Insert or replace, keyed by route.
    async fn upsert_aggregate(&self, aggregate: &RouteAggregate) -> Result<()>;

    async fn load_all_aggregates(&self) -> Result<Vec<RouteAggregate>>;
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn load_cluster_partition(&self) -> Result<Option<StoredPartition>>;

    /// Replace the single current partition row.
    async fn upsert_cluster_partition(
        &self,
        partition: &ClusterPartition,
        watermark: u64,
    ) -> Result<()>;
}
