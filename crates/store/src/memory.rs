use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use routelens_core::{ClusterPartition, Event, Route, RouteAggregate};

use crate::{AggregateStore, ClusterStore, EventStore, Result, StoredPartition};

const FEED_CAPACITY: usize = 1024;

/// In-process store backing all three collaborator contracts. Appends fan
/// out over a broadcast channel; a send with no live subscriber is fine.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    feed: broadcast::Sender<Event>,
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    next_sequence_id: u64,
    aggregates: HashMap<Route, RouteAggregate>,
    partition: Option<StoredPartition>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                next_sequence_id: 1,
                ..Inner::default()
            }),
            feed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append_one(&self, route: Route, timestamp_ms: i64) -> Event {
        let event = {
            let mut inner = self.lock();
            let event = Event {
                route,
                timestamp_ms,
                sequence_id: inner.next_sequence_id,
            };
            inner.next_sequence_id += 1;
            inner.events.push(event.clone());
            event
        };
        let _ = self.feed.send(event.clone());
        event
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, route: Route, timestamp_ms: i64) -> Result<Event> {
        Ok(self.append_one(route, timestamp_ms))
    }

    async fn append_events(&self, batch: &[(Route, i64)]) -> Result<Vec<Event>> {
        Ok(batch
            .iter()
            .map(|(route, timestamp_ms)| self.append_one(route.clone(), *timestamp_ms))
            .collect())
    }

    async fn events_after(&self, route: &Route, after_sequence_id: u64) -> Result<Vec<Event>> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|event| event.route == *route && event.sequence_id > after_sequence_id)
            .cloned()
            .collect())
    }

    async fn highest_sequence_id(&self) -> Result<Option<u64>> {
        Ok(self.lock().events.iter().map(|event| event.sequence_id).max())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.feed.subscribe()
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn load_aggregate(&self, route: &Route) -> Result<Option<RouteAggregate>> {
        Ok(self.lock().aggregates.get(route).cloned())
    }

    async fn upsert_aggregate(&self, aggregate: &RouteAggregate) -> Result<()> {
        self.lock()
            .aggregates
            .insert(aggregate.route.clone(), aggregate.clone());
        Ok(())
    }

    async fn load_all_aggregates(&self) -> Result<Vec<RouteAggregate>> {
        Ok(self.lock().aggregates.values().cloned().collect())
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn load_cluster_partition(&self) -> Result<Option<StoredPartition>> {
        Ok(self.lock().partition.clone())
    }

    async fn upsert_cluster_partition(
        &self,
        partition: &ClusterPartition,
        watermark: u64,
    ) -> Result<()> {
        self.lock().partition = Some(StoredPartition {
            partition: partition.clone(),
            watermark,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_assign_monotonic_sequence_ids() {
        let store = MemoryStore::new();
        let first = store
            .append_event(Route::new("GET", "/a"), 1_000)
            .await
            .unwrap();
        let second = store
            .append_event(Route::new("POST", "/b"), 2_000)
            .await
            .unwrap();
        assert_eq!(first.sequence_id, 1);
        assert_eq!(second.sequence_id, 2);
        assert_eq!(store.highest_sequence_id().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn events_after_filters_by_route_and_sequence() {
        let store = MemoryStore::new();
        let get = Route::new("GET", "/a");
        let post = Route::new("POST", "/a");
        store
            .append_events(&[(get.clone(), 1), (post.clone(), 2), (get.clone(), 3)])
            .await
            .unwrap();

        let all = store.events_after(&get, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        let later = store.events_after(&get, 1).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].timestamp_ms, 3);
    }

    #[tokio::test]
    async fn subscribers_see_appended_events() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe();
        store
            .append_event(Route::new("GET", "/a"), 42)
            .await
            .unwrap();
        let event = feed.recv().await.unwrap();
        assert_eq!(event.route, Route::new("GET", "/a"));
        assert_eq!(event.timestamp_ms, 42);
    }

    #[tokio::test]
    async fn cluster_partition_upsert_replaces_single_row() {
        let store = MemoryStore::new();
        assert!(store.load_cluster_partition().await.unwrap().is_none());
        store
            .upsert_cluster_partition(&vec![vec![Route::new("GET", "/a")]], 7)
            .await
            .unwrap();
        store.upsert_cluster_partition(&Vec::new(), 9).await.unwrap();
        let stored = store.load_cluster_partition().await.unwrap().unwrap();
        assert!(stored.partition.is_empty());
        assert_eq!(stored.watermark, 9);
    }
}
