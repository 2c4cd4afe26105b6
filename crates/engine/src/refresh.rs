use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use routelens_core::{ClusterPartition, determine_clusters};
use routelens_store::{AggregateStore, ClusterStore, EventStore, StoredPartition};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Period of the safety-net timer that recomputes the partition even if
    /// nobody asks for it.
    pub refresh_period: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_period: Duration::from_secs(30 * 60),
        }
    }
}

impl RefreshConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.refresh_period.is_zero() {
            return Err(ConfigError::ZeroInterval("refresh_period"));
        }
        Ok(())
    }
}

/// Keeps the single cluster partition current at a coarse grain. The cached
/// partition carries the highest event sequence id it was computed from;
/// refreshes are skipped while that watermark still matches the event log.
pub struct ClusterController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    events: Arc<dyn EventStore>,
    aggregates: Arc<dyn AggregateStore>,
    clusters: Arc<dyn ClusterStore>,
    config: RefreshConfig,
    /// Guards the compare-and-recompute sequence so concurrent forced
    /// updates cannot interleave a partial write.
    refresh_guard: tokio::sync::Mutex<()>,
    cached: Mutex<Option<StoredPartition>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterController {
    pub fn new(
        events: Arc<dyn EventStore>,
        aggregates: Arc<dyn AggregateStore>,
        clusters: Arc<dyn ClusterStore>,
        config: RefreshConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                events,
                aggregates,
                clusters,
                config,
                refresh_guard: tokio::sync::Mutex::new(()),
                cached: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
        })
    }

    /// The current partition, computing one first if none was ever computed.
    /// Staleness between refreshes is expected; an empty partition means "no
    /// data yet", not an error.
    pub async fn clusters(&self) -> Result<Option<ClusterPartition>> {
        if let Some(stored) = lock(&self.inner.cached).clone() {
            return Ok(Some(stored.partition));
        }
        if let Some(stored) = self.inner.clusters.load_cluster_partition().await? {
            *lock(&self.inner.cached) = Some(stored.clone());
            return Ok(Some(stored.partition));
        }
        self.inner.force_update().await?;
        Ok(lock(&self.inner.cached).clone().map(|stored| stored.partition))
    }

    /// Recompute the partition when the event log has advanced past the
    /// cached watermark (or nothing was ever computed). Zero aggregates
    /// persist as an empty partition.
    pub async fn force_update(&self) -> Result<()> {
        self.inner.force_update().await
    }

    /// Arm the periodic refresh timer. A no-op when already watching.
    pub fn start_watching(&self) {
        let mut watcher = lock(&self.inner.watcher);
        if watcher.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *watcher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.refresh_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it so the first refresh
            // happens one full period after start
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = inner.force_update().await {
                    warn!(error = %err, "scheduled cluster refresh failed");
                }
            }
        }));
    }

    pub fn stop_watching(&self) {
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }
    }
}

impl Drop for ClusterController {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

impl ControllerInner {
    async fn force_update(&self) -> Result<()> {
        let _guard = self.refresh_guard.lock().await;

        if lock(&self.cached).is_none() {
            if let Some(stored) = self.clusters.load_cluster_partition().await? {
                *lock(&self.cached) = Some(stored);
            }
        }

        let watermark = self.events.highest_sequence_id().await?.unwrap_or(0);
        if let Some(stored) = lock(&self.cached).as_ref() {
            if stored.watermark == watermark {
                return Ok(());
            }
        }

        let aggregates = self.aggregates.load_all_aggregates().await?;
        let partition = determine_clusters(&aggregates)?;
        self.clusters
            .upsert_cluster_partition(&partition, watermark)
            .await?;
        debug!(
            clusters = partition.len(),
            watermark, "cluster partition refreshed"
        );
        *lock(&self.cached) = Some(StoredPartition {
            partition,
            watermark,
        });
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
