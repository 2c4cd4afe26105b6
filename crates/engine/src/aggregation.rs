use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use routelens_core::{
    BucketClock, DEFAULT_DAILY_DIVISIONS, EventBatch, MINUTES_PER_DAY, Route, RouteAggregate,
};
use routelens_store::{AggregateStore, EventStore};

use crate::error::{ConfigError, EngineError, Result};

#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Events observed for a route before its recompute fires immediately.
    pub min_changes_to_update: u64,
    /// Debounce window: a route with fewer pending events than the threshold
    /// is recomputed this long after its first unflushed event.
    pub forced_update_timeout: Duration,
    /// Number of time-of-day slots per day; must divide a day evenly.
    pub daily_divisions: u32,
    pub clock: BucketClock,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_changes_to_update: 100,
            forced_update_timeout: Duration::from_secs(5 * 60),
            daily_divisions: DEFAULT_DAILY_DIVISIONS,
            clock: BucketClock::default(),
        }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.daily_divisions == 0 || MINUTES_PER_DAY % self.daily_divisions != 0 {
            return Err(ConfigError::InvalidDailyDivisions(self.daily_divisions));
        }
        if self.min_changes_to_update == 0 {
            return Err(ConfigError::ZeroInterval("min_changes_to_update"));
        }
        if self.forced_update_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("forced_update_timeout"));
        }
        Ok(())
    }

    pub fn granularity_minutes(&self) -> u32 {
        MINUTES_PER_DAY / self.daily_divisions
    }
}

struct RouteState {
    pending: u64,
    timer: Option<JoinHandle<()>>,
    recompute_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Default for RouteState {
    fn default() -> Self {
        Self {
            pending: 0,
            timer: None,
            recompute_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Watches the event feed and keeps per-route aggregates current. Each route
/// carries its own pending counter and debounce timer; recomputes for one
/// route are serialized while distinct routes recompute in parallel.
pub struct AggregationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    events: Arc<dyn EventStore>,
    aggregates: Arc<dyn AggregateStore>,
    config: AggregationConfig,
    routes: Mutex<HashMap<Route, RouteState>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AggregationEngine {
    /// Fails fast on invalid bucket or trigger configuration.
    pub fn new(
        events: Arc<dyn EventStore>,
        aggregates: Arc<dyn AggregateStore>,
        config: AggregationConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                events,
                aggregates,
                config,
                routes: Mutex::new(HashMap::new()),
                watcher: Mutex::new(None),
            }),
        })
    }

    /// Subscribe to the event feed and start counting changes per route.
    /// A no-op when already watching.
    pub fn start_watching(&self) {
        let mut watcher = lock(&self.inner.watcher);
        if watcher.is_some() {
            return;
        }
        let mut feed = self.inner.events.subscribe();
        let inner = self.inner.clone();
        *watcher = Some(tokio::spawn(async move {
            debug!("aggregation watcher started");
            loop {
                match feed.recv().await {
                    Ok(event) => inner.clone().note_event(event.route),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event feed lagged; trigger counts may undercount");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("aggregation watcher stopped: feed closed");
        }));
    }

    /// Cancel the watcher and every armed debounce timer and clear pending
    /// counts. In-flight recomputes are left to finish; the engine can be
    /// restarted afterwards.
    pub fn stop_watching(&self) {
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }
        let mut routes = lock(&self.inner.routes);
        for state in routes.values_mut() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.pending = 0;
        }
    }

    /// The persisted aggregate for a route, forcing a recompute first when
    /// none exists yet, so callers never see "no data" while events exist.
    pub async fn aggregate_for(&self, route: &Route) -> Result<Option<RouteAggregate>> {
        if let Some(aggregate) = self.inner.aggregates.load_aggregate(route).await? {
            return Ok(Some(aggregate));
        }
        self.inner.recompute_route(route).await?;
        Ok(self.inner.aggregates.load_aggregate(route).await?)
    }

    pub async fn all_aggregates(&self) -> Result<Vec<RouteAggregate>> {
        Ok(self.inner.aggregates.load_all_aggregates().await?)
    }

    /// Every route that has an aggregate, i.e. every distinct `(method,
    /// path)` pair observed so far.
    pub async fn distinct_routes(&self) -> Result<Vec<Route>> {
        let aggregates = self.inner.aggregates.load_all_aggregates().await?;
        Ok(aggregates
            .into_iter()
            .map(|aggregate| aggregate.route)
            .collect())
    }

    /// Cancel every armed debounce timer and recompute those routes now.
    /// Routes fail independently; failures are collected and reported
    /// together while the rest still update.
    pub async fn force_all_pending_updates(&self) -> Result<()> {
        let armed: Vec<Route> = {
            let mut routes = lock(&self.inner.routes);
            routes
                .iter_mut()
                .filter_map(|(route, state)| {
                    state.timer.take().map(|timer| {
                        timer.abort();
                        route.clone()
                    })
                })
                .collect()
        };
        let attempted = armed.len();
        let mut failures = Vec::new();
        for route in armed {
            let batch = {
                let routes = lock(&self.inner.routes);
                routes.get(&route).map(|state| state.pending).unwrap_or(0)
            };
            if let Err(err) = self.inner.settle_recompute(&route, batch).await {
                warn!(
                    method = %route.method,
                    path = %route.path,
                    error = %err,
                    "forced pending update failed"
                );
                failures.push((route, err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::PendingUpdates {
                attempted,
                failures,
            })
        }
    }
}

impl Drop for AggregationEngine {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

impl EngineInner {
    /// Count one observed event for a route. Hitting the threshold cancels
    /// the route's timer and recomputes immediately; below it, the first
    /// unflushed event arms the debounce timer.
    fn note_event(self: Arc<Self>, route: Route) {
        let trigger = {
            let mut routes = lock(&self.routes);
            let state = routes.entry(route.clone()).or_default();
            state.pending += 1;
            if state.pending >= self.config.min_changes_to_update {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                Some(state.pending)
            } else {
                if state.timer.is_none() {
                    state.timer = Some(spawn_debounce(self.clone(), route.clone()));
                }
                None
            }
        };
        if let Some(batch) = trigger {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(err) = inner.settle_recompute(&route, batch).await {
                    warn!(
                        method = %route.method,
                        path = %route.path,
                        error = %err,
                        "threshold recompute failed"
                    );
                }
            });
        }
    }

    /// Recompute and, only on success, consume the triggering batch from the
    /// pending counter. A failed attempt leaves the counter intact so the
    /// unflushed events still trigger a later recompute.
    async fn settle_recompute(&self, route: &Route, batch: u64) -> routelens_store::Result<()> {
        self.recompute_route(route).await?;
        let mut routes = lock(&self.routes);
        if let Some(state) = routes.get_mut(route) {
            state.pending = state.pending.saturating_sub(batch);
        }
        Ok(())
    }

    /// Fold all events newer than the stored aggregate's watermark into it.
    /// A no-op when nothing new exists, which also makes duplicate triggers
    /// harmless.
    async fn recompute_route(&self, route: &Route) -> routelens_store::Result<bool> {
        let serialize = {
            let mut routes = lock(&self.routes);
            routes
                .entry(route.clone())
                .or_default()
                .recompute_lock
                .clone()
        };
        let _guard = serialize.lock().await;

        let existing = self.aggregates.load_aggregate(route).await?;
        let after = existing
            .as_ref()
            .map(|aggregate| aggregate.last_sequence_id)
            .unwrap_or(0);
        let new_events = self.events.events_after(route, after).await?;
        let Some(batch) = EventBatch::collect(
            &new_events,
            self.config.granularity_minutes(),
            self.config.clock,
        ) else {
            return Ok(false);
        };

        let aggregate = match existing {
            Some(mut aggregate) => {
                aggregate.merge_batch(&batch);
                aggregate
            }
            None => RouteAggregate::from_batch(route.clone(), batch),
        };
        self.aggregates.upsert_aggregate(&aggregate).await?;
        debug!(
            method = %route.method,
            path = %route.path,
            last_sequence_id = aggregate.last_sequence_id,
            "aggregate updated"
        );
        Ok(true)
    }
}

fn spawn_debounce(inner: Arc<EngineInner>, route: Route) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(inner.config.forced_update_timeout).await;
        let batch = {
            let mut routes = lock(&inner.routes);
            let state = routes.entry(route.clone()).or_default();
            state.timer = None;
            state.pending
        };
        if let Err(err) = inner.settle_recompute(&route, batch).await {
            warn!(
                method = %route.method,
                path = %route.path,
                error = %err,
                "debounce recompute failed"
            );
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
