use chrono::{DateTime, FixedOffset, Local, Timelike};
use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod simulate;

pub use cluster::determine_clusters;

pub const MINUTES_PER_DAY: u32 = 24 * 60;
pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_DAILY_DIVISIONS: u32 = 48;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub method: String,
    pub path: String,
}

impl Route {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub route: Route,
    pub timestamp_ms: i64,
    pub sequence_id: u64,
}

/// Accumulated time-of-day histogram for one route. `buckets[i]` counts every
/// observed call whose wall-clock time falls in slot `i`, summed over all days;
/// per-day averaging happens at projection time in [`load_series`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAggregate {
    pub route: Route,
    pub buckets: Vec<u64>,
    pub last_sequence_id: u64,
    pub oldest_timestamp_ms: i64,
    pub newest_timestamp_ms: i64,
}

pub type Cluster = Vec<Route>;
pub type ClusterPartition = Vec<Cluster>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadPoint {
    pub hour_of_day: f64,
    pub average_calls: f64,
}

pub type LoadSeries = Vec<LoadPoint>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantError {
    #[error("bucket vector length mismatch: expected {expected}, found {found}")]
    MismatchedBucketLength { expected: usize, found: usize },
}

/// Clock used to derive the hour-of-day of an event. The default reads the
/// process-local wall clock, which makes bucket contents depend on the
/// runtime's timezone; keeping it an explicit knob lets deployments pin Utc
/// or a fixed offset instead. Changing the clock changes clustering results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketClock {
    #[default]
    Local,
    Utc,
    /// Fixed offset east of UTC, in seconds.
    FixedOffsetSeconds(i32),
}

impl BucketClock {
    /// Minutes past midnight in this clock's timezone. Seconds are discarded.
    /// Returns `None` for timestamps outside chrono's representable range.
    pub fn minutes_of_day(&self, timestamp_ms: i64) -> Option<u32> {
        let utc = DateTime::from_timestamp_millis(timestamp_ms)?;
        let (hour, minute) = match self {
            BucketClock::Local => {
                let local = utc.with_timezone(&Local);
                (local.hour(), local.minute())
            }
            BucketClock::Utc => (utc.hour(), utc.minute()),
            BucketClock::FixedOffsetSeconds(seconds) => {
                let offset = FixedOffset::east_opt(*seconds)?;
                let shifted = utc.with_timezone(&offset);
                (shifted.hour(), shifted.minute())
            }
        };
        Some(hour * 60 + minute)
    }
}

/// Histogram a set of events into fixed time-of-day slots, ignoring dates.
/// Slot intervals are closed-open, so an event exactly on a boundary lands in
/// the later slot. Callers are responsible for `granularity_minutes` evenly
/// dividing a day; the engine validates this at configuration time.
pub fn vectorize(events: &[Event], granularity_minutes: u32, clock: BucketClock) -> Vec<u64> {
    debug_assert_eq!(MINUTES_PER_DAY % granularity_minutes, 0);
    let slots = (MINUTES_PER_DAY / granularity_minutes) as usize;
    let mut buckets = vec![0u64; slots];
    for event in events {
        let Some(minutes) = clock.minutes_of_day(event.timestamp_ms) else {
            continue;
        };
        buckets[(minutes / granularity_minutes) as usize] += 1;
    }
    buckets
}

/// Vectorized summary of one batch of newly observed events for a route,
/// ready to seed or merge into a [`RouteAggregate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub buckets: Vec<u64>,
    pub last_sequence_id: u64,
    pub oldest_timestamp_ms: i64,
    pub newest_timestamp_ms: i64,
}

impl EventBatch {
    /// Collect a batch from raw events. Returns `None` for an empty slice so
    /// callers can treat "nothing new" as a no-op rather than writing zeros.
    pub fn collect(events: &[Event], granularity_minutes: u32, clock: BucketClock) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        let mut last_sequence_id = 0u64;
        let mut oldest_timestamp_ms = i64::MAX;
        let mut newest_timestamp_ms = i64::MIN;
        for event in events {
            last_sequence_id = last_sequence_id.max(event.sequence_id);
            oldest_timestamp_ms = oldest_timestamp_ms.min(event.timestamp_ms);
            newest_timestamp_ms = newest_timestamp_ms.max(event.timestamp_ms);
        }
        Some(Self {
            buckets: vectorize(events, granularity_minutes, clock),
            last_sequence_id,
            oldest_timestamp_ms,
            newest_timestamp_ms,
        })
    }
}

impl RouteAggregate {
    pub fn from_batch(route: Route, batch: EventBatch) -> Self {
        Self {
            route,
            buckets: batch.buckets,
            last_sequence_id: batch.last_sequence_id,
            oldest_timestamp_ms: batch.oldest_timestamp_ms,
            newest_timestamp_ms: batch.newest_timestamp_ms,
        }
    }

    /// Fold a batch of newer events into this aggregate. Bucket counts add
    /// elementwise and the timestamp range widens; folding batches with
    /// disjoint sequence ids is order-independent.
    pub fn merge_batch(&mut self, batch: &EventBatch) {
        for (slot, count) in self.buckets.iter_mut().zip(&batch.buckets) {
            *slot += count;
        }
        self.last_sequence_id = self.last_sequence_id.max(batch.last_sequence_id);
        self.oldest_timestamp_ms = self.oldest_timestamp_ms.min(batch.oldest_timestamp_ms);
        self.newest_timestamp_ms = self.newest_timestamp_ms.max(batch.newest_timestamp_ms);
    }

    pub fn total_calls(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

/// Whole days covered by a timestamp range, rounded up, never less than one.
pub fn day_span(oldest_timestamp_ms: i64, newest_timestamp_ms: i64) -> u64 {
    let span = newest_timestamp_ms.saturating_sub(oldest_timestamp_ms);
    // Equivalent to `span.div_ceil(MILLIS_PER_DAY)`; the inherent signed
    // `div_ceil` is still feature-gated (`int_roundings`) on stable, so the
    // definition is inlined here. With a positive divisor, ceil-division adds
    // one whenever there is a remainder.
    let quotient = span / MILLIS_PER_DAY;
    let ceil = if span % MILLIS_PER_DAY > 0 { quotient + 1 } else { quotient };
    ceil.max(1) as u64
}

/// Project an aggregate into average calls per time-of-day slot. The slot
/// totals are divided by the day span of the observed data so routes sampled
/// over different numbers of days are comparable.
pub fn load_series(aggregate: &RouteAggregate, granularity_minutes: u32) -> LoadSeries {
    let days = day_span(aggregate.oldest_timestamp_ms, aggregate.newest_timestamp_ms);
    series_points(&aggregate.buckets, days, granularity_minutes)
}

/// Combined load series for a cluster of routes: bucket vectors sum
/// elementwise and the day span comes from the combined timestamp range, so
/// the result is the cluster's aggregate average load rather than a sum of
/// per-route averages.
pub fn cluster_load_series(
    aggregates: &[RouteAggregate],
    granularity_minutes: u32,
) -> Result<LoadSeries, InvariantError> {
    let Some(first) = aggregates.first() else {
        return Ok(Vec::new());
    };
    let mut combined = vec![0u64; first.buckets.len()];
    let mut oldest = i64::MAX;
    let mut newest = i64::MIN;
    for aggregate in aggregates {
        if aggregate.buckets.len() != combined.len() {
            return Err(InvariantError::MismatchedBucketLength {
                expected: combined.len(),
                found: aggregate.buckets.len(),
            });
        }
        for (slot, count) in combined.iter_mut().zip(&aggregate.buckets) {
            *slot += count;
        }
        oldest = oldest.min(aggregate.oldest_timestamp_ms);
        newest = newest.max(aggregate.newest_timestamp_ms);
    }
    Ok(series_points(
        &combined,
        day_span(oldest, newest),
        granularity_minutes,
    ))
}

fn series_points(buckets: &[u64], days: u64, granularity_minutes: u32) -> LoadSeries {
    let slot_hours = granularity_minutes as f64 / 60.0;
    buckets
        .iter()
        .enumerate()
        .map(|(i, &count)| LoadPoint {
            hour_of_day: i as f64 * slot_hours,
            average_calls: count as f64 / days as f64,
        })
        .collect()
}

/// Build the dendrogram hierarchy for a cluster partition: root, one child
/// per cluster in input order, grouped inside each cluster by HTTP method in
/// first-seen order, with route paths as leaves.
pub fn build_tree(clusters: &[Cluster]) -> TreeNode {
    let mut cluster_nodes = Vec::with_capacity(clusters.len());
    for (i, cluster) in clusters.iter().enumerate() {
        let mut by_method: Vec<(String, Vec<String>)> = Vec::new();
        for route in cluster {
            match by_method.iter_mut().find(|(method, _)| *method == route.method) {
                Some((_, paths)) => paths.push(route.path.clone()),
                None => by_method.push((route.method.clone(), vec![route.path.clone()])),
            }
        }
        let method_nodes = by_method
            .into_iter()
            .map(|(method, paths)| TreeNode {
                name: method,
                children: Some(
                    paths
                        .into_iter()
                        .map(|path| TreeNode {
                            name: path,
                            children: None,
                        })
                        .collect(),
                ),
            })
            .collect();
        cluster_nodes.push(TreeNode {
            name: format!("Cluster {}", i),
            children: Some(method_nodes),
        });
    }
    TreeNode {
        name: "Clusters".to_string(),
        children: Some(cluster_nodes),
    }
}
