//! Density-based clustering of routes by covariant time-of-day load.
//!
//! Routes are clustered on their raw bucket vectors with an OPTICS ordering
//! and a flat extraction at a self-scaling radius: the average number of
//! calls per bucket across the whole input. Two routes are neighbors when
//! their histograms differ by about one bucket's average load, so the radius
//! tracks the data's volume instead of being a fixed constant.

use rayon::prelude::*;

use crate::{ClusterPartition, InvariantError, RouteAggregate};

/// Minimum neighborhood population for a point to be a cluster seed. With a
/// floor of one every point can seed its own cluster, so the partition has no
/// noise in practice; the extraction still drops unreachable non-core points
/// for larger values.
const MIN_POINTS: usize = 1;

/// Group routes whose aggregates show covariant temporal load.
///
/// Stateless batch computation over the full aggregate set. Order among and
/// within clusters carries no meaning. Aggregates must share one bucket
/// vector length; empty input yields an empty partition.
pub fn determine_clusters(
    aggregates: &[RouteAggregate],
) -> Result<ClusterPartition, InvariantError> {
    let Some(first) = aggregates.first() else {
        return Ok(Vec::new());
    };
    let bucket_len = first.buckets.len();
    for aggregate in aggregates {
        if aggregate.buckets.len() != bucket_len {
            return Err(InvariantError::MismatchedBucketLength {
                expected: bucket_len,
                found: aggregate.buckets.len(),
            });
        }
    }

    let vectors: Vec<Vec<f64>> = aggregates
        .iter()
        .map(|aggregate| aggregate.buckets.iter().map(|&count| count as f64).collect())
        .collect();
    let total_calls: u64 = aggregates.iter().map(RouteAggregate::total_calls).sum();
    let epsilon = total_calls as f64 / bucket_len as f64;

    let clusters = optics(&vectors, epsilon, MIN_POINTS);
    Ok(clusters
        .into_iter()
        .map(|members| {
            members
                .into_iter()
                .map(|i| aggregates[i].route.clone())
                .collect()
        })
        .collect())
}

struct OrderedPoint {
    index: usize,
    reachability: Option<f64>,
}

/// OPTICS ordering plus flat cluster extraction at `epsilon`.
///
/// Points are visited in input order, and the seed list always yields the
/// unprocessed candidate with the smallest reachability (ties broken by
/// index), so the ordering is deterministic for a given input.
fn optics(points: &[Vec<f64>], epsilon: f64, min_points: usize) -> Vec<Vec<usize>> {
    let n = points.len();
    let distances = distance_matrix(points);
    let core_distances: Vec<Option<f64>> = (0..n)
        .map(|i| core_distance(&distances[i], epsilon, min_points))
        .collect();

    let mut processed = vec![false; n];
    let mut ordering: Vec<OrderedPoint> = Vec::with_capacity(n);

    for start in 0..n {
        if processed[start] {
            continue;
        }
        processed[start] = true;
        ordering.push(OrderedPoint {
            index: start,
            reachability: None,
        });
        if core_distances[start].is_none() {
            continue;
        }

        // reachability candidates, kept unsorted; the minimum is scanned out
        let mut seeds: Vec<(usize, f64)> = Vec::new();
        update_seeds(start, &distances, &core_distances, epsilon, &processed, &mut seeds);
        while let Some(pos) = min_seed(&seeds) {
            let (index, reachability) = seeds.swap_remove(pos);
            processed[index] = true;
            ordering.push(OrderedPoint {
                index,
                reachability: Some(reachability),
            });
            if core_distances[index].is_some() {
                update_seeds(index, &distances, &core_distances, epsilon, &processed, &mut seeds);
            }
        }
    }

    extract_clusters(&ordering, &core_distances, epsilon)
}

fn distance_matrix(points: &[Vec<f64>]) -> Vec<Vec<f64>> {
    points
        .par_iter()
        .map(|a| points.iter().map(|b| euclidean(a, b)).collect())
        .collect()
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Distance to the `min_points`-th nearest neighbor within `epsilon`, the
/// point itself included; `None` when the neighborhood is too sparse for the
/// point to be core.
fn core_distance(row: &[f64], epsilon: f64, min_points: usize) -> Option<f64> {
    let mut in_range: Vec<f64> = row.iter().copied().filter(|&d| d <= epsilon).collect();
    if in_range.len() < min_points {
        return None;
    }
    in_range.sort_by(|a, b| a.total_cmp(b));
    Some(in_range[min_points - 1])
}

fn update_seeds(
    center: usize,
    distances: &[Vec<f64>],
    core_distances: &[Option<f64>],
    epsilon: f64,
    processed: &[bool],
    seeds: &mut Vec<(usize, f64)>,
) {
    let Some(core) = core_distances[center] else {
        return;
    };
    for (neighbor, &distance) in distances[center].iter().enumerate() {
        if processed[neighbor] || distance > epsilon {
            continue;
        }
        let reachability = core.max(distance);
        match seeds.iter_mut().find(|(index, _)| *index == neighbor) {
            Some((_, existing)) => *existing = existing.min(reachability),
            None => seeds.push((neighbor, reachability)),
        }
    }
}

fn min_seed(seeds: &[(usize, f64)]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (pos, &(index, reachability)) in seeds.iter().enumerate() {
        let better = match best {
            None => true,
            Some(current) => {
                let (current_index, current_reachability) = seeds[current];
                match reachability.total_cmp(&current_reachability) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => index < current_index,
                    std::cmp::Ordering::Greater => false,
                }
            }
        };
        if better {
            best = Some(pos);
        }
    }
    best
}

/// Walk the reachability ordering and cut it at the threshold: a point
/// reachable within `epsilon` joins the open cluster, a core point beyond it
/// opens a new cluster, and a non-core point beyond it is noise and dropped.
fn extract_clusters(
    ordering: &[OrderedPoint],
    core_distances: &[Option<f64>],
    epsilon: f64,
) -> Vec<Vec<usize>> {
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut in_cluster = false;
    for point in ordering {
        let reachable = point
            .reachability
            .is_some_and(|reachability| reachability <= epsilon);
        if reachable && in_cluster {
            if let Some(current) = clusters.last_mut() {
                current.push(point.index);
            }
            continue;
        }
        let is_core = core_distances[point.index].is_some_and(|core| core <= epsilon);
        if reachable || is_core {
            clusters.push(vec![point.index]);
            in_cluster = true;
        } else {
            in_cluster = false;
        }
    }
    clusters
}
