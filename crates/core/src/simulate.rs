//! Pdf-driven synthetic traffic, used to exercise the clustering pipeline
//! with routes whose time-of-day shape is known in advance.

use rand::Rng;

use crate::{MINUTES_PER_DAY, MILLIS_PER_DAY, Route};

/// Probability density over the hour of day, `[0, 24)` on the x axis.
pub type DistributionFn = fn(f64) -> f64;

pub struct RoutePdf {
    pub route: Route,
    pub pdf: DistributionFn,
}

/// Simulate `num_days` of traffic for a set of routes. `calls_per_hour` fixes
/// the total call volume per interval (integrated by trapezoid rule) and each
/// call picks its route from a selection weighted by the routes' pdfs at the
/// interval midpoint. Call times are uniform within their interval. Returns
/// `(route, timestamp_ms)` pairs; `granularity_minutes` must evenly divide a
/// day.
pub fn simulate_route_calls<R: Rng + ?Sized>(
    routes: &[RoutePdf],
    calls_per_hour: DistributionFn,
    num_days: u32,
    granularity_minutes: u32,
    day_start_ms: i64,
    rng: &mut R,
) -> Vec<(Route, i64)> {
    debug_assert_eq!(MINUTES_PER_DAY % granularity_minutes, 0);
    let intervals = MINUTES_PER_DAY / granularity_minutes;

    let mut calls = Vec::new();
    for day in 0..num_days {
        let day_start = day_start_ms + i64::from(day) * MILLIS_PER_DAY;
        for interval in 0..intervals {
            let start_hour = f64::from(interval * granularity_minutes) / 60.0;
            let end_hour = f64::from((interval + 1) * granularity_minutes) / 60.0;
            let num_calls = integrate(calls_per_hour, start_hour, end_hour).floor();
            if num_calls < 1.0 {
                continue;
            }

            // selection array: each route occupies a slice sized by its pdf
            // at the interval midpoint
            let midpoint = (start_hour + end_hour) / 2.0;
            let mut selection: Vec<usize> = Vec::new();
            for (index, route) in routes.iter().enumerate() {
                let probability = (route.pdf)(midpoint);
                let copies = (100.0 * routes.len() as f64 * probability).round();
                for _ in 0..copies.max(0.0) as usize {
                    selection.push(index);
                }
            }
            if selection.is_empty() {
                continue;
            }

            for _ in 0..num_calls as usize {
                let index = selection[rng.gen_range(0..selection.len())];
                let offset_minutes = rng.gen_range(0..=granularity_minutes);
                let timestamp_ms = day_start
                    + i64::from(interval * granularity_minutes + offset_minutes) * 60_000;
                calls.push((routes[index].route.clone(), timestamp_ms));
            }
        }
    }
    calls
}

/// Definite integral approximated by the trapezoid rule.
fn integrate(f: DistributionFn, start: f64, end: f64) -> f64 {
    0.5 * (end - start) * (f(start) + f(end))
}
