//! Peak detection over summed step functions.
//!
//! Every series is treated as a right-continuous step function: at instant
//! `t` it holds the value of its latest sample with `timestamp <= t`, or `0`
//! before its first sample. The peak of a bucket of series is the maximum of
//! the sum of those functions, evaluated at every sample timestamp that falls
//! inside the window, plus the window start when some series already holds a
//! value there. Ties resolve to the earliest instant.

use std::collections::BTreeMap;

use crate::models::{PeakResult, Point, Sample, Window};

/// One series' samples, sorted by timestamp.
///
/// Sorting is stable, so among samples sharing a timestamp the one supplied
/// last is the one that holds at that instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFunction {
    points: Vec<Point>,
}

impl StepFunction {
    pub fn new(mut points: Vec<Point>) -> Self {
        points.sort_by_key(|p| p.timestamp);
        Self { points }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Value held at `instant`.
    pub fn value_at(&self, instant: i64) -> i32 {
        let idx = self.points.partition_point(|p| p.timestamp <= instant);
        if idx == 0 {
            0
        } else {
            self.points[idx - 1].value
        }
    }
}

/// Splits a flat list of samples into per-series point lists, keeping the
/// order in which they were supplied.
pub fn group_by_series(samples: impl IntoIterator<Item = Sample>) -> BTreeMap<String, Vec<Point>> {
    let mut series: BTreeMap<String, Vec<Point>> = BTreeMap::new();
    for sample in samples {
        let point = sample.point();
        series.entry(sample.series_id).or_default().push(point);
    }
    series
}

/// Finds the instant in `window` at which the summed value of all series is
/// highest.
///
/// Sample timestamps inside `window` are candidates. Samples before the
/// window are not candidates themselves, but they define the value a series
/// holds when the window opens, and make `window.start` a candidate.
pub fn compute_peak<I>(series: I, window: Window) -> PeakResult
where
    I: IntoIterator<Item = Vec<Point>>,
{
    let functions: Vec<StepFunction> = series.into_iter().map(StepFunction::new).collect();

    let mut candidates: Vec<i64> = functions
        .iter()
        .flat_map(|f| f.points().iter().map(|p| p.timestamp))
        .filter(|ts| window.contains(*ts))
        .collect();
    if holds_value_at_start(&functions, window) {
        candidates.push(window.start);
    }
    candidates.sort_unstable();
    candidates.dedup();

    if candidates.is_empty() {
        return PeakResult::NoData;
    }

    // (consumed points, value currently held) per series
    let mut cursors: Vec<(usize, i32)> = vec![(0, 0); functions.len()];
    let mut best: Option<(i64, i64)> = None;

    for &instant in &candidates {
        let mut total: i64 = 0;
        for (function, cursor) in functions.iter().zip(cursors.iter_mut()) {
            let points = function.points();
            while cursor.0 < points.len() && points[cursor.0].timestamp <= instant {
                cursor.1 = points[cursor.0].value;
                cursor.0 += 1;
            }
            total += i64::from(cursor.1);
        }

        match best {
            Some((_, best_total)) if total <= best_total => {}
            _ => best = Some((instant, total)),
        }
    }

    match best {
        Some((timestamp, value)) => PeakResult::Peak { timestamp, value },
        None => PeakResult::NoData,
    }
}

fn holds_value_at_start(functions: &[StepFunction], window: Window) -> bool {
    functions
        .iter()
        .any(|f| f.points().first().map_or(false, |p| p.timestamp < window.start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn pts(raw: &[(i64, i32)]) -> Vec<Point> {
        raw.iter().map(|&(t, v)| Point::new(t, v)).collect()
    }

    /// Rescans every series at every candidate instant.
    fn naive_peak(series: &[Vec<Point>], window: Window) -> PeakResult {
        let mut candidates: Vec<i64> = series
            .iter()
            .flatten()
            .map(|p| p.timestamp)
            .filter(|ts| window.contains(*ts))
            .collect();
        if series.iter().flatten().any(|p| p.timestamp < window.start) {
            candidates.push(window.start);
        }
        candidates.sort_unstable();
        candidates.dedup();

        let functions: Vec<StepFunction> = series.iter().cloned().map(StepFunction::new).collect();
        let mut best: Option<(i64, i64)> = None;
        for t in candidates {
            let total: i64 = functions.iter().map(|f| i64::from(f.value_at(t))).sum();
            if best.map_or(true, |(_, b)| total > b) {
                best = Some((t, total));
            }
        }
        best.map_or(PeakResult::NoData, |(timestamp, value)| PeakResult::Peak {
            timestamp,
            value,
        })
    }

    #[test]
    fn test_two_series_peak() {
        let series = vec![pts(&[(100, 5), (200, 3)]), pts(&[(150, 10)])];
        let result = compute_peak(series, Window::new(0, 300));
        assert_eq!(result, PeakResult::Peak { timestamp: 150, value: 15 });
    }

    #[test]
    fn test_tie_goes_to_earliest_instant() {
        let series = vec![pts(&[(10, 5), (20, 5)])];
        let result = compute_peak(series, Window::new(0, 100));
        assert_eq!(result, PeakResult::Peak { timestamp: 10, value: 5 });
    }

    #[test]
    fn test_empty_input_is_no_data() {
        assert_eq!(compute_peak(Vec::<Vec<Point>>::new(), Window::new(0, 10)), PeakResult::NoData);
        assert_eq!(compute_peak(vec![vec![], vec![]], Window::new(0, 10)), PeakResult::NoData);
    }

    #[test]
    fn test_single_sample() {
        let result = compute_peak(vec![pts(&[(42, 7)])], Window::new(0, 100));
        assert_eq!(result, PeakResult::Peak { timestamp: 42, value: 7 });
    }

    #[test]
    fn test_zero_valued_data_is_a_peak() {
        let result = compute_peak(vec![pts(&[(5, 0), (6, 0)])], Window::new(0, 10));
        assert_eq!(result, PeakResult::Peak { timestamp: 5, value: 0 });
    }

    #[test]
    fn test_unsorted_input() {
        let series = vec![pts(&[(200, 3), (100, 5)]), pts(&[(150, 10)])];
        let result = compute_peak(series, Window::new(0, 300));
        assert_eq!(result, PeakResult::Peak { timestamp: 150, value: 15 });
    }

    #[test]
    fn test_duplicate_timestamp_last_supplied_wins() {
        let f = StepFunction::new(pts(&[(10, 1), (10, 9), (5, 2)]));
        assert_eq!(f.value_at(10), 9);
        assert_eq!(f.value_at(7), 2);
        assert_eq!(f.value_at(4), 0);
    }

    #[test]
    fn test_samples_before_window_carry_in() {
        // X was at 8 before the window opened; Y appears inside it.
        let series = vec![pts(&[(-50, 8)]), pts(&[(10, 1)])];
        let result = compute_peak(series, Window::new(0, 100));
        assert_eq!(result, PeakResult::Peak { timestamp: 10, value: 9 });
    }

    #[test]
    fn test_value_held_since_before_window() {
        // nothing changes inside the window, the carried value still counts
        let series = vec![pts(&[(-50, 7)]), pts(&[(-10, 0)])];
        let result = compute_peak(series, Window::new(0, 100));
        assert_eq!(result, PeakResult::Peak { timestamp: 0, value: 7 });
    }

    #[test]
    fn test_carried_value_peaks_at_window_start() {
        let series = vec![pts(&[(-50, 8), (40, 2)]), pts(&[(10, 1)])];
        let result = compute_peak(series, Window::new(0, 100));
        assert_eq!(result, PeakResult::Peak { timestamp: 0, value: 8 });
    }

    #[test]
    fn test_samples_after_window_ignored() {
        let series = vec![pts(&[(10, 1), (500, 100)])];
        let result = compute_peak(series, Window::new(0, 100));
        assert_eq!(result, PeakResult::Peak { timestamp: 10, value: 1 });
    }

    #[test]
    fn test_group_by_series_keeps_supplied_order() {
        let grouped = group_by_series(vec![
            Sample::new("b", 2, 1),
            Sample::new("a", 1, 1),
            Sample::new("b", 1, 3),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["b"], pts(&[(2, 1), (1, 3)]));
        assert_eq!(grouped["a"], pts(&[(1, 1)]));
    }

    fn arb_series() -> impl Strategy<Value = Vec<Vec<Point>>> {
        prop::collection::vec(
            prop::collection::vec((0i64..1_000, 0i32..500).prop_map(|(t, v)| Point::new(t, v)), 0..20),
            0..6,
        )
    }

    proptest! {
        #[test]
        fn prop_value_at_matches_linear_scan(
            raw in prop::collection::vec((0i64..200, 0i32..100), 0..30),
            instant in -10i64..210,
        ) {
            let points = pts(&raw);
            let f = StepFunction::new(points.clone());

            // greatest timestamp <= instant; among equal timestamps the last supplied
            let mut expected = 0;
            let mut expected_ts = i64::MIN;
            for p in &points {
                if p.timestamp <= instant && p.timestamp >= expected_ts {
                    expected_ts = p.timestamp;
                    expected = p.value;
                }
            }
            prop_assert_eq!(f.value_at(instant), expected);
        }

        #[test]
        fn prop_merge_matches_naive(series in arb_series(), start in 0i64..500, len in 1i64..600) {
            let window = Window::new(start, start + len);
            prop_assert_eq!(compute_peak(series.clone(), window), naive_peak(&series, window));
        }

        #[test]
        fn prop_order_invariant(series in arb_series()) {
            let window = Window::new(0, 1_000);
            let reversed: Vec<Vec<Point>> = series.iter().rev().map(|s| {
                // stable sort, equal timestamps keep their supplied order
                let mut s = s.clone();
                s.sort_by_key(|p| std::cmp::Reverse(p.timestamp));
                s
            }).collect();
            let sorted: Vec<Vec<Point>> = series.iter().map(|s| {
                let mut s = s.clone();
                s.sort_by_key(|p| p.timestamp);
                s
            }).collect();
            prop_assert_eq!(compute_peak(sorted, window), compute_peak(reversed, window));
        }

        #[test]
        fn prop_idempotent(series in arb_series()) {
            let window = Window::new(100, 900);
            prop_assert_eq!(compute_peak(series.clone(), window), compute_peak(series, window));
        }
    }
}
