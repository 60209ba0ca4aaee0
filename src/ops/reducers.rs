//! Built-in reducer kernels.
//!
//! A reducer collapses a 1-D line of values into a single value. Missing
//! values are skipped; a line without any valid value reduces to missing
//! (except `any`, which is false for an all-missing line).

use std::sync::Arc;

use crate::core::registry::Reducer;
use crate::core::types;
use crate::cube::ValueType;

fn finite(values: &[f64]) -> impl Iterator<Item = f64> + '_ {
    values.iter().copied().filter(|v| v.is_finite())
}

fn guard(values: &[f64], f: impl Fn(&[f64]) -> f64) -> f64 {
    let valid: Vec<f64> = finite(values).collect();
    if valid.is_empty() {
        f64::NAN
    } else {
        f(&valid)
    }
}

fn kernel(f: impl Fn(&[f64]) -> f64 + Send + Sync + 'static) -> Arc<dyn Fn(&[f64]) -> f64 + Send + Sync> {
    Arc::new(f)
}

fn mean(valid: &[f64]) -> f64 {
    valid.iter().sum::<f64>() / valid.len() as f64
}

fn variance(valid: &[f64]) -> f64 {
    let m = mean(valid);
    valid.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / valid.len() as f64
}

fn median(valid: &[f64]) -> f64 {
    let mut sorted = valid.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn mode(valid: &[f64]) -> f64 {
    let mut sorted = valid.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut best = sorted[0];
    let mut best_run = 0usize;
    let mut i = 0usize;
    while i < sorted.len() {
        let mut j = i;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        if j - i > best_run {
            best_run = j - i;
            best = sorted[i];
        }
        i = j;
    }
    best
}

/// The built-in reducer catalog, in registration order.
pub fn builtin_reducers() -> Vec<(&'static str, Reducer)> {
    vec![
        // -- Numerical reducers --
        (
            "sum",
            Reducer::new(types::additive_reducer(), kernel(|v| guard(v, |x| x.iter().sum()))),
        ),
        (
            "product",
            Reducer::new(types::additive_reducer(), kernel(|v| guard(v, |x| x.iter().product()))),
        ),
        ("mean", Reducer::new(types::numeric_reducer(), kernel(|v| guard(v, mean)))),
        ("median", Reducer::new(types::numeric_reducer(), kernel(|v| guard(v, median)))),
        (
            "standard_deviation",
            Reducer::new(types::numeric_reducer(), kernel(|v| guard(v, |x| variance(x).sqrt()))),
        ),
        ("variance", Reducer::new(types::numeric_reducer(), kernel(|v| guard(v, variance)))),
        // -- Boolean reducers --
        (
            "all",
            Reducer::new(
                types::boolean_reducer(),
                kernel(|v| guard(v, |x| if x.iter().all(|&b| b != 0.0) { 1.0 } else { 0.0 })),
            ),
        ),
        (
            "any",
            Reducer::new(
                types::boolean_reducer(),
                kernel(|v| if finite(v).any(|b| b != 0.0) { 1.0 } else { 0.0 }),
            ),
        ),
        // -- Count reducers --
        (
            "count",
            Reducer::new(
                types::count_reducer(ValueType::Discrete),
                kernel(|v| guard(v, |x| x.iter().filter(|&&b| b != 0.0).count() as f64)),
            ),
        ),
        (
            "percentage",
            Reducer::new(
                types::count_reducer(ValueType::Continuous),
                kernel(|v| {
                    guard(v, |x| {
                        let part = x.iter().filter(|&&b| b != 0.0).count() as f64;
                        part / x.len() as f64 * 100.0
                    })
                }),
            ),
        ),
        // -- Ordered reducers --
        (
            "min",
            Reducer::new(types::ordered_reducer(), kernel(|v| guard(v, |x| x.iter().copied().fold(f64::INFINITY, f64::min)))),
        ),
        (
            "max",
            Reducer::new(types::ordered_reducer(), kernel(|v| guard(v, |x| x.iter().copied().fold(f64::NEG_INFINITY, f64::max)))),
        ),
        // -- Universal reducers --
        (
            "first",
            Reducer::new(types::universal_reducer(), kernel(|v| finite(v).next().unwrap_or(f64::NAN))),
        ),
        (
            "last",
            Reducer::new(types::universal_reducer(), kernel(|v| finite(v).last().unwrap_or(f64::NAN))),
        ),
        ("mode", Reducer::new(types::universal_reducer(), kernel(|v| guard(v, mode)))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reduce(name: &str, values: &[f64]) -> f64 {
        for (n, r) in builtin_reducers() {
            if n == name {
                return (r.kernel)(values);
            }
        }
        panic!("no reducer named '{name}'");
    }

    #[test]
    fn test_count_skips_missing() {
        assert_eq!(reduce("count", &[1.0, 0.0, f64::NAN, 1.0]), 2.0);
        assert!(reduce("count", &[f64::NAN, f64::NAN]).is_nan());
    }

    #[test]
    fn test_any_is_false_for_all_missing() {
        assert_eq!(reduce("any", &[f64::NAN, f64::NAN]), 0.0);
        assert_eq!(reduce("any", &[0.0, f64::NAN]), 0.0);
        assert_eq!(reduce("any", &[0.0, 2.0]), 1.0);
    }

    #[test]
    fn test_all_requires_every_valid_value() {
        assert_eq!(reduce("all", &[1.0, 1.0, f64::NAN]), 1.0);
        assert_eq!(reduce("all", &[1.0, 0.0]), 0.0);
        assert!(reduce("all", &[f64::NAN]).is_nan());
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(reduce("median", &[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(reduce("median", &[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_mode_prefers_smallest_on_tie() {
        assert_eq!(reduce("mode", &[2.0, 1.0, 2.0, 1.0]), 1.0);
        assert_eq!(reduce("mode", &[3.0, 3.0, 1.0]), 3.0);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(reduce("percentage", &[1.0, 0.0, 1.0, 0.0]), 50.0);
    }

    #[test]
    fn test_first_and_last_skip_missing() {
        assert_eq!(reduce("first", &[f64::NAN, 5.0, 6.0]), 5.0);
        assert_eq!(reduce("last", &[5.0, 6.0, f64::NAN]), 6.0);
    }

    #[test]
    fn test_standard_deviation_population() {
        let sd = reduce("standard_deviation", &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((sd - 2.0).abs() < 1e-12);
    }
}
