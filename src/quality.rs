//! Diagnostics comparing true against estimated vectors.
//!
//! Nothing here affects the published microdata; it exists so a run can be
//! judged for utility after the fact.

use crate::config::DistanceMetric;
use crate::tree::GeoTree;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::BTreeMap;

/// Sum of absolute component differences.
pub fn manhattan(a: &[i64], b: &[i64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs() as f64).sum()
}

/// Euclidean norm of the component differences.
pub fn euclidean(a: &[i64], b: &[i64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// One minus the cosine similarity; zero vectors count as maximally far.
pub fn cosine(a: &[i64], b: &[i64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (x * y) as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (x * x) as f64).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (x * x) as f64).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

/// Total variation distance between the two vectors read as distributions.
pub fn total_variation(a: &[i64], b: &[i64]) -> f64 {
    let sum_a: i64 = a.iter().sum();
    let sum_b: i64 = b.iter().sum();
    if sum_a == 0 || sum_b == 0 {
        return 0.0;
    }
    0.5 * a
        .iter()
        .zip(b)
        .map(|(x, y)| (*x as f64 / sum_a as f64 - *y as f64 / sum_b as f64).abs())
        .sum::<f64>()
}

/// The configured distance, or `None` when reporting is disabled.
pub fn distance(metric: DistanceMetric, a: &[i64], b: &[i64]) -> Option<f64> {
    match metric {
        DistanceMetric::Manhattan => Some(manhattan(a, b)),
        DistanceMetric::Euclidean => Some(euclidean(a, b)),
        DistanceMetric::Cosine => Some(cosine(a, b)),
        DistanceMetric::TotalVariation => Some(total_variation(a, b)),
        DistanceMetric::None => None,
    }
}

/// Mean distance between `v_true` and `v_est` for every level that has
/// estimates. Returns an empty map when the metric is `None`.
pub fn mean_distance_by_level(tree: &GeoTree, metric: DistanceMetric) -> BTreeMap<usize, f64> {
    let mut totals: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    for idx in tree.bfs() {
        let node = tree.node(idx);
        let Some(est) = node.v_est.as_ref() else {
            continue;
        };
        let Some(d) = distance(metric, &node.v_true, est) else {
            continue;
        };
        let entry = totals.entry(node.level).or_insert((0.0, 0));
        entry.0 += d;
        entry.1 += 1;
    }
    totals
        .into_iter()
        .map(|(level, (total, count))| (level, total / count as f64))
        .collect()
}

/// The probability of wrongly rejecting that the estimated counts follow
/// the true distribution, from a chi-squared goodness-of-fit statistic.
///
/// Returns 1.0 when the vectors agree exactly or no component has an
/// expected count to test against.
pub fn goodness_of_fit_alpha(observed: &[i64], expected: &[i64]) -> f64 {
    let mut statistic = 0.0;
    let mut dof = 0.0;
    for (o, e) in observed.iter().zip(expected) {
        if *e > 0 {
            let d = (o - e) as f64;
            statistic += d * d / *e as f64;
            dof += 1.0;
        }
    }
    if dof <= 1.0 || statistic == 0.0 {
        return 1.0;
    }
    let chi2 = ChiSquared::new(dof - 1.0).unwrap();
    1.0 - chi2.cdf(statistic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances_on_simple_vectors() {
        let a = [3, 0, 1];
        let b = [0, 4, 1];
        assert_eq!(manhattan(&a, &b), 7.0);
        assert!((euclidean(&a, &b) - 5.0).abs() < 1e-12);
        assert!((total_variation(&a, &a)).abs() < 1e-12);
        assert!(cosine(&a, &a).abs() < 1e-12);
        assert_eq!(cosine(&[0, 0], &[1, 2]), 1.0);
    }

    #[test]
    fn identical_vectors_have_full_alpha() {
        assert_eq!(goodness_of_fit_alpha(&[5, 5], &[5, 5]), 1.0);
    }

    #[test]
    fn wild_deviation_has_tiny_alpha() {
        let alpha = goodness_of_fit_alpha(&[100, 0, 0], &[34, 33, 33]);
        assert!(alpha < 1e-6, "{alpha}");
    }

    #[test]
    fn total_variation_is_selectable() {
        let d = distance(DistanceMetric::TotalVariation, &[3, 1], &[1, 3]).unwrap();
        assert!((d - 0.5).abs() < 1e-12);
    }

    #[test]
    fn none_metric_reports_nothing() {
        assert_eq!(distance(DistanceMetric::None, &[1], &[1]), None);
    }
}
