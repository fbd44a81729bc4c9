//! The measurement phase: every node's noisy vector is its true vector
//! plus fresh, independent noise drawn under the level's privacy budget.

use crate::config::Mechanism;
use crate::noise::{self, Rational};
use crate::tree::GeoTree;
use crate::{Result, TopDownError};
use num_rational::Ratio;
use rand::RngCore;

/// Translated per-level sampler parameters for one mechanism.
///
/// The level budget is interpreted with sensitivity 1: epsilon for the
/// discrete Laplace (scale `1/rho`) and rho for the discrete Gaussian
/// (variance `1/(2 rho)`).
pub struct Measurement {
    mechanism: Mechanism,
    parameters: Vec<Rational>,
}

impl Measurement {
    /// Fixes the sampler parameter for every level `0..levels` from the
    /// configured per-level budgets.
    pub fn new(mechanism: Mechanism, budgets: &[f64], levels: usize) -> Result<Measurement> {
        if budgets.len() < levels {
            return Err(TopDownError::Parameter(format!(
                "privacy budgets cover {} levels but the tree has {levels}",
                budgets.len()
            )));
        }
        let parameters = budgets[..levels]
            .iter()
            .enumerate()
            .map(|(level, budget)| {
                let rho = noise::rational_from_f64(*budget).map_err(|_| {
                    TopDownError::Parameter(format!(
                        "privacy budget for level {level} must be positive and finite, got {budget}"
                    ))
                })?;
                // Both translations are reciprocals of the budget.
                Ok(match mechanism {
                    Mechanism::DiscreteLaplace => rho.recip(),
                    Mechanism::DiscreteGaussian => Ratio::new(
                        rho.denom().clone(),
                        rho.numer() * num_bigint::BigUint::from(2u8),
                    ),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Measurement {
            mechanism,
            parameters,
        })
    }

    /// Writes `v_noisy` for every node that does not have one yet, in
    /// breadth-first order so that a run extended to deeper levels consumes
    /// the same random prefix as a fresh, deeper run.
    ///
    /// When `exempt_root` is set the root's noisy vector is a copy of its
    /// true vector; that is only sound when a fixed-total constraint pins
    /// the root anyway.
    pub fn apply(
        &self,
        tree: &mut GeoTree,
        rng: &mut dyn RngCore,
        exempt_root: bool,
    ) -> Result<()> {
        let mut noised = 0usize;
        for idx in tree.bfs() {
            if tree.node(idx).v_noisy.is_some() {
                continue;
            }
            let level = tree.node(idx).level;
            if idx == 0 && exempt_root {
                let copy = tree.node(0).v_true.clone();
                tree.node_mut(0).v_noisy = Some(copy);
                continue;
            }
            let parameter = self.parameters.get(level).ok_or_else(|| {
                TopDownError::Parameter(format!("no privacy budget for level {level}"))
            })?;

            let noisy = tree
                .node(idx)
                .v_true
                .iter()
                .map(|count| {
                    let sample = match self.mechanism {
                        Mechanism::DiscreteLaplace => {
                            noise::sample_discrete_laplace(parameter, rng)
                        }
                        Mechanism::DiscreteGaussian => {
                            noise::sample_discrete_gaussian(parameter, rng)
                        }
                    };
                    Ok(count + noise::noise_to_i64(sample)?)
                })
                .collect::<Result<Vec<i64>>>()?;
            tree.node_mut(idx).v_noisy = Some(noisy);
            noised += 1;
        }
        tracing::debug!(nodes = noised, mechanism = ?self.mechanism, "measurement complete");
        Ok(())
    }

    /// The translated sampler parameter for a level, used by tests.
    pub fn parameter(&self, level: usize) -> Option<&Rational> {
        self.parameters.get(level)
    }
}

impl std::fmt::Debug for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Measurement")
            .field("mechanism", &self.mechanism)
            .field("levels", &self.parameters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::Basis;
    use crate::data::Dataset;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn tiny_tree() -> (Dataset, Basis, GeoTree) {
        let csv = "R;SEX\n1;1\n1;1\n1;2\n2;2\n";
        let data = Dataset::load(
            csv.as_bytes(),
            &["R".to_string()],
            &["SEX".to_string()],
            b';',
        )
        .unwrap();
        let basis = Basis::new(data.query_domains());
        let tree = GeoTree::build(&data, &basis, 1).unwrap();
        (data, basis, tree)
    }

    #[test]
    fn laplace_translation_is_reciprocal() {
        let m = Measurement::new(Mechanism::DiscreteLaplace, &[0.5, 2.0], 2).unwrap();
        assert_eq!(m.parameter(0).unwrap().to_string(), "2");
        assert_eq!(m.parameter(1).unwrap().to_string(), "1/2");
    }

    #[test]
    fn gaussian_translation_halves_the_reciprocal() {
        let m = Measurement::new(Mechanism::DiscreteGaussian, &[0.25, 1.0], 2).unwrap();
        assert_eq!(m.parameter(0).unwrap().to_string(), "2");
        assert_eq!(m.parameter(1).unwrap().to_string(), "1/2");
    }

    #[test]
    fn huge_budget_leaves_counts_unchanged() {
        let (_data, _basis, mut tree) = tiny_tree();
        let m = Measurement::new(Mechanism::DiscreteLaplace, &[1e6, 1e6], 2).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        m.apply(&mut tree, &mut rng, false).unwrap();
        for idx in tree.bfs() {
            let node = tree.node(idx);
            assert_eq!(node.v_noisy.as_ref().unwrap(), &node.v_true);
        }
    }

    #[test]
    fn exempt_root_copies_true_counts() {
        let (_data, _basis, mut tree) = tiny_tree();
        let m = Measurement::new(Mechanism::DiscreteLaplace, &[0.001, 0.001], 2).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        m.apply(&mut tree, &mut rng, true).unwrap();
        let root = tree.node(0);
        assert_eq!(root.v_noisy.as_ref().unwrap(), &root.v_true);
    }

    #[test]
    fn existing_noisy_vectors_are_kept() {
        let (_data, _basis, mut tree) = tiny_tree();
        let m = Measurement::new(Mechanism::DiscreteLaplace, &[1.0, 1.0], 2).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        m.apply(&mut tree, &mut rng, false).unwrap();
        let first: Vec<Vec<i64>> = tree
            .bfs()
            .iter()
            .map(|&i| tree.node(i).v_noisy.clone().unwrap())
            .collect();
        m.apply(&mut tree, &mut rng, false).unwrap();
        let second: Vec<Vec<i64>> = tree
            .bfs()
            .iter()
            .map(|&i| tree.node(i).v_noisy.clone().unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn smaller_budget_means_more_noise() {
        // Privacy-budget monotonicity, checked on a fixed seed: the mean L1
        // distortion under rho = 0.05 clearly exceeds the one under rho = 5.
        let distortion = |rho: f64, seed: u64| -> i64 {
            let (_data, _basis, mut tree) = tiny_tree();
            let m = Measurement::new(Mechanism::DiscreteLaplace, &[rho, rho], 2).unwrap();
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let mut total = 0;
            for _ in 0..50 {
                for idx in tree.bfs() {
                    tree.node_mut(idx).v_noisy = None;
                }
                m.apply(&mut tree, &mut rng, false).unwrap();
                total += tree
                    .bfs()
                    .iter()
                    .map(|&i| {
                        let node = tree.node(i);
                        node.v_noisy
                            .as_ref()
                            .unwrap()
                            .iter()
                            .zip(&node.v_true)
                            .map(|(a, b)| (a - b).abs())
                            .sum::<i64>()
                    })
                    .sum::<i64>();
            }
            total
        };
        assert!(distortion(0.05, 17) > distortion(5.0, 17));
    }
}
