//! The estimation phase: a breadth-first walk that restores
//! non-negativity, integrality and parent-child consistency to the noisy
//! vectors, one two-stage optimization per sibling group.
//!
//! Children of a parent are solved jointly, with the parent's already-fixed
//! estimate as the right-hand side of one equality row per basis component.
//! That way no child ever needs to reach back up and modify its parent.

use crate::data::Dataset;
use crate::solver::{Constraint, SolveFailure, Solver};
use crate::tree::GeoTree;
use crate::{Result, TopDownError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Constraint rows for the run, materialized over basis indices.
///
/// `per_level[l]` holds the user rows applied to every node at level `l`;
/// `root` holds the rows applied to the root problem only.
#[derive(Debug, Default)]
pub struct EstimationPlan {
    /// Rows for the root problem.
    pub root: Vec<Constraint>,
    /// Rows per level, indexed by node level. Index 0 is unused.
    pub per_level: Vec<Vec<Constraint>>,
}

/// Runs the two-stage optimization over a tree.
pub struct Estimator<'a> {
    solver: &'a dyn Solver,
    plan: &'a EstimationPlan,
    max_retries: u32,
}

impl<'a> Estimator<'a> {
    /// At most this many extra attempts after a transient solver failure.
    const MAX_RETRIES: u32 = 3;

    /// Creates an estimator over the given solver and constraint plan.
    pub fn new(solver: &'a dyn Solver, plan: &'a EstimationPlan) -> Estimator<'a> {
        Estimator {
            solver,
            plan,
            max_retries: Self::MAX_RETRIES,
        }
    }

    /// Writes `v_est` for every node that does not have one yet.
    ///
    /// Nodes estimated by an earlier run are left untouched, which is what
    /// makes resuming an extended tree work: each existing parent estimate
    /// becomes the fixed right-hand side for its new children.
    pub fn run(&self, tree: &mut GeoTree, dataset: &Dataset, cancel: &AtomicBool) -> Result<()> {
        if tree.node(0).v_est.is_none() {
            self.check_cancelled(cancel)?;
            let target = noisy_target(tree, 0, "root")?;
            let x = self.stage_a(&target, &self.plan.root, "root")?;
            let y = self.stage_b(&x, &self.plan.root, "root")?;
            tree.node_mut(0).v_est = Some(y);
        }

        let mut queue = VecDeque::from([0usize]);
        while let Some(parent) = queue.pop_front() {
            let children = tree.node(parent).children.clone();
            if children.is_empty() {
                continue;
            }
            if children.iter().all(|&c| tree.node(c).v_est.is_some()) {
                queue.extend(children);
                continue;
            }
            self.check_cancelled(cancel)?;

            let path = tree.path_string(parent, dataset);
            self.estimate_children(tree, parent, &children, &path)?;
            queue.extend(children);
        }
        Ok(())
    }

    /// One joint two-stage solve for all children of `parent`.
    fn estimate_children(
        &self,
        tree: &mut GeoTree,
        parent: usize,
        children: &[usize],
        path: &str,
    ) -> Result<()> {
        let width = tree.node(parent).v_true.len();
        let level = tree.node(parent).level + 1;

        let mut target = Vec::with_capacity(children.len() * width);
        for &c in children {
            target.extend(noisy_target(tree, c, path)?);
        }

        // Parent-sum rows first: the rounding stage treats the leading
        // disjoint family as exact, and these are the rows that must never
        // be off by even one.
        let parent_est = tree.node(parent).v_est.clone().expect("parent estimated");
        let mut rows = Vec::with_capacity(width);
        for i in 0..width {
            rows.push(Constraint::sum(
                (0..children.len()).map(|c| c * width + i),
                parent_est[i] as f64,
            ));
        }
        if let Some(user_rows) = self.plan.per_level.get(level) {
            for (c, _) in children.iter().enumerate() {
                for row in user_rows {
                    rows.push(Constraint {
                        terms: row
                            .terms
                            .iter()
                            .map(|(i, coef)| (c * width + i, *coef))
                            .collect(),
                        sense: row.sense,
                        rhs: row.rhs,
                    });
                }
            }
        }

        let x = self.stage_a(&target, &rows, path)?;
        let y = self.stage_b(&x, &rows, path)?;

        for (c, &child) in children.iter().enumerate() {
            let estimate = y[c * width..(c + 1) * width].to_vec();
            tree.node_mut(child).v_est = Some(estimate);
        }
        tracing::debug!(parent = path, children = children.len(), "sibling group estimated");
        Ok(())
    }

    fn stage_a(&self, target: &[f64], rows: &[Constraint], path: &str) -> Result<Vec<f64>> {
        self.with_retries(path, "estimation stage A", || {
            self.solver.solve_non_negative_real(target, rows)
        })
    }

    fn stage_b(&self, target: &[f64], rows: &[Constraint], path: &str) -> Result<Vec<i64>> {
        self.with_retries(path, "estimation stage B", || {
            self.solver.solve_rounding(target, rows)
        })
    }

    fn with_retries<T>(
        &self,
        path: &str,
        phase: &str,
        solve: impl Fn() -> std::result::Result<T, SolveFailure>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match solve() {
                Ok(solution) => return Ok(solution),
                Err(SolveFailure::Infeasible(detail)) => {
                    return Err(TopDownError::Infeasible {
                        path: path.to_owned(),
                        phase: phase.to_owned(),
                        detail,
                    })
                }
                Err(SolveFailure::Failed(detail)) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(TopDownError::Solver {
                            path: path.to_owned(),
                            phase: phase.to_owned(),
                            detail,
                        });
                    }
                    tracing::warn!(path, phase, attempt, detail = %detail, "solver failed; retrying");
                }
            }
        }
    }

    fn check_cancelled(&self, cancel: &AtomicBool) -> Result<()> {
        if cancel.load(Ordering::Relaxed) {
            Err(TopDownError::Interrupted("estimation".into()))
        } else {
            Ok(())
        }
    }
}

fn noisy_target(tree: &GeoTree, idx: usize, path: &str) -> Result<Vec<f64>> {
    tree.node(idx)
        .v_noisy
        .as_ref()
        .map(|v| v.iter().map(|c| *c as f64).collect())
        .ok_or_else(|| {
            TopDownError::State(format!(
                "node [{path}] has no noisy vector; measurement has not run"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::Basis;
    use crate::data::Dataset;
    use crate::solver::{ProjectionSolver, Sense};

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn two_region_tree() -> (Dataset, GeoTree) {
        // Region 1 counts [3, 2], region 2 counts [1, 4].
        let mut csv = String::from("R;SEX\n");
        for _ in 0..3 {
            csv.push_str("1;1\n");
        }
        for _ in 0..2 {
            csv.push_str("1;2\n");
        }
        csv.push_str("2;1\n");
        for _ in 0..4 {
            csv.push_str("2;2\n");
        }
        let data = Dataset::load(
            csv.as_bytes(),
            &columns(&["R"]),
            &columns(&["SEX"]),
            b';',
        )
        .unwrap();
        let basis = Basis::new(data.query_domains());
        let tree = GeoTree::build(&data, &basis, 1).unwrap();
        (data, tree)
    }

    fn copy_true_to_noisy(tree: &mut GeoTree) {
        for idx in tree.bfs() {
            let v = tree.node(idx).v_true.clone();
            tree.node_mut(idx).v_noisy = Some(v);
        }
    }

    #[test]
    fn noiseless_run_reconstructs_exactly() {
        let (data, mut tree) = two_region_tree();
        copy_true_to_noisy(&mut tree);

        let solver = ProjectionSolver::default();
        let plan = EstimationPlan {
            root: vec![Constraint::sum(0..2, 10.0)],
            per_level: vec![Vec::new(), Vec::new()],
        };
        let estimator = Estimator::new(&solver, &plan);
        estimator
            .run(&mut tree, &data, &AtomicBool::new(false))
            .unwrap();

        for idx in tree.bfs() {
            let node = tree.node(idx);
            assert_eq!(node.v_est.as_ref().unwrap(), &node.v_true);
        }
    }

    #[test]
    fn children_always_sum_to_their_parent() {
        let (data, mut tree) = two_region_tree();
        copy_true_to_noisy(&mut tree);
        // Perturb the children as measurement noise would.
        let children = tree.node(0).children.clone();
        tree.node_mut(children[0]).v_noisy = Some(vec![6, -1]);
        tree.node_mut(children[1]).v_noisy = Some(vec![0, 7]);

        let solver = ProjectionSolver::default();
        let plan = EstimationPlan {
            root: vec![Constraint::sum(0..2, 10.0)],
            per_level: vec![Vec::new(), Vec::new()],
        };
        Estimator::new(&solver, &plan)
            .run(&mut tree, &data, &AtomicBool::new(false))
            .unwrap();

        let root_est = tree.node(0).v_est.clone().unwrap();
        let mut sums = vec![0i64; root_est.len()];
        for &c in &children {
            let est = tree.node(c).v_est.as_ref().unwrap();
            assert!(est.iter().all(|v| *v >= 0));
            for (s, v) in sums.iter_mut().zip(est) {
                *s += v;
            }
        }
        assert_eq!(sums, root_est);
    }

    #[test]
    fn inconsistent_user_rows_are_fatal() {
        let (data, mut tree) = two_region_tree();
        copy_true_to_noisy(&mut tree);

        let solver = ProjectionSolver::default();
        // Root pinned to 10 individuals while each of the two children is
        // pinned to 4: the sibling problem demands 8 = 10.
        let plan = EstimationPlan {
            root: vec![Constraint::sum(0..2, 10.0)],
            per_level: vec![
                Vec::new(),
                vec![Constraint {
                    terms: vec![(0, 1.0), (1, 1.0)],
                    sense: Sense::Eq,
                    rhs: 4.0,
                }],
            ],
        };
        let err = Estimator::new(&solver, &plan)
            .run(&mut tree, &data, &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, TopDownError::Infeasible { .. }), "{err}");
    }

    #[test]
    fn cancellation_stops_between_nodes() {
        let (data, mut tree) = two_region_tree();
        copy_true_to_noisy(&mut tree);

        let solver = ProjectionSolver::default();
        let plan = EstimationPlan::default();
        let err = Estimator::new(&solver, &plan)
            .run(&mut tree, &data, &AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, TopDownError::Interrupted(_)));
    }
}
