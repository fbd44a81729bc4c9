//! A thin abstraction over the two optimization subproblems of the
//! estimation phase, plus the solver this crate ships.
//!
//! Problems are described by abstract linear constraint rows so another
//! quadratic/mixed-integer backend can be dropped in behind [`Solver`]
//! without touching the engine. Both entry points must be deterministic
//! given identical inputs.

use serde::{Deserialize, Serialize};

/// Direction of a linear constraint row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sense {
    /// The row must hold with equality.
    Eq,
    /// The weighted sum must not exceed the right-hand side.
    Le,
    /// The weighted sum must be at least the right-hand side.
    Ge,
}

/// One linear constraint row: `sum(coefficient * x[index]) sense rhs`.
///
/// Rows are sparse; variables that do not appear have coefficient zero.
#[derive(Clone, Debug, PartialEq)]
pub struct Constraint {
    /// `(variable index, coefficient)` pairs, each index at most once.
    pub terms: Vec<(usize, f64)>,
    /// Direction of the row.
    pub sense: Sense,
    /// Right-hand side.
    pub rhs: f64,
}

impl Constraint {
    /// An equality row fixing the sum of the given variables.
    pub fn sum(indices: impl IntoIterator<Item = usize>, rhs: f64) -> Constraint {
        Constraint {
            terms: indices.into_iter().map(|i| (i, 1.0)).collect(),
            sense: Sense::Eq,
            rhs,
        }
    }

    fn dot(&self, x: &[f64]) -> f64 {
        self.terms.iter().map(|(i, c)| c * x[*i]).sum()
    }

    fn violation(&self, x: &[f64]) -> f64 {
        let value = self.dot(x);
        match self.sense {
            Sense::Eq => (value - self.rhs).abs(),
            Sense::Le => (value - self.rhs).max(0.0),
            Sense::Ge => (self.rhs - value).max(0.0),
        }
    }

    fn norm_squared(&self) -> f64 {
        self.terms.iter().map(|(_, c)| c * c).sum()
    }
}

/// Why a solve did not produce a solution.
#[derive(Clone, Debug)]
pub enum SolveFailure {
    /// The constraint rows admit no feasible point.
    Infeasible(String),
    /// The solver gave up for another reason; the caller may retry.
    Failed(String),
}

/// The two subproblems every node group goes through.
pub trait Solver {
    /// Minimizes `||x - target||^2` subject to `x >= 0` and the supplied
    /// rows, over the reals.
    fn solve_non_negative_real(
        &self,
        target: &[f64],
        constraints: &[Constraint],
    ) -> Result<Vec<f64>, SolveFailure>;

    /// Minimizes `||y - target||_1` subject to `y >= 0`, integrality, and
    /// the supplied rows. `target` is the real solution of the first stage,
    /// so the equality right-hand sides are already integer-attainable.
    fn solve_rounding(
        &self,
        target: &[f64],
        constraints: &[Constraint],
    ) -> Result<Vec<i64>, SolveFailure>;
}

/// The built-in deterministic solver.
///
/// The real stage runs Dykstra's alternating projection over the rows and
/// the non-negative orthant, iterating until the worst violation and the
/// per-cycle movement drop below `tolerance` (the same cap-plus-tolerance
/// loop shape as iterative proportional fitting). The rounding stage floors
/// the real solution and distributes the remaining integer deficit of each
/// equality row by largest remainder, then repairs coupled rows with unit
/// moves that keep already-exact rows exact.
///
/// The rounding stage only supports rows whose coefficients are all one
/// (sum-type rows). That covers everything the estimation phase emits;
/// anything else is reported as a failure rather than silently mis-rounded.
#[derive(Clone, Debug)]
pub struct ProjectionSolver {
    /// Upper bound on projection cycles before giving up.
    pub max_cycles: usize,
    /// Convergence tolerance on violation and movement.
    pub tolerance: f64,
    /// Violations above this after a full run are reported as infeasible
    /// rather than as non-convergence.
    pub feasibility_tolerance: f64,
}

impl Default for ProjectionSolver {
    fn default() -> Self {
        ProjectionSolver {
            max_cycles: 50_000,
            tolerance: 1e-9,
            feasibility_tolerance: 1e-4,
        }
    }
}

impl Solver for ProjectionSolver {
    fn solve_non_negative_real(
        &self,
        target: &[f64],
        constraints: &[Constraint],
    ) -> Result<Vec<f64>, SolveFailure> {
        for row in constraints {
            if row.terms.is_empty() {
                let ok = match row.sense {
                    Sense::Eq => row.rhs.abs() <= self.tolerance,
                    Sense::Le => row.rhs >= -self.tolerance,
                    Sense::Ge => row.rhs <= self.tolerance,
                };
                if !ok {
                    return Err(SolveFailure::Infeasible(
                        "constraint row with no variables".into(),
                    ));
                }
            }
        }

        let mut x = target.to_vec();
        // Dykstra correction state: one vector for the orthant, one scalar
        // along each inequality row's normal. Equality rows are affine and
        // need none.
        let mut orthant = vec![0.0; x.len()];
        let mut half_space = vec![0.0; constraints.len()];

        let mut converged = false;
        let mut worst = f64::INFINITY;
        for _cycle in 0..self.max_cycles {
            let mut moved = 0.0f64;

            for (r, row) in constraints.iter().enumerate() {
                let norm = row.norm_squared();
                if norm == 0.0 {
                    continue;
                }
                match row.sense {
                    Sense::Eq => {
                        let step = (row.rhs - row.dot(&x)) / norm;
                        for (i, c) in &row.terms {
                            x[*i] += step * c;
                            moved = moved.max((step * c).abs());
                        }
                    }
                    Sense::Le | Sense::Ge => {
                        // Undo the previous correction, project, store the
                        // new correction.
                        let correction = half_space[r];
                        for (i, c) in &row.terms {
                            x[*i] += correction * c;
                        }
                        let value = row.dot(&x);
                        let overshoot = match row.sense {
                            Sense::Le => (value - row.rhs).max(0.0),
                            _ => (value - row.rhs).min(0.0),
                        };
                        let step = -overshoot / norm;
                        for (i, c) in &row.terms {
                            x[*i] += step * c;
                            moved = moved.max(((correction + step) * c).abs());
                        }
                        half_space[r] = -step;
                    }
                }
            }

            for i in 0..x.len() {
                let with_correction = x[i] + orthant[i];
                let clamped = with_correction.max(0.0);
                moved = moved.max((clamped - x[i]).abs());
                orthant[i] = with_correction - clamped;
                x[i] = clamped;
            }

            worst = constraints
                .iter()
                .map(|row| row.violation(&x))
                .fold(0.0, f64::max);
            if worst <= self.tolerance && moved <= self.tolerance {
                converged = true;
                break;
            }
        }

        if converged {
            Ok(x)
        } else if worst > self.feasibility_tolerance {
            Err(SolveFailure::Infeasible(format!(
                "constraints cannot be met; residual violation {worst:.3e}"
            )))
        } else {
            Err(SolveFailure::Failed(format!(
                "projection did not converge within {} cycles (violation {worst:.3e})",
                self.max_cycles
            )))
        }
    }

    fn solve_rounding(
        &self,
        target: &[f64],
        constraints: &[Constraint],
    ) -> Result<Vec<i64>, SolveFailure> {
        for row in constraints {
            if row.terms.iter().any(|(_, c)| *c != 1.0) {
                return Err(SolveFailure::Failed(
                    "rounding supports only unit-coefficient rows".into(),
                ));
            }
            if row.sense == Sense::Eq && (row.rhs - row.rhs.round()).abs() > 1e-6 {
                return Err(SolveFailure::Infeasible(format!(
                    "equality row demands non-integer total {}",
                    row.rhs
                )));
            }
        }

        let mut y: Vec<i64> = target
            .iter()
            .map(|t| (t + self.feasibility_tolerance).max(0.0).floor() as i64)
            .collect();

        // Split the equality rows into a disjoint "primary" family that we
        // discharge exactly by largest remainder, and the rest, which get
        // repaired afterwards.
        let mut covered = vec![false; target.len()];
        let mut primary = Vec::new();
        let mut secondary = Vec::new();
        for (r, row) in constraints.iter().enumerate() {
            if row.sense == Sense::Eq
                && !row.terms.iter().any(|(i, _)| covered[*i])
            {
                for (i, _) in &row.terms {
                    covered[*i] = true;
                }
                primary.push(r);
            } else {
                secondary.push(r);
            }
        }

        for &r in &primary {
            let row = &constraints[r];
            distribute(&mut y, target, row, row.rhs.round() as i64)?;
        }

        // Components no row touches round to the nearest integer.
        for i in 0..y.len() {
            if !covered[i] && target[i] - y[i] as f64 >= 0.5 {
                y[i] += 1;
            }
        }

        self.repair(&mut y, target, constraints, &secondary)?;

        for row in constraints {
            let total: i64 = row.terms.iter().map(|(i, _)| y[*i]).sum();
            let ok = match row.sense {
                Sense::Eq => total == row.rhs.round() as i64,
                Sense::Le => (total as f64) <= row.rhs + 1e-9,
                Sense::Ge => (total as f64) >= row.rhs - 1e-9,
            };
            if !ok {
                return Err(SolveFailure::Infeasible(format!(
                    "row total {total} cannot meet {:?} {}",
                    row.sense, row.rhs
                )));
            }
        }
        if y.iter().any(|v| *v < 0) {
            return Err(SolveFailure::Infeasible(
                "rounding drove a count negative".into(),
            ));
        }
        Ok(y)
    }
}

impl ProjectionSolver {
    /// Brings every secondary row into range with unit moves. A move either
    /// touches a variable outside all primary rows, or swaps a unit between
    /// two variables of the same primary row so that primary totals stay
    /// exact.
    ///
    /// Running out of moves here proves only that this greedy search got
    /// stuck, so both exhaustion paths report a retryable failure. The
    /// infeasibility verdict belongs to the caller's final row checks,
    /// which hold a concrete violated constraint in hand.
    fn repair(
        &self,
        y: &mut [i64],
        target: &[f64],
        constraints: &[Constraint],
        secondary: &[usize],
    ) -> Result<(), SolveFailure> {
        // Which primary row covers each variable, if any.
        let mut primary_of = vec![usize::MAX; y.len()];
        let mut primaries: Vec<&Constraint> = Vec::new();
        for (r, row) in constraints.iter().enumerate() {
            if !secondary.contains(&r) {
                for (i, _) in &row.terms {
                    primary_of[*i] = primaries.len();
                }
                primaries.push(row);
            }
        }

        let need = |y: &[i64], r: usize| -> i64 {
            let row = &constraints[r];
            let total: i64 = row.terms.iter().map(|(i, _)| y[*i]).sum();
            match row.sense {
                Sense::Eq => row.rhs.round() as i64 - total,
                Sense::Le => ((row.rhs + 1e-9).floor() as i64 - total).min(0),
                Sense::Ge => ((row.rhs - 1e-9).ceil() as i64 - total).max(0),
            }
        };

        let budget: i64 = secondary
            .iter()
            .map(|&r| need(y, r).abs())
            .sum::<i64>()
            .saturating_mul(4)
            + 16;

        for _ in 0..budget {
            let Some((&r, delta)) = secondary
                .iter()
                .map(|r| (r, need(y, *r)))
                .find(|(_, d)| *d != 0)
            else {
                return Ok(());
            };
            let row = &constraints[r];
            let step = delta.signum();
            let members: Vec<usize> = row.terms.iter().map(|(i, _)| *i).collect();

            // Candidate moves, scored by how much they worsen the L1
            // distance to the real solution.
            let mut best: Option<(f64, usize, Option<usize>)> = None;
            for &i in &members {
                if step < 0 && y[i] == 0 {
                    continue;
                }
                let own = unit_cost(y[i], target[i], step);
                if primary_of[i] == usize::MAX {
                    pick(&mut best, own, i, None);
                    continue;
                }
                // Pair with a partner from the same primary row, outside
                // this secondary row, moving the opposite way.
                for (j, _) in &primaries[primary_of[i]].terms {
                    let j = *j;
                    if members.contains(&j) {
                        continue;
                    }
                    if step > 0 && y[j] == 0 {
                        continue;
                    }
                    let cost = own + unit_cost(y[j], target[j], -step);
                    pick(&mut best, cost, i, Some(j));
                }
            }

            match best {
                Some((_, i, partner)) => {
                    y[i] += step;
                    if let Some(j) = partner {
                        y[j] -= step;
                    }
                }
                None => {
                    return Err(SolveFailure::Failed(format!(
                        "repair found no unit move toward {:?} {}",
                        row.sense, row.rhs
                    )))
                }
            }
        }

        Err(SolveFailure::Failed(
            "row repairs did not settle within the move budget".into(),
        ))
    }
}

fn unit_cost(y: i64, target: f64, step: i64) -> f64 {
    let before = (y as f64 - target).abs();
    let after = ((y + step) as f64 - target).abs();
    after - before
}

fn pick(best: &mut Option<(f64, usize, Option<usize>)>, cost: f64, i: usize, j: Option<usize>) {
    if best.as_ref().map_or(true, |(c, _, _)| cost < *c) {
        *best = Some((cost, i, j));
    }
}

/// Largest-remainder distribution of an equality row's integer total.
fn distribute(
    y: &mut [i64],
    target: &[f64],
    row: &Constraint,
    rhs: i64,
) -> Result<(), SolveFailure> {
    let total: i64 = row.terms.iter().map(|(i, _)| y[*i]).sum();
    let mut deficit = rhs - total;
    if deficit == 0 {
        return Ok(());
    }

    let mut order: Vec<usize> = row.terms.iter().map(|(i, _)| *i).collect();
    if deficit > 0 {
        // Largest fractional remainder first.
        order.sort_by(|&a, &b| {
            let ra = target[a] - target[a].floor();
            let rb = target[b] - target[b].floor();
            rb.partial_cmp(&ra).unwrap().then(a.cmp(&b))
        });
        for i in order.into_iter().cycle().take(deficit.unsigned_abs() as usize * 2) {
            y[i] += 1;
            deficit -= 1;
            if deficit == 0 {
                return Ok(());
            }
        }
    } else {
        // Shed surplus from the smallest remainders, never below zero.
        order.sort_by(|&a, &b| {
            let ra = target[a] - target[a].floor();
            let rb = target[b] - target[b].floor();
            ra.partial_cmp(&rb).unwrap().then(a.cmp(&b))
        });
        for _ in 0..2 {
            for &i in &order {
                if deficit == 0 {
                    return Ok(());
                }
                if y[i] > 0 {
                    y[i] -= 1;
                    deficit += 1;
                }
            }
        }
    }
    if deficit != 0 {
        return Err(SolveFailure::Infeasible(format!(
            "cannot reach row total {rhs}"
        )));
    }
    Ok(())
}
