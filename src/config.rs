//! Run configuration: everything settable before a run starts.

use crate::estimate::EstimationPlan;
use crate::solver::{Constraint, Sense};
use crate::{Result, TopDownError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// The noise mechanism applied during measurement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    /// Exact discrete Gaussian noise; the level budget is rho.
    DiscreteGaussian,
    /// Exact discrete Laplace noise; the level budget is epsilon.
    DiscreteLaplace,
}

/// Distance used by the quality report comparing true against estimated
/// vectors. Only diagnostics depend on this.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Sum of absolute component differences.
    Manhattan,
    /// Euclidean norm of the component differences.
    Euclidean,
    /// One minus the cosine similarity.
    Cosine,
    /// Total variation distance between the normalized vectors.
    TotalVariation,
    /// Skip the quality report.
    None,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        DistanceMetric::None
    }
}

/// One declared linear constraint row over the permutation basis.
///
/// Omitted coefficients mean "all ones", i.e. a row over the node's total
/// population, by far the most common constraint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstraintSpec {
    /// Per-basis-row coefficients; `None` is shorthand for all ones.
    #[serde(default)]
    pub coefficients: Option<Vec<f64>>,
    /// Direction of the row.
    pub sense: Sense,
    /// Right-hand side.
    pub rhs: f64,
}

impl ConstraintSpec {
    /// A fixed-total row: the sum of every component must equal `total`.
    pub fn fixed_total(total: f64) -> ConstraintSpec {
        ConstraintSpec {
            coefficients: None,
            sense: Sense::Eq,
            rhs: total,
        }
    }

    /// Whether this row pins the node total exactly.
    pub fn is_fixed_total(&self) -> bool {
        self.sense == Sense::Eq
            && match &self.coefficients {
                None => true,
                Some(c) => c.iter().all(|v| *v == 1.0),
            }
    }

    fn to_constraint(&self, basis_len: usize) -> Result<Constraint> {
        let terms = match &self.coefficients {
            None => (0..basis_len).map(|i| (i, 1.0)).collect(),
            Some(coefficients) => {
                if coefficients.len() != basis_len {
                    return Err(TopDownError::Config(format!(
                        "constraint row has {} coefficients but the basis has {basis_len} rows",
                        coefficients.len()
                    )));
                }
                coefficients
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| **c != 0.0)
                    .map(|(i, c)| (i, *c))
                    .collect()
            }
        };
        Ok(Constraint {
            terms,
            sense: self.sense,
            rhs: self.rhs,
        })
    }
}

/// Everything a run needs, normally read from a JSON file by the driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// Path of the raw census file.
    pub data_path: PathBuf,
    /// Directory the synthetic microdata is written into.
    pub output_path: PathBuf,
    /// File name of the synthetic microdata within `output_path`.
    pub output_file: String,
    /// Checkpoint file; defaults to `topdown.state` under `output_path`.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    /// CSV field separator of both input and output.
    #[serde(default = "default_separator")]
    pub separator: char,
    /// Geographic column names, coarsest first.
    pub geo_columns: Vec<String>,
    /// Tree depth to process; at most `geo_columns.len()`.
    pub process_until: usize,
    /// Query column names, in basis order.
    pub queries: Vec<String>,
    /// Per-level privacy budgets, root first.
    pub privacy_parameters: Vec<f64>,
    /// Noise mechanism.
    pub mechanism: Mechanism,
    /// Rows applied to the root problem only.
    #[serde(default)]
    pub root_constraints: Vec<ConstraintSpec>,
    /// Rows applied to every node at the keyed geographic column's level.
    #[serde(default)]
    pub geo_constraints: BTreeMap<String, Vec<ConstraintSpec>>,
    /// Distance for the quality report.
    #[serde(default)]
    pub distance_metric: DistanceMetric,
    /// Seed for the noise source; drawn from the OS when absent and
    /// persisted in the checkpoint either way.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_separator() -> char {
    ';'
}

impl RunConfig {
    /// Reads a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<RunConfig> {
        let file = std::fs::File::open(path).map_err(|e| {
            TopDownError::Config(format!("cannot open {}: {e}", path.display()))
        })?;
        let config: RunConfig = serde_json::from_reader(io::BufReader::new(file))
            .map_err(|e| TopDownError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the internal consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.geo_columns.is_empty() {
            return Err(TopDownError::Config("no geographic columns declared".into()));
        }
        if self.queries.is_empty() {
            return Err(TopDownError::Config("no query columns declared".into()));
        }
        if self.process_until == 0 || self.process_until > self.geo_columns.len() {
            return Err(TopDownError::Config(format!(
                "process_until must be between 1 and {}, got {}",
                self.geo_columns.len(),
                self.process_until
            )));
        }
        for column in self.geo_constraints.keys() {
            if !self.geo_columns.contains(column) {
                return Err(TopDownError::Config(format!("unknown attribute {column}")));
            }
        }
        for (a, b) in [
            (&self.geo_columns, "geographic"),
            (&self.queries, "query"),
        ] {
            let mut seen = std::collections::HashSet::new();
            for name in a {
                if !seen.insert(name) {
                    return Err(TopDownError::Config(format!("duplicate {b} column {name}")));
                }
            }
        }
        if let Some(shared) = self.queries.iter().find(|q| self.geo_columns.contains(*q)) {
            return Err(TopDownError::Config(format!(
                "column {shared} is declared both geographic and query"
            )));
        }
        Ok(())
    }

    /// Whether the root is pinned by a fixed-total constraint, which is
    /// also the condition under which measurement leaves it noise-free.
    pub fn fixed_root(&self) -> bool {
        self.root_constraints.iter().any(ConstraintSpec::is_fixed_total)
    }

    /// The 1-based tree level of a geographic column.
    pub fn level_of(&self, column: &str) -> Option<usize> {
        self.geo_columns.iter().position(|c| c == column).map(|p| p + 1)
    }

    /// Materializes all declared rows over a basis of the given width.
    pub fn estimation_plan(&self, basis_len: usize) -> Result<EstimationPlan> {
        let root = self
            .root_constraints
            .iter()
            .map(|spec| spec.to_constraint(basis_len))
            .collect::<Result<Vec<_>>>()?;
        let mut per_level = vec![Vec::new(); self.geo_columns.len() + 1];
        for (column, specs) in &self.geo_constraints {
            let level = self
                .level_of(column)
                .ok_or_else(|| TopDownError::Config(format!("unknown attribute {column}")))?;
            per_level[level] = specs
                .iter()
                .map(|spec| spec.to_constraint(basis_len))
                .collect::<Result<Vec<_>>>()?;
        }
        Ok(EstimationPlan { root, per_level })
    }

    /// The checkpoint file location.
    pub fn state_file(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.output_path.join("topdown.state"))
    }

    /// The synthetic microdata file location.
    pub fn output_file_path(&self) -> PathBuf {
        self.output_path.join(&self.output_file)
    }

    /// Splits a total budget across `levels` levels proportionally to
    /// `2^level`, so the leaves (the level published at full geographic
    /// detail) receive the largest share.
    pub fn exponential_budget(total: f64, levels: usize) -> Vec<f64> {
        let denominator = (1u64 << levels).wrapping_sub(1) as f64;
        (0..levels)
            .map(|level| total * (1u64 << level) as f64 / denominator)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RunConfig {
        RunConfig {
            data_path: PathBuf::from("census.csv"),
            output_path: PathBuf::from("out"),
            output_file: "synthetic.csv".into(),
            state_path: None,
            separator: ';',
            geo_columns: vec!["REGION".into(), "COMUNA".into()],
            process_until: 2,
            queries: vec!["P08".into()],
            privacy_parameters: vec![0.1, 0.2, 0.4],
            mechanism: Mechanism::DiscreteLaplace,
            root_constraints: Vec::new(),
            geo_constraints: BTreeMap::new(),
            distance_metric: DistanceMetric::None,
            seed: Some(1),
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn depth_must_fit_the_hierarchy() {
        let mut config = base_config();
        config.process_until = 3;
        assert!(matches!(config.validate(), Err(TopDownError::Config(_))));
    }

    #[test]
    fn unknown_constraint_column_is_rejected() {
        let mut config = base_config();
        config
            .geo_constraints
            .insert("PROVINCIA".into(), vec![ConstraintSpec::fixed_total(5.0)]);
        assert!(matches!(config.validate(), Err(TopDownError::Config(_))));
    }

    #[test]
    fn fixed_root_detection() {
        let mut config = base_config();
        assert!(!config.fixed_root());
        config.root_constraints.push(ConstraintSpec {
            coefficients: Some(vec![1.0, 0.0]),
            sense: Sense::Eq,
            rhs: 3.0,
        });
        assert!(!config.fixed_root());
        config.root_constraints.push(ConstraintSpec::fixed_total(100.0));
        assert!(config.fixed_root());
    }

    #[test]
    fn plan_expands_shorthand_rows() {
        let mut config = base_config();
        config.root_constraints.push(ConstraintSpec::fixed_total(100.0));
        config
            .geo_constraints
            .insert("COMUNA".into(), vec![ConstraintSpec::fixed_total(10.0)]);
        let plan = config.estimation_plan(4).unwrap();
        assert_eq!(plan.root.len(), 1);
        assert_eq!(plan.root[0].terms.len(), 4);
        assert!(plan.per_level[1].is_empty());
        assert_eq!(plan.per_level[2].len(), 1);
    }

    #[test]
    fn exponential_budget_sums_to_the_total() {
        let budgets = RunConfig::exponential_budget(10.0, 6);
        assert_eq!(budgets.len(), 6);
        let total: f64 = budgets.iter().sum();
        assert!((total - 10.0).abs() < 1e-9);
        assert!(budgets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = base_config();
        let text = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&text).unwrap();
        back.validate().unwrap();
        assert_eq!(back.geo_columns, config.geo_columns);
        assert_eq!(back.mechanism, config.mechanism);
    }
}
