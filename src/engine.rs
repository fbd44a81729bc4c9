//! The phased orchestrator: build, measure, estimate, publish, with a
//! checkpoint flushed after every phase.

use crate::basis::Basis;
use crate::checkpoint::{self, Checkpoint};
use crate::config::RunConfig;
use crate::data::Dataset;
use crate::estimate::Estimator;
use crate::measure::Measurement;
use crate::microdata;
use crate::quality;
use crate::solver::ProjectionSolver;
use crate::tree::GeoTree;
use crate::{Result, TopDownError};
use lasso::Spur;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    /// Number of synthetic individuals written.
    pub individuals: u64,
    /// Number of tree nodes processed.
    pub nodes: usize,
    /// Depth the tree was processed to.
    pub depth: usize,
    /// Mean per-level distance between true and estimated vectors, when a
    /// distance metric is configured.
    pub distances: BTreeMap<usize, f64>,
    /// Chi-squared probability of wrongly rejecting that the published
    /// root counts follow the true distribution. 1.0 means a perfect fit.
    pub fit_alpha: f64,
}

/// The TopDown engine. Construct it with a validated configuration, then
/// call [`TopDown::run`] for a fresh run or [`TopDown::resume_run`] to
/// continue from a checkpoint.
pub struct TopDown {
    config: RunConfig,
    cancel: Arc<AtomicBool>,
}

struct RunState {
    dataset: Dataset,
    domains: Vec<Vec<Spur>>,
    basis: Basis,
    tree: GeoTree,
    seed: u64,
    rng: ChaCha20Rng,
}

impl TopDown {
    /// Validates the configuration and prepares an engine.
    pub fn new(config: RunConfig) -> Result<TopDown> {
        config.validate()?;
        if !config.separator.is_ascii() {
            return Err(TopDownError::Config(format!(
                "separator {:?} is not a single-byte character",
                config.separator
            )));
        }
        Ok(TopDown {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A flag that makes the engine stop at the next node boundary and
    /// flush a checkpoint. Safe to set from another thread.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// The configuration this engine runs under.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the whole pipeline from the raw records.
    pub fn run(&self) -> Result<RunSummary> {
        tracing::info!(data = %self.config.data_path.display(), "starting fresh run");
        let dataset = Dataset::from_path(
            &self.config.data_path,
            &self.config.geo_columns,
            &self.config.queries,
            self.config.separator as u8,
        )?;
        tracing::info!(records = dataset.records().len(), "raw records loaded");

        let domains = dataset.query_domains();
        let basis = Basis::new(domains.clone());
        tracing::info!(rows = basis.len(), "permutation basis computed");

        let tree = GeoTree::build(&dataset, &basis, self.config.process_until)?;
        tracing::info!(nodes = tree.len(), depth = tree.depth(), "geographic tree built");

        let seed = match self.config.seed {
            Some(seed) => seed,
            None => rand::rngs::OsRng.next_u64(),
        };
        let state = RunState {
            rng: ChaCha20Rng::seed_from_u64(seed),
            dataset,
            domains,
            basis,
            tree,
            seed,
        };
        self.save(&state)?;
        self.finish(state)
    }

    /// Continues a checkpointed run, deepening the tree first when the
    /// configured depth exceeds the persisted one.
    pub fn resume_run(&self) -> Result<RunSummary> {
        let path = self.config.state_file();
        tracing::info!(state = %path.display(), "resuming from checkpoint");
        let saved = checkpoint::load_state(&path)?;
        saved.check_compatible(&self.config)?;

        let mut dataset = Dataset::from_path(
            &self.config.data_path,
            &self.config.geo_columns,
            &self.config.queries,
            self.config.separator as u8,
        )?;
        let (mut tree, domains) = saved.restore(&mut dataset);
        if self.config.process_until < tree.depth() {
            return Err(TopDownError::State(format!(
                "checkpoint was processed to depth {} but the configuration asks for {}",
                tree.depth(),
                self.config.process_until
            )));
        }

        let basis = Basis::new(domains.clone());
        if self.config.process_until > tree.depth() {
            tree.extend(&dataset, &basis, self.config.process_until)?;
            tracing::info!(depth = tree.depth(), nodes = tree.len(), "tree extended");
        }

        let state = RunState {
            dataset,
            domains,
            basis,
            tree,
            seed: saved.seed,
            rng: saved.rng,
        };
        self.finish(state)
    }

    /// Measurement, estimation and publication over prepared state. Phases
    /// skip nodes an earlier run already finished, so this is the shared
    /// tail of both fresh and resumed runs.
    fn finish(&self, mut state: RunState) -> Result<RunSummary> {
        self.check_cancelled(&state, "measurement")?;
        let measurement = Measurement::new(
            self.config.mechanism,
            &self.config.privacy_parameters,
            state.tree.depth() + 1,
        )?;
        measurement.apply(&mut state.tree, &mut state.rng, self.config.fixed_root())?;
        tracing::info!("measurement phase complete");
        self.save(&state)?;

        self.check_cancelled(&state, "estimation")?;
        let plan = self.config.estimation_plan(state.basis.len())?;
        let solver = ProjectionSolver::default();
        let estimator = Estimator::new(&solver, &plan);
        match estimator.run(&mut state.tree, &state.dataset, &self.cancel) {
            Ok(()) => {}
            Err(err @ (TopDownError::Interrupted(_) | TopDownError::Infeasible { .. })) => {
                // Leave the partial estimates behind for inspection or a
                // later resume.
                self.save(&state)?;
                return Err(err);
            }
            Err(err) => return Err(err),
        }
        tracing::info!("estimation phase complete");
        self.save(&state)?;

        std::fs::create_dir_all(&self.config.output_path)?;
        let output_path = self.config.output_file_path();
        let mut writer = BufWriter::new(File::create(&output_path)?);
        let individuals = microdata::write_microdata(
            &state.tree,
            &state.basis,
            &state.dataset,
            self.config.separator,
            &mut writer,
        )?;
        tracing::info!(output = %output_path.display(), individuals, "run complete");

        let distances =
            quality::mean_distance_by_level(&state.tree, self.config.distance_metric);
        for (level, distance) in &distances {
            tracing::info!(level = *level, distance = *distance, "mean distance between true and estimated");
        }

        let root = state.tree.node(0);
        let fit_alpha = quality::goodness_of_fit_alpha(
            root.v_est.as_deref().unwrap_or(&root.v_true),
            &root.v_true,
        );
        tracing::info!(fit_alpha, "root goodness of fit");

        Ok(RunSummary {
            individuals,
            nodes: state.tree.len(),
            depth: state.tree.depth(),
            distances,
            fit_alpha,
        })
    }

    fn save(&self, state: &RunState) -> Result<()> {
        let snapshot = Checkpoint::capture(
            &self.config,
            state.seed,
            &state.rng,
            &state.domains,
            &state.tree,
            &state.dataset,
        );
        checkpoint::save_state(&snapshot, &self.config.state_file())
    }

    fn check_cancelled(&self, state: &RunState, phase: &str) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            self.save(state)?;
            Err(TopDownError::Interrupted(phase.to_owned()))
        } else {
            Ok(())
        }
    }
}
