//! Persistence of intermediate state, so a finished phase never has to be
//! recomputed and a run can later be deepened.
//!
//! The on-disk format is a small magic-plus-version header followed by a
//! bincode body. The noise source's full state is persisted too, which is
//! what makes a resumed extension draw the exact random sequence a fresh,
//! deeper run would have drawn.

use crate::config::RunConfig;
use crate::data::Dataset;
use crate::tree::{GeoNode, GeoTree};
use crate::{Result, TopDownError};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"TDST";
const VERSION: u32 = 1;

/// One node of the persisted tree, with values resolved to strings so the
/// file does not depend on interner ordering.
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Geographic path values from the root down, resolved.
    pub path: Vec<String>,
    /// Arena indices of the children.
    pub children: Vec<usize>,
    /// True counts.
    pub v_true: Vec<i64>,
    /// Noisy counts, if measurement reached this node.
    pub v_noisy: Option<Vec<i64>>,
    /// Estimated counts, if estimation reached this node.
    pub v_est: Option<Vec<i64>>,
}

/// Everything needed to pick a run back up.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The configuration the state was produced under.
    pub config: RunConfig,
    /// The seed the noise source started from.
    pub seed: u64,
    /// The noise source state as of the last completed phase.
    pub rng: ChaCha20Rng,
    /// Resolved basis domains, one list of values per query column.
    pub domains: Vec<Vec<String>>,
    /// Processed depth of the persisted tree.
    pub depth: usize,
    /// Nodes in arena order; index 0 is the root.
    pub nodes: Vec<NodeRecord>,
}

impl Checkpoint {
    /// Captures the current engine state.
    pub fn capture(
        config: &RunConfig,
        seed: u64,
        rng: &ChaCha20Rng,
        domains: &[Vec<lasso::Spur>],
        tree: &GeoTree,
        dataset: &Dataset,
    ) -> Checkpoint {
        let nodes = (0..tree.len())
            .map(|idx| {
                let node = tree.node(idx);
                NodeRecord {
                    path: node
                        .path
                        .iter()
                        .map(|v| dataset.resolve(*v).to_owned())
                        .collect(),
                    children: node.children.clone(),
                    v_true: node.v_true.clone(),
                    v_noisy: node.v_noisy.clone(),
                    v_est: node.v_est.clone(),
                }
            })
            .collect();
        Checkpoint {
            config: config.clone(),
            seed,
            rng: rng.clone(),
            domains: domains
                .iter()
                .map(|d| d.iter().map(|v| dataset.resolve(*v).to_owned()).collect())
                .collect(),
            depth: tree.depth(),
            nodes,
        }
    }

    /// Rebuilds the tree and basis domains against a freshly loaded
    /// dataset, interning the persisted strings.
    pub fn restore(&self, dataset: &mut Dataset) -> (GeoTree, Vec<Vec<lasso::Spur>>) {
        let nodes = self
            .nodes
            .iter()
            .map(|record| GeoNode {
                path: record
                    .path
                    .iter()
                    .map(|v| dataset.intern(v))
                    .collect::<SmallVec<[lasso::Spur; 8]>>(),
                level: record.path.len(),
                children: record.children.clone(),
                v_true: record.v_true.clone(),
                v_noisy: record.v_noisy.clone(),
                v_est: record.v_est.clone(),
            })
            .collect();
        let domains = self
            .domains
            .iter()
            .map(|d| d.iter().map(|v| dataset.intern(v)).collect())
            .collect();
        (GeoTree::from_parts(nodes, self.depth), domains)
    }

    /// Rejects state captured under a different hierarchy or basis.
    pub fn check_compatible(&self, config: &RunConfig) -> Result<()> {
        if self.config.geo_columns != config.geo_columns {
            return Err(TopDownError::State(format!(
                "checkpoint hierarchy {:?} does not match configured {:?}",
                self.config.geo_columns, config.geo_columns
            )));
        }
        if self.config.queries != config.queries {
            return Err(TopDownError::State(format!(
                "checkpoint queries {:?} do not match configured {:?}",
                self.config.queries, config.queries
            )));
        }
        if self.config.mechanism != config.mechanism {
            return Err(TopDownError::State(
                "checkpoint was produced under a different mechanism".into(),
            ));
        }
        Ok(())
    }
}

/// Writes the state to `path`, replacing any previous file only once the
/// new one is complete.
pub fn save_state(checkpoint: &Checkpoint, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("state.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        bincode::serialize_into(&mut writer, checkpoint)
            .map_err(|e| TopDownError::State(format!("cannot encode checkpoint: {e}")))?;
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), "checkpoint written");
    Ok(())
}

/// Reads state written by [`save_state`], rejecting unknown versions.
pub fn load_state(path: &Path) -> Result<Checkpoint> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| {
        TopDownError::State(format!("cannot open checkpoint {}: {e}", path.display()))
    })?);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(TopDownError::State(format!(
            "{} is not a checkpoint file",
            path.display()
        )));
    }
    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != VERSION {
        return Err(TopDownError::State(format!(
            "checkpoint version {version} is not supported (expected {VERSION})"
        )));
    }
    bincode::deserialize_from(&mut reader)
        .map_err(|e| TopDownError::State(format!("corrupt checkpoint: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::Basis;
    use crate::config::{DistanceMetric, Mechanism};
    use rand::SeedableRng;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn config() -> RunConfig {
        RunConfig {
            data_path: PathBuf::from("census.csv"),
            output_path: PathBuf::from("out"),
            output_file: "synthetic.csv".into(),
            state_path: None,
            separator: ';',
            geo_columns: vec!["R".into()],
            process_until: 1,
            queries: vec!["SEX".into()],
            privacy_parameters: vec![1.0, 1.0],
            mechanism: Mechanism::DiscreteLaplace,
            root_constraints: Vec::new(),
            geo_constraints: BTreeMap::new(),
            distance_metric: DistanceMetric::None,
            seed: Some(1),
        }
    }

    fn dataset() -> Dataset {
        let csv = "R;SEX\n1;1\n1;2\n2;1\n";
        Dataset::load(
            csv.as_bytes(),
            &["R".to_string()],
            &["SEX".to_string()],
            b';',
        )
        .unwrap()
    }

    #[test]
    fn state_round_trips() {
        let mut data = dataset();
        let domains = data.query_domains();
        let basis = Basis::new(domains.clone());
        let mut tree = GeoTree::build(&data, &basis, 1).unwrap();
        tree.node_mut(0).v_noisy = Some(vec![2, 1]);

        let rng = ChaCha20Rng::seed_from_u64(7);
        let checkpoint = Checkpoint::capture(&config(), 7, &rng, &domains, &tree, &data);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.state");
        save_state(&checkpoint, &path).unwrap();
        let loaded = load_state(&path).unwrap();

        loaded.check_compatible(&config()).unwrap();
        let (restored, restored_domains) = loaded.restore(&mut data);
        assert_eq!(restored.len(), tree.len());
        assert_eq!(restored.depth(), 1);
        assert_eq!(restored.node(0).v_noisy, Some(vec![2, 1]));
        assert_eq!(restored.node(0).children, tree.node(0).children);
        assert_eq!(restored_domains, domains);
        assert_eq!(loaded.rng, rng);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.state");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&99u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        let err = load_state(&path).unwrap_err();
        assert!(matches!(err, TopDownError::State(_)));
    }

    #[test]
    fn incompatible_config_is_rejected() {
        let data = dataset();
        let domains = data.query_domains();
        let basis = Basis::new(domains.clone());
        let tree = GeoTree::build(&data, &basis, 1).unwrap();
        let rng = ChaCha20Rng::seed_from_u64(7);
        let checkpoint = Checkpoint::capture(&config(), 7, &rng, &domains, &tree, &data);

        let mut other = config();
        other.queries = vec!["AGE".into()];
        assert!(checkpoint.check_compatible(&other).is_err());
    }
}
