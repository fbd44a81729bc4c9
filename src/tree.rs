//! The rooted tree of nested administrative divisions.
//!
//! Each node carries up to three contingency vectors over the shared
//! permutation basis: the true counts aggregated from the raw records, the
//! noisy counts written by measurement, and the estimated counts written by
//! estimation. `v_true` is immutable after construction; the other two are
//! written exactly once each by their phase.

use crate::basis::Basis;
use crate::data::{Dataset, Record};
use crate::{Result, TopDownError};
use lasso::Spur;
use smallvec::SmallVec;
use std::collections::HashMap;

/// A single geographic division, identified by the sequence of
/// geographic-attribute values from the root down to it.
#[derive(Clone, Debug)]
pub struct GeoNode {
    /// Geographic values from the root to this node; empty for the root.
    pub path: SmallVec<[Spur; 8]>,
    /// Depth of this node; equals `path.len()`.
    pub level: usize,
    /// Arena indices of the children, in lexicographic order of their
    /// final path component.
    pub children: Vec<usize>,
    /// True counts per basis row.
    pub v_true: Vec<i64>,
    /// Noisy counts, present once measurement has visited this node.
    pub v_noisy: Option<Vec<i64>>,
    /// Estimated counts, present once estimation has visited this node.
    pub v_est: Option<Vec<i64>>,
}

/// The geographic hierarchy, stored as an arena with the root at index 0.
pub struct GeoTree {
    nodes: Vec<GeoNode>,
    depth: usize,
}

impl GeoTree {
    /// Constructs the tree down to `depth` levels below the root.
    ///
    /// Records are grouped by their first geographic attribute, then within
    /// each group by the second, and so on. Sibling order is lexicographic
    /// by resolved value, which makes every traversal of the tree
    /// deterministic.
    pub fn build(dataset: &Dataset, basis: &Basis, depth: usize) -> Result<GeoTree> {
        if depth > dataset.geo_columns().len() {
            return Err(TopDownError::Config(format!(
                "cannot process until level {depth}: only {} geographic columns declared",
                dataset.geo_columns().len()
            )));
        }
        let all: Vec<u32> = (0..dataset.records().len() as u32).collect();
        let root = GeoNode {
            path: SmallVec::new(),
            level: 0,
            children: Vec::new(),
            v_true: count_vector(dataset.records(), &all, basis)?,
            v_noisy: None,
            v_est: None,
        };
        let mut tree = GeoTree {
            nodes: vec![root],
            depth: 0,
        };
        if depth > 0 {
            tree.grow(dataset, basis, depth)?;
        }
        Ok(tree)
    }

    /// Grows children below the current leaves until the tree reaches
    /// `new_depth`, using the original raw records. Existing nodes and
    /// their vectors are left untouched.
    pub fn extend(&mut self, dataset: &Dataset, basis: &Basis, new_depth: usize) -> Result<()> {
        if new_depth <= self.depth {
            return Err(TopDownError::Config(format!(
                "extension depth {new_depth} does not exceed current depth {}",
                self.depth
            )));
        }
        if new_depth > dataset.geo_columns().len() {
            return Err(TopDownError::Config(format!(
                "cannot extend to level {new_depth}: only {} geographic columns declared",
                dataset.geo_columns().len()
            )));
        }
        self.grow(dataset, basis, new_depth)
    }

    /// Walks record groups down the existing structure and builds the
    /// missing levels. Shared by construction and extension.
    fn grow(&mut self, dataset: &Dataset, basis: &Basis, new_depth: usize) -> Result<()> {
        let all: Vec<u32> = (0..dataset.records().len() as u32).collect();
        let mut frontier = vec![(0usize, all)];

        while let Some((idx, indices)) = frontier.pop() {
            let level = self.nodes[idx].level;
            if level == new_depth {
                continue;
            }

            let mut groups: HashMap<Spur, Vec<u32>> = HashMap::new();
            for i in indices {
                let record = &dataset.records()[i as usize];
                let value = *record.geo.get(level).ok_or_else(|| {
                    TopDownError::Input(format!(
                        "record {i} is missing geographic attribute at level {}",
                        level + 1
                    ))
                })?;
                groups.entry(value).or_default().push(i);
            }

            if self.nodes[idx].children.is_empty() {
                // Fresh subtree: one child per distinct value, in
                // lexicographic order.
                let mut values: Vec<Spur> = groups.keys().copied().collect();
                dataset.sort_values(&mut values);
                for value in values {
                    let indices = groups.remove(&value).unwrap();
                    let mut path = self.nodes[idx].path.clone();
                    path.push(value);
                    let child = GeoNode {
                        path,
                        level: level + 1,
                        children: Vec::new(),
                        v_true: count_vector(dataset.records(), &indices, basis)?,
                        v_noisy: None,
                        v_est: None,
                    };
                    let child_idx = self.nodes.len();
                    self.nodes.push(child);
                    self.nodes[idx].children.push(child_idx);
                    frontier.push((child_idx, indices));
                }
            } else {
                // Existing level: hand each group to the child that was
                // built from it originally.
                for &child_idx in &self.nodes[idx].children.clone() {
                    let value = *self.nodes[child_idx].path.last().unwrap();
                    if let Some(indices) = groups.remove(&value) {
                        frontier.push((child_idx, indices));
                    }
                }
            }
        }

        self.depth = new_depth;
        Ok(())
    }

    /// Reassembles a tree from persisted nodes, e.g. when loading a
    /// checkpoint. The nodes must be in arena order with the root at 0.
    pub fn from_parts(nodes: Vec<GeoNode>, depth: usize) -> GeoTree {
        GeoTree { nodes, depth }
    }

    /// The processed depth of the tree; leaves live at this level.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the tree has no nodes, which never happens for a
    /// built tree (the root always exists).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node at the given arena index.
    pub fn node(&self, idx: usize) -> &GeoNode {
        &self.nodes[idx]
    }

    /// Mutable access to the node at the given arena index.
    pub fn node_mut(&mut self, idx: usize) -> &mut GeoNode {
        &mut self.nodes[idx]
    }

    /// Arena indices in breadth-first order, root first. Within a level,
    /// nodes appear in lexicographic path order.
    pub fn bfs(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = std::collections::VecDeque::from([0usize]);
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            queue.extend(self.nodes[idx].children.iter().copied());
        }
        order
    }

    /// Arena indices of the level-`depth` nodes, in lexicographic path
    /// order.
    pub fn leaves(&self) -> Vec<usize> {
        self.bfs()
            .into_iter()
            .filter(|&idx| self.nodes[idx].level == self.depth)
            .collect()
    }

    /// Renders a node's geographic path for error messages and logs.
    pub fn path_string(&self, idx: usize, dataset: &Dataset) -> String {
        let node = &self.nodes[idx];
        if node.path.is_empty() {
            return "root".to_owned();
        }
        node.path
            .iter()
            .map(|v| dataset.resolve(*v))
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Counts how many of the selected records fall in each basis row.
fn count_vector(records: &[Record], indices: &[u32], basis: &Basis) -> Result<Vec<i64>> {
    let mut counts = vec![0i64; basis.len()];
    for &i in indices {
        let record = &records[i as usize];
        let row = basis.index_of(&record.query).ok_or_else(|| {
            TopDownError::Input(format!(
                "record {i} carries a query value outside the computed basis"
            ))
        })?;
        counts[row] += 1;
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn small_dataset() -> Dataset {
        let csv = "\
REGION;COMUNA;SEX
1;101;1
1;101;2
1;102;1
2;201;2
2;201;2
2;202;1
";
        Dataset::load(
            csv.as_bytes(),
            &columns(&["REGION", "COMUNA"]),
            &columns(&["SEX"]),
            b';',
        )
        .unwrap()
    }

    #[test]
    fn parent_counts_are_child_sums() {
        let data = small_dataset();
        let basis = Basis::new(data.query_domains());
        let tree = GeoTree::build(&data, &basis, 2).unwrap();

        for &idx in &tree.bfs() {
            let node = tree.node(idx);
            if node.children.is_empty() {
                continue;
            }
            let mut sum = vec![0i64; basis.len()];
            for &c in &node.children {
                for (s, v) in sum.iter_mut().zip(&tree.node(c).v_true) {
                    *s += v;
                }
            }
            assert_eq!(sum, node.v_true, "node {idx}");
        }
        let total: i64 = tree.node(0).v_true.iter().sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn leaves_are_lexicographic() {
        let data = small_dataset();
        let basis = Basis::new(data.query_domains());
        let tree = GeoTree::build(&data, &basis, 2).unwrap();

        let paths: Vec<String> = tree
            .leaves()
            .iter()
            .map(|&idx| tree.path_string(idx, &data))
            .collect();
        assert_eq!(paths, vec!["1/101", "1/102", "2/201", "2/202"]);
    }

    #[test]
    fn extend_preserves_existing_nodes() {
        let data = small_dataset();
        let basis = Basis::new(data.query_domains());

        let mut shallow = GeoTree::build(&data, &basis, 1).unwrap();
        let before: Vec<Vec<i64>> = shallow
            .bfs()
            .iter()
            .map(|&idx| shallow.node(idx).v_true.clone())
            .collect();

        shallow.extend(&data, &basis, 2).unwrap();
        let full = GeoTree::build(&data, &basis, 2).unwrap();

        // Old nodes are bit-identical and new leaves match a fresh build.
        let shallow_bfs = shallow.bfs();
        for (i, v) in before.iter().enumerate() {
            assert_eq!(&shallow.node(shallow_bfs[i]).v_true, v);
        }
        assert_eq!(shallow.len(), full.len());
        let a: Vec<Vec<i64>> = shallow
            .bfs()
            .iter()
            .map(|&idx| shallow.node(idx).v_true.clone())
            .collect();
        let b: Vec<Vec<i64>> = full
            .bfs()
            .iter()
            .map(|&idx| full.node(idx).v_true.clone())
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn single_child_chain_is_valid() {
        let csv = "A;B;SEX\n1;10;1\n1;10;2\n";
        let data = Dataset::load(
            csv.as_bytes(),
            &columns(&["A", "B"]),
            &columns(&["SEX"]),
            b';',
        )
        .unwrap();
        let basis = Basis::new(data.query_domains());
        let tree = GeoTree::build(&data, &basis, 2).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.node(0).children.len(), 1);
    }
}
