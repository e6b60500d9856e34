/// Per-sequence binary trees of candidate domain boundaries
///
/// Trees are read from a flat record stream
/// `nid node parent level from to`, sorted by nid and then by node, with the
/// root (node 0) first for every sequence. Nodes are stored in input order;
/// parent references are resolved through the record node numbers.
use anyhow::{bail, Context, Result};
use log::debug;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::str::FromStr;

use crate::input::open_text_input;
use crate::sequence_index::{Nid, SequenceMap};

/// Residue coordinate. Signed, as differences between residues may be negative.
pub type Residue = i32;

/// Storage index of a node inside its sequence's tree
pub type NodeId = usize;

/// Storage index of the root of every tree
pub const ROOT: NodeId = 0;

/// A residue range `[from, to)` with up to two children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNode {
    pub parent: Option<NodeId>,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    pub from: Residue,
    pub to: Residue,
}

impl TreeNode {
    fn new(from: Residue, to: Residue) -> Self {
        TreeNode {
            parent: None,
            left: None,
            right: None,
            from,
            to,
        }
    }

    /// Children in slot order (left first)
    pub fn children(&self) -> impl Iterator<Item = NodeId> {
        self.left.into_iter().chain(self.right)
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// One line of the segmentation record stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRecord {
    pub nid: Nid,
    pub node: i64,
    pub parent: i64,
    pub level: i32,
    pub from: Residue,
    pub to: Residue,
}

impl FromStr for SegmentRecord {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            bail!(
                "segment record has {} fields, expected 6 (nid node parent level from to)",
                fields.len()
            );
        }

        Ok(SegmentRecord {
            nid: fields[0].parse().context("invalid nid")?,
            node: fields[1].parse().context("invalid node")?,
            parent: fields[2].parse().context("invalid parent")?,
            level: fields[3].parse().context("invalid level")?,
            from: fields[4].parse().context("invalid from")?,
            to: fields[5].parse().context("invalid to")?,
        })
    }
}

/// Segmentation tree of one sequence; empty if the sequence had no records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentationTree {
    nodes: Vec<TreeNode>,
}

impl SegmentationTree {
    pub fn root(&self) -> Option<&TreeNode> {
        self.nodes.first()
    }

    /// Node by storage index (panics if invalid)
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Find the node spanning exactly `[from, to)` by descending from the root
    pub fn find_span(&self, from: Residue, to: Residue) -> Option<NodeId> {
        let mut current = ROOT;
        loop {
            let node = self.nodes.get(current)?;
            if node.from == from && node.to == to {
                return Some(current);
            }
            current = node.children().find(|&child| {
                let child = &self.nodes[child];
                child.from <= from && to <= child.to
            })?;
        }
    }

    /// Check that every binary node is split into two adjacent children that
    /// together cover exactly its own range
    pub fn check_continuity(&self) -> Result<()> {
        for (id, node) in self.nodes.iter().enumerate() {
            for child in node.children() {
                if self.nodes[child].parent != Some(id) {
                    bail!("node {child} is listed as child of {id} but has another parent");
                }
            }

            if let (Some(left), Some(right)) = (node.left, node.right) {
                let (a, b) = if self.nodes[left].from <= self.nodes[right].from {
                    (&self.nodes[left], &self.nodes[right])
                } else {
                    (&self.nodes[right], &self.nodes[left])
                };
                if a.from != node.from || a.to != b.from || b.to != node.to {
                    bail!(
                        "children {}-{} and {}-{} do not partition node {} ({}-{})",
                        a.from,
                        a.to,
                        b.from,
                        b.to,
                        id,
                        node.from,
                        node.to
                    );
                }
            }
        }
        Ok(())
    }

    /// Resolve parent references and fill child slots
    fn link(&mut self, record_nodes: &[i64], record_parents: &[i64]) -> Result<()> {
        if record_nodes.first() != Some(&0) {
            bail!(
                "first node is {}, expected root node 0",
                record_nodes.first().copied().unwrap_or_default()
            );
        }

        let mut storage_of: HashMap<i64, NodeId> = HashMap::with_capacity(record_nodes.len());
        for (id, &node) in record_nodes.iter().enumerate() {
            if storage_of.insert(node, id).is_some() {
                bail!("node {node} listed twice");
            }
        }

        for id in 1..self.nodes.len() {
            let parent_node = record_parents[id];
            let parent = match storage_of.get(&parent_node) {
                Some(&parent) if parent != id => parent,
                _ => bail!(
                    "node {} refers to unknown parent {}",
                    record_nodes[id],
                    parent_node
                ),
            };

            self.nodes[id].parent = Some(parent);
            let slots = &mut self.nodes[parent];
            if slots.left.is_none() {
                slots.left = Some(id);
            } else if slots.right.is_none() {
                slots.right = Some(id);
            } else {
                bail!("node {parent_node} has more than two children");
            }
        }
        Ok(())
    }
}

/// Segmentation trees for all sequences of a working set, by sequence index
#[derive(Debug, Clone, Default)]
pub struct SegmentationForest {
    trees: Vec<SegmentationTree>,
}

impl SegmentationForest {
    /// Build trees from records in input order
    ///
    /// Records of nids outside `sequences` are dropped.
    pub fn build<I>(records: I, sequences: &SequenceMap) -> Result<Self>
    where
        I: IntoIterator<Item = SegmentRecord>,
    {
        let mut trees = vec![SegmentationTree::default(); sequences.len()];
        let mut record_nodes: Vec<Vec<i64>> = vec![Vec::new(); sequences.len()];
        let mut record_parents: Vec<Vec<i64>> = vec![Vec::new(); sequences.len()];

        let mut skipped = 0usize;
        for record in records {
            let Some(index) = sequences.index_of(record.nid) else {
                skipped += 1;
                continue;
            };
            trees[index].nodes.push(TreeNode::new(record.from, record.to));
            record_nodes[index].push(record.node);
            record_parents[index].push(record.parent);
        }
        if skipped > 0 {
            debug!("skipped {skipped} segment records of sequences outside the working set");
        }

        for (index, tree) in trees.iter_mut().enumerate() {
            if tree.is_empty() {
                continue;
            }
            tree.link(&record_nodes[index], &record_parents[index])
                .with_context(|| format!("building tree of nid {}", sequences.nid(index)))?;
        }

        Ok(SegmentationForest { trees })
    }

    /// Read trees from a segmentation record file
    pub fn read<P: AsRef<Path>>(path: P, sequences: &SequenceMap) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_text_input(path)?;
        Self::parse(reader, sequences).with_context(|| format!("reading trees from {}", path.display()))
    }

    /// Parse a record stream, skipping `#` comments and the `nid` header line
    pub fn parse<R: BufRead>(reader: R, sequences: &SequenceMap) -> Result<Self> {
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('n') {
                continue;
            }
            let record: SegmentRecord = trimmed
                .parse()
                .with_context(|| format!("line {}", lineno + 1))?;
            records.push(record);
        }
        Self::build(records, sequences)
    }

    /// Tree of a sequence index (panics if invalid)
    pub fn tree(&self, index: usize) -> &SegmentationTree {
        &self.trees[index]
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Number of sequences that received at least one node
    pub fn num_trees(&self) -> usize {
        self.trees.iter().filter(|tree| !tree.is_empty()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentationTree> {
        self.trees.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sequences() -> SequenceMap {
        SequenceMap::from_nids([10, 20]).unwrap()
    }

    #[test]
    fn test_build_two_level_tree() -> Result<()> {
        let input = "nid\tnode\tparent\tlevel\txfrom\txto\n\
                     # comment\n\
                     10\t0\t0\t0\t0\t100\n\
                     10\t1\t0\t1\t0\t40\n\
                     10\t2\t0\t1\t40\t100\n\
                     10\t3\t2\t2\t40\t70\n\
                     10\t4\t2\t2\t70\t100\n\
                     99\t0\t0\t0\t0\t10\n";
        let forest = SegmentationForest::parse(Cursor::new(input), &sequences())?;

        assert_eq!(forest.len(), 2);
        assert_eq!(forest.num_trees(), 1);
        assert!(forest.tree(1).is_empty());

        let tree = forest.tree(0);
        assert_eq!(tree.len(), 5);
        let root = tree.root().unwrap();
        assert_eq!((root.left, root.right), (Some(1), Some(2)));
        assert_eq!(root.parent, None);
        assert!(tree.node(1).is_leaf());
        assert_eq!(tree.node(2).children().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(tree.node(4).parent, Some(2));
        tree.check_continuity()?;
        Ok(())
    }

    #[test]
    fn test_root_is_never_mistaken_for_missing_child() -> Result<()> {
        // Every non-root node of this chain hangs off its predecessor; the
        // root gets exactly one child and the leaf none.
        let input = "10 0 0 0 0 100\n10 1 0 1 0 80\n10 2 1 2 0 60\n";
        let forest = SegmentationForest::parse(Cursor::new(input), &sequences())?;
        let tree = forest.tree(0);

        assert_eq!(tree.node(0).children().collect::<Vec<_>>(), vec![1]);
        assert_eq!(tree.node(1).children().collect::<Vec<_>>(), vec![2]);
        assert!(tree.node(2).is_leaf());
        for node in tree.nodes() {
            assert!(node.children().all(|child| child != ROOT));
        }
        Ok(())
    }

    #[test]
    fn test_third_child_is_rejected() {
        let input = "10 0 0 0 0 90\n10 1 0 1 0 30\n10 2 0 1 30 60\n10 3 0 1 60 90\n";
        let err = SegmentationForest::parse(Cursor::new(input), &sequences()).unwrap_err();
        assert!(format!("{err:#}").contains("more than two children"));
    }

    #[test]
    fn test_malformed_records_are_rejected() {
        assert!(SegmentationForest::parse(Cursor::new("10 0 0 0 0\n"), &sequences()).is_err());
        assert!(SegmentationForest::parse(Cursor::new("10 0 0 0 x 9\n"), &sequences()).is_err());
        assert!(SegmentationForest::parse(Cursor::new("10 1 0 0 0 9\n"), &sequences()).is_err());
        assert!(
            SegmentationForest::parse(Cursor::new("10 0 0 0 0 9\n10 1 7 1 0 5\n"), &sequences())
                .is_err()
        );
    }

    #[test]
    fn test_continuity_violation_is_reported() -> Result<()> {
        let input = "10 0 0 0 0 100\n10 1 0 1 0 40\n10 2 0 1 50 100\n";
        let forest = SegmentationForest::parse(Cursor::new(input), &sequences())?;
        assert!(forest.tree(0).check_continuity().is_err());
        Ok(())
    }

    #[test]
    fn test_find_span() -> Result<()> {
        let input = "10 0 0 0 0 100\n10 1 0 1 0 40\n10 2 0 1 40 100\n10 3 2 2 40 70\n10 4 2 2 70 100\n";
        let forest = SegmentationForest::parse(Cursor::new(input), &sequences())?;
        let tree = forest.tree(0);

        assert_eq!(tree.find_span(0, 100), Some(0));
        assert_eq!(tree.find_span(70, 100), Some(4));
        assert_eq!(tree.find_span(0, 40), Some(1));
        assert_eq!(tree.find_span(40, 60), None);
        Ok(())
    }
}
