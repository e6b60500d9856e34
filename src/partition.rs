/// Currently accepted domain boundaries of every sequence
///
/// Each sequence holds an ordered list of partitions that together form a
/// frontier through its segmentation tree. The optimizer mutates one list at
/// a time by replacing a partition with the partitions of its children.
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use crate::input::open_text_input;
use crate::segment_tree::{NodeId, Residue, SegmentationForest, SegmentationTree, ROOT};
use crate::sequence_index::{Nid, SequenceMap};

/// Line terminating a complete domain file
pub const END_OF_FILE: &str = "#//";

/// Header line of a domain file
pub const DOMAIN_HEADER: &str = "nid\tstart\tend";

/// A tree node accepted as domain, with its span copied for locality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub node: NodeId,
    pub from: Residue,
    pub to: Residue,
}

impl Partition {
    pub fn of_node(tree: &SegmentationTree, node: NodeId) -> Self {
        let tree_node = tree.node(node);
        Partition {
            node,
            from: tree_node.from,
            to: tree_node.to,
        }
    }

    /// Partitions of the children of this partition's node (left first)
    pub fn children(&self, tree: &SegmentationTree) -> Vec<Partition> {
        tree.node(self.node)
            .children()
            .map(|child| Partition::of_node(tree, child))
            .collect()
    }

    pub fn len(&self) -> Residue {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }
}

/// Partition lists by sequence index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSet {
    partitions: Vec<Vec<Partition>>,
}

impl PartitionSet {
    /// One partition per sequence covering its tree root; sequences without
    /// a tree get no partitions
    pub fn initial(forest: &SegmentationForest) -> Self {
        let partitions = forest
            .iter()
            .map(|tree| {
                if tree.is_empty() {
                    Vec::new()
                } else {
                    vec![Partition::of_node(tree, ROOT)]
                }
            })
            .collect();
        PartitionSet { partitions }
    }

    /// Partitions of a sequence index (panics if invalid)
    pub fn get(&self, index: usize) -> &[Partition] {
        &self.partitions[index]
    }

    /// Replace the partition at `position` of sequence `index` by `children`
    pub fn split(&mut self, index: usize, position: usize, children: &[Partition]) {
        self.partitions[index].splice(position..=position, children.iter().copied());
    }

    /// Number of sequences
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Total number of partitions over all sequences
    pub fn num_partitions(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    /// Write the domain file: header, one `nid start end` line per partition in
    /// sequence index order, end-of-file marker
    pub fn write<W: Write>(&self, writer: &mut W, sequences: &SequenceMap) -> Result<()> {
        writeln!(writer, "{DOMAIN_HEADER}")?;
        for (index, partitions) in self.partitions.iter().enumerate() {
            let nid = sequences.nid(index);
            for partition in partitions {
                writeln!(writer, "{}\t{}\t{}", nid, partition.from, partition.to)?;
            }
        }
        writeln!(writer, "{END_OF_FILE}")?;
        Ok(())
    }

    /// Write the domain file to `path`, replacing it only once fully written
    pub fn save<P: AsRef<Path>>(&self, path: P, sequences: &SequenceMap) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let temp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("could not create temporary file in {}", dir.display()))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            self.write(&mut writer, sequences)?;
            writer.flush()?;
        }
        temp.persist(path)
            .with_context(|| format!("could not write domains to {}", path.display()))?;
        Ok(())
    }

    /// Read a domain file written by [`PartitionSet::save`]
    pub fn load<P: AsRef<Path>>(
        path: P,
        forest: &SegmentationForest,
        sequences: &SequenceMap,
    ) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_text_input(path)?;
        Self::parse(reader, forest, sequences)
            .with_context(|| format!("reading domains from {}", path.display()))
    }

    /// Parse a domain file, mapping every span back onto its tree node
    ///
    /// Sequences absent from the file keep their root partition. Nids outside
    /// the working set are skipped.
    pub fn parse<R: BufRead>(
        reader: R,
        forest: &SegmentationForest,
        sequences: &SequenceMap,
    ) -> Result<Self> {
        let mut loaded: HashMap<usize, Vec<Partition>> = HashMap::new();
        let mut complete = false;

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim() == END_OF_FILE {
                complete = true;
                break;
            }
            if line.starts_with('#') || line.starts_with("nid") || line.trim().is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                bail!("line {}: expected 'nid start end', got '{}'", lineno + 1, line);
            }
            let nid: Nid = fields[0]
                .parse()
                .with_context(|| format!("line {}: invalid nid", lineno + 1))?;
            let from: Residue = fields[1]
                .parse()
                .with_context(|| format!("line {}: invalid start", lineno + 1))?;
            let to: Residue = fields[2]
                .parse()
                .with_context(|| format!("line {}: invalid end", lineno + 1))?;

            let Some(index) = sequences.index_of(nid) else {
                continue;
            };
            let tree = forest.tree(index);
            let Some(node) = tree.find_span(from, to) else {
                bail!("line {}: no tree node of nid {} spans {}-{}", lineno + 1, nid, from, to);
            };
            loaded.entry(index).or_default().push(Partition { node, from, to });
        }

        if !complete {
            bail!("missing end-of-file marker '{END_OF_FILE}', file is truncated");
        }

        let mut set = PartitionSet::initial(forest);
        for (index, mut partitions) in loaded {
            partitions.sort_by_key(|partition| partition.from);
            check_cover(forest.tree(index), &partitions)
                .with_context(|| format!("domains of nid {}", sequences.nid(index)))?;
            set.partitions[index] = partitions;
        }
        Ok(set)
    }
}

/// Partitions sorted by start must tile the root span without gaps or overlaps
fn check_cover(tree: &SegmentationTree, partitions: &[Partition]) -> Result<()> {
    let Some(root) = tree.root() else {
        bail!("sequence has no tree");
    };

    let mut expected = root.from;
    for partition in partitions {
        if partition.from != expected {
            bail!("domains leave residues {}-{} uncovered or doubly covered", expected, partition.from);
        }
        expected = partition.to;
    }
    if expected != root.to {
        bail!("domains end at {} instead of {}", expected, root.to);
    }
    Ok(())
}
