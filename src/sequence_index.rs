/// Mapping between stable sequence identifiers (nids) and dense indices
///
/// Built once from the id list of a working set and never changed afterwards.
/// Records referring to nids outside the map belong to sequences outside the
/// working set and are skipped by the readers.
use anyhow::{bail, Context, Result};
use indexmap::IndexSet;
use std::io::BufRead;
use std::path::Path;

use crate::input::{is_comment, open_text_input};

/// External sequence identifier
pub type Nid = i64;

/// Bidirectional nid <-> index map; the index is the insertion position
#[derive(Debug, Clone, Default)]
pub struct SequenceMap {
    nids: IndexSet<Nid>,
}

impl SequenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from nids in index order, rejecting duplicates
    pub fn from_nids<I: IntoIterator<Item = Nid>>(nids: I) -> Result<Self> {
        let mut map = SequenceMap::new();
        for nid in nids {
            if !map.nids.insert(nid) {
                bail!("nid {nid} listed twice");
            }
        }
        Ok(map)
    }

    /// Read an id list: a `nid` header, then one nid per line
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_text_input(path)?;
        Self::parse(reader).with_context(|| format!("reading nids from {}", path.display()))
    }

    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut header_seen = false;
        let mut nids = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if is_comment(&line) {
                continue;
            }
            if !header_seen {
                if line.split_whitespace().next() != Some("nid") {
                    bail!("line {}: expected header 'nid', got '{}'", lineno + 1, line);
                }
                header_seen = true;
                continue;
            }

            let field = line.split_whitespace().next().unwrap_or_default();
            let nid: Nid = field
                .parse()
                .with_context(|| format!("line {}: invalid nid '{}'", lineno + 1, field))?;
            nids.push(nid);
        }

        if !header_seen {
            bail!("empty id list, expected header 'nid'");
        }
        Self::from_nids(nids)
    }

    /// Get the index for a nid (returns None if outside the working set)
    pub fn index_of(&self, nid: Nid) -> Option<usize> {
        self.nids.get_index_of(&nid)
    }

    /// Get the nid for an index (panics if invalid)
    pub fn nid(&self, index: usize) -> Nid {
        self.nids[index]
    }

    /// Number of sequences
    pub fn len(&self) -> usize {
        self.nids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nids.is_empty()
    }

    /// Nids in index order
    pub fn nids(&self) -> impl Iterator<Item = Nid> + '_ {
        self.nids.iter().copied()
    }
}
