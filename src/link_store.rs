/// Out-of-core access to the link file
///
/// The link file is a tab-separated text file
/// `query_nid sbjct_nid score query_from query_to sbjct_from sbjct_to`
/// grouped by query nid, with a `query_nid` header line. A binary offset
/// index maps every query nid to the byte offset of its first record, so the
/// links of one sequence are read with one seek and a sequential scan.
use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use log::{debug, info};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::input::is_comment;
use crate::segment_tree::Residue;
use crate::sequence_index::{Nid, SequenceMap};

/// Byte offset into the link file
pub type FileOffset = u64;

/// Prefix of the header line of a link file
pub const LINK_HEADER: &str = "query_nid";

/// Size of one `(nid, offset)` record of the offset index
pub const INDEX_RECORD_SIZE: usize = 16;

/// Map a 1-based residue onto the 0-based resolution grid
pub fn convert(residue: Residue, resolution: f64) -> Residue {
    ((residue - 1) as f64 / resolution).floor() as Residue
}

/// One record of the link file, in 1-based residue coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkRecord {
    pub query_nid: Nid,
    pub sbjct_nid: Nid,
    pub score: f64,
    pub query_from: Residue,
    pub query_to: Residue,
    pub sbjct_from: Residue,
    pub sbjct_to: Residue,
}

impl FromStr for LinkRecord {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            bail!("link record has {} fields, expected 7", fields.len());
        }

        Ok(LinkRecord {
            query_nid: fields[0].parse().context("invalid query_nid")?,
            sbjct_nid: fields[1].parse().context("invalid sbjct_nid")?,
            score: fields[2].parse().context("invalid score")?,
            query_from: fields[3].parse().context("invalid query_from")?,
            query_to: fields[4].parse().context("invalid query_to")?,
            sbjct_from: fields[5].parse().context("invalid sbjct_from")?,
            sbjct_to: fields[6].parse().context("invalid sbjct_to")?,
        })
    }
}

/// A link from the sequence being evaluated to a subject in the working set,
/// in half-open resolution coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub query_from: Residue,
    pub query_to: Residue,
    pub sbjct_index: usize,
    pub sbjct_from: Residue,
    pub sbjct_to: Residue,
}

impl Link {
    fn from_record(record: &LinkRecord, sbjct_index: usize, resolution: f64) -> Self {
        Link {
            query_from: convert(record.query_from, resolution),
            query_to: convert(record.query_to, resolution) + 1,
            sbjct_index,
            sbjct_from: convert(record.sbjct_from, resolution),
            sbjct_to: convert(record.sbjct_to, resolution) + 1,
        }
    }
}

/// Persisted map from query nid to the offset of its first link record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetIndex {
    offsets: IndexMap<Nid, FileOffset>,
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, nid: Nid, offset: FileOffset) {
        self.offsets.insert(nid, offset);
    }

    pub fn get(&self, nid: Nid) -> Option<FileOffset> {
        self.offsets.get(&nid).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Entries in file order
    pub fn iter(&self) -> impl Iterator<Item = (Nid, FileOffset)> + '_ {
        self.offsets.iter().map(|(&nid, &offset)| (nid, offset))
    }

    /// Index a link file in one pass
    ///
    /// Fails if a query nid reappears after another one, as the file must be
    /// grouped by query nid.
    pub fn build<P: AsRef<Path>>(links_path: P) -> Result<Self> {
        let links_path = links_path.as_ref();
        let file = File::open(links_path)
            .with_context(|| format!("could not open links {}", links_path.display()))?;
        let mut reader = BufReader::new(file);

        let mut index = OffsetIndex::new();
        let mut offset: FileOffset = 0;
        let mut current: Option<Nid> = None;
        let mut num_records = 0usize;
        let mut header_seen = false;
        let mut line = String::new();
        let mut lineno = 0usize;

        loop {
            line.clear();
            let bytes = reader.read_line(&mut line)?;
            if bytes == 0 {
                break;
            }
            lineno += 1;
            let record_offset = offset;
            offset += bytes as FileOffset;

            if is_comment(&line) {
                continue;
            }
            if !header_seen {
                if !line.starts_with(LINK_HEADER) {
                    bail!(
                        "{}: line {}: expected header starting with '{}'",
                        links_path.display(),
                        lineno,
                        LINK_HEADER
                    );
                }
                header_seen = true;
                continue;
            }

            let record: LinkRecord = line
                .parse()
                .with_context(|| format!("{}: line {}", links_path.display(), lineno))?;
            num_records += 1;

            if current != Some(record.query_nid) {
                if index.get(record.query_nid).is_some() {
                    bail!(
                        "{}: line {}: links of nid {} are not grouped together",
                        links_path.display(),
                        lineno,
                        record.query_nid
                    );
                }
                index.insert(record.query_nid, record_offset);
                current = Some(record.query_nid);
            }
        }

        info!(
            "indexed {} links of {} sequences in {}",
            num_records,
            index.len(),
            links_path.display()
        );
        Ok(index)
    }

    /// Read a binary offset index
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("could not open index {}", path.display()))?;
        let length = file.metadata()?.len();
        if length % INDEX_RECORD_SIZE as u64 != 0 {
            bail!(
                "{}: size {} is not a multiple of the record size {}",
                path.display(),
                length,
                INDEX_RECORD_SIZE
            );
        }

        let mut reader = BufReader::new(file);
        let mut index = OffsetIndex::new();
        for _ in 0..length / INDEX_RECORD_SIZE as u64 {
            let nid = reader.read_i64::<LittleEndian>()?;
            let offset = reader.read_u64::<LittleEndian>()?;
            index.insert(nid, offset);
        }
        Ok(index)
    }

    /// Write the binary offset index
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("could not create index {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for (nid, offset) in self.iter() {
            writer.write_i64::<LittleEndian>(nid)?;
            writer.write_u64::<LittleEndian>(offset)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Check that every offset points at a record of its nid
    pub fn verify<P: AsRef<Path>>(&self, links_path: P) -> Result<()> {
        let links_path = links_path.as_ref();
        let file = File::open(links_path)
            .with_context(|| format!("could not open links {}", links_path.display()))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();

        for (nid, offset) in self.iter() {
            reader.seek(SeekFrom::Start(offset))?;
            line.clear();
            reader.read_line(&mut line)?;
            let record: LinkRecord = line
                .parse()
                .with_context(|| format!("record of nid {nid} at offset {offset}"))?;
            if record.query_nid != nid {
                bail!(
                    "offset {} of nid {} points at a record of nid {}",
                    offset,
                    nid,
                    record.query_nid
                );
            }
        }
        Ok(())
    }
}

/// Where the shared file position stands after the last fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Freshly opened, positioned at the start of the file
    Start,
    /// Seeked to the first record of a query nid, ready to stream
    Positioned,
    /// Stopped at the first record of another query nid
    Boundary,
    /// Ran into the end of the file and rewound to the start
    Rewound,
}

/// Seekable reader over the link file, one per worker
pub struct LinkStore {
    path: PathBuf,
    reader: BufReader<File>,
    index: Arc<OffsetIndex>,
    resolution: f64,
    state: CursorState,
    line: String,
}

impl LinkStore {
    /// Open the link file and check its header
    pub fn open<P: AsRef<Path>>(path: P, index: Arc<OffsetIndex>, resolution: f64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("could not open links {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                bail!("{}: empty link file, expected header", path.display());
            }
            if !is_comment(&line) {
                break;
            }
        }
        if !line.starts_with(LINK_HEADER) {
            bail!(
                "{}: expected header starting with '{}', got '{}'",
                path.display(),
                LINK_HEADER,
                line.trim_end()
            );
        }
        reader.rewind()?;

        Ok(LinkStore {
            path,
            reader,
            index,
            resolution,
            state: CursorState::Start,
            line,
        })
    }

    /// Open an independent handle on the same file and index
    pub fn reopen(&self) -> Result<Self> {
        LinkStore::open(&self.path, Arc::clone(&self.index), self.resolution)
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Current byte position of the shared handle
    pub fn position(&mut self) -> Result<FileOffset> {
        Ok(self.reader.stream_position()?)
    }

    /// Position the handle at the first record of `nid`
    ///
    /// Returns false if the nid has no links.
    pub fn seek_to_sequence(&mut self, nid: Nid) -> Result<bool> {
        match self.index.get(nid) {
            Some(offset) => {
                self.reader.seek(SeekFrom::Start(offset))?;
                self.state = CursorState::Positioned;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stream links of `nid` from the current position until the first
    /// record of another nid or the end of the file
    ///
    /// Yields nothing unless [`LinkStore::seek_to_sequence`] positioned the
    /// handle since the last stream ended.
    pub fn stream_until_boundary<'a>(
        &'a mut self,
        nid: Nid,
        sequences: &'a SequenceMap,
    ) -> LinkCursor<'a> {
        let done = self.state != CursorState::Positioned;
        LinkCursor {
            store: self,
            nid,
            sequences,
            done,
        }
    }

    /// Seek to `nid` and collect all its links to sequences of the working set
    pub fn fetch_links(&mut self, nid: Nid, sequences: &SequenceMap) -> Result<Vec<Link>> {
        if !self.seek_to_sequence(nid)? {
            debug!("nid {nid} has no links");
            return Ok(Vec::new());
        }
        self.stream_until_boundary(nid, sequences)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("reading links of nid {} from {}", nid, self.path.display()))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader.rewind()?;
        self.state = CursorState::Rewound;
        Ok(())
    }
}

/// Lazy sequence of the links of one query nid
pub struct LinkCursor<'a> {
    store: &'a mut LinkStore,
    nid: Nid,
    sequences: &'a SequenceMap,
    done: bool,
}

impl Iterator for LinkCursor<'_> {
    type Item = Result<Link>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.store.line.clear();
            let bytes = match self.store.reader.read_line(&mut self.store.line) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };

            if bytes == 0 {
                self.done = true;
                return self.store.rewind().err().map(|e| Err(e.into()));
            }
            if is_comment(&self.store.line) {
                continue;
            }

            let record: LinkRecord = match self.store.line.parse() {
                Ok(record) => record,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if record.query_nid != self.nid {
                self.done = true;
                self.store.state = CursorState::Boundary;
                return None;
            }
            if record.query_nid == record.sbjct_nid {
                continue;
            }
            if let Some(sbjct_index) = self.sequences.index_of(record.sbjct_nid) {
                return Some(Ok(Link::from_record(
                    &record,
                    sbjct_index,
                    self.store.resolution,
                )));
            }
        }
        None
    }
}
