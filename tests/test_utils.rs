#![allow(dead_code)]
/// Utility functions for testing
use adda::link_store::OffsetIndex;
use adda::optimizer::{InputFiles, OptimizerConfig, OptimizerState};
use adda::scoring::ScoringParams;
use anyhow::Result;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub const LINK_HEADER: &str =
    "query_nid\tsbjct_nid\tevalue\tquery_start\tquery_end\tsbjct_start\tsbjct_end\n";

/// Transfer table with the same cut probability for every length
pub const FLAT_TRANSFERS: &str = "# transfer\tprobability\n0\t0.5\n";

/// Input files of one optimisation run inside a temporary directory
pub struct Fixture {
    pub dir: TempDir,
    pub files: InputFiles,
}

/// Write the id list, trees, links (with header) and transfer table, and
/// index the links
pub fn write_fixture(nids: &[i64], trees: &str, links: &str, transfers: &str) -> Result<Fixture> {
    let dir = TempDir::new()?;
    let path = |name: &str| dir.path().join(name);

    let mut nid_list = String::from("nid\n");
    for nid in nids {
        nid_list.push_str(&format!("{nid}\n"));
    }
    fs::write(path("nids.tsv"), nid_list)?;
    fs::write(path("trees.tsv"), format!("nid\tnode\tparent\tlevel\txfrom\txto\n{trees}"))?;
    fs::write(path("links.tsv"), format!("{LINK_HEADER}{links}"))?;
    fs::write(path("transfers.tsv"), transfers)?;
    OffsetIndex::build(path("links.tsv"))?.write(path("links.idx"))?;

    let files = InputFiles {
        nids: path("nids.tsv"),
        trees: path("trees.tsv"),
        links: path("links.tsv"),
        index: path("links.idx"),
        transfers: path("transfers.tsv"),
        resume: None,
    };
    Ok(Fixture { dir, files })
}

/// Scoring on the residue grid itself: threshold 12, e = f = 0.05
pub fn unit_params() -> ScoringParams {
    ScoringParams {
        resolution: 1.0,
        exponential_e: 0.05,
        ..Default::default()
    }
}

pub fn open_state(fixture: &Fixture, config: OptimizerConfig) -> Result<OptimizerState> {
    OptimizerState::initialise(&fixture.files, &unit_params(), config)
}

/// Spans of the partitions of one sequence
pub fn spans(state: &OptimizerState, index: usize) -> Vec<(i32, i32)> {
    state
        .partitions()
        .get(index)
        .iter()
        .map(|partition| (partition.from, partition.to))
        .collect()
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

pub fn file_exists(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
