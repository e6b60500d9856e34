/// End-to-end tests of the adda binary
mod test_utils;

use anyhow::Result;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;
use test_utils::*;

fn adda(args: &[&str]) -> Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_adda")).args(args).output()?)
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_components_command() -> Result<()> {
    let dir = TempDir::new()?;
    let pairs = dir.path().join("pairs.txt");
    let output = dir.path().join("components.tsv");
    fs::write(&pairs, "# pairs\nP1 P2\nP3 P4\nP2 P5\n")?;

    let result = adda(&["components", path_str(&pairs), "-o", path_str(&output)])?;
    assert!(
        result.status.success(),
        "components failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let text = fs::read_to_string(&output)?;
    let rows: Vec<Vec<&str>> = text.lines().skip(1).map(|l| l.split('\t').collect()).collect();
    assert_eq!(text.lines().next(), Some("token\tcomponent"));
    assert_eq!(rows.len(), 5);

    let component_of = |token: &str| {
        rows.iter()
            .find(|row| row[0] == token)
            .map(|row| row[1].to_string())
    };
    assert_eq!(component_of("P1"), component_of("P5"));
    assert_eq!(component_of("P3"), component_of("P4"));
    assert_ne!(component_of("P1"), component_of("P3"));
    Ok(())
}

#[test]
fn test_components_rejects_single_token_line() -> Result<()> {
    let dir = TempDir::new()?;
    let pairs = dir.path().join("pairs.txt");
    fs::write(&pairs, "P1 P2\nP3\n")?;

    let result = adda(&["components", path_str(&pairs)])?;
    assert!(!result.status.success());
    Ok(())
}

#[test]
fn test_index_and_optimise_commands() -> Result<()> {
    // Trees are on the grid of the default resolution 10, links in residues
    let trees = "1\t0\t0\t0\t0\t100\n1\t1\t0\t1\t0\t50\n1\t2\t0\t1\t50\t100\n\
                 2\t0\t0\t0\t0\t50\n";
    let links = "1\t2\t-20\t1\t500\t1\t500\n";
    let fixture = write_fixture(&[1, 2], trees, links, FLAT_TRANSFERS)?;
    let files = &fixture.files;

    // Rebuild the index through the binary and check it
    let index = fixture.dir.path().join("cli.idx");
    let result = adda(&[
        "index",
        path_str(&files.links),
        path_str(&index),
        "--verify",
    ])?;
    assert!(
        result.status.success(),
        "index failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );
    assert_eq!(fs::metadata(&index)?.len(), 16);

    let domains = fixture.dir.path().join("domains.tsv");
    let result = adda(&[
        "optimise",
        "--nids",
        path_str(&files.nids),
        "--trees",
        path_str(&files.trees),
        "--links",
        path_str(&files.links),
        "--index",
        path_str(&index),
        "--transfers",
        path_str(&files.transfers),
        "-o",
        path_str(&domains),
        "-t",
        "2",
        "-v",
    ])?;
    assert!(
        result.status.success(),
        "optimise failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let text = fs::read_to_string(&domains)?;
    assert_eq!(
        text,
        "nid\tstart\tend\n1\t0\t50\n1\t50\t100\n2\t0\t50\n#//\n"
    );
    Ok(())
}

#[test]
fn test_optimise_reports_missing_input() -> Result<()> {
    let dir = TempDir::new()?;
    let missing = dir.path().join("missing.tsv");
    let domains = dir.path().join("domains.tsv");
    let missing = path_str(&missing);

    let result = adda(&[
        "optimise",
        "--nids",
        missing,
        "--trees",
        missing,
        "--links",
        missing,
        "--index",
        missing,
        "--transfers",
        missing,
        "-o",
        path_str(&domains),
    ])?;
    assert!(!result.status.success());
    assert!(String::from_utf8_lossy(&result.stderr).contains("missing.tsv"));
    assert!(!file_exists(&domains));
    Ok(())
}
