/// Probabilistic cost of mapping alignments onto partitions
///
/// Every pair (partition on one sequence, partition on the other sequence,
/// link between them) costs the surprise of cutting the alignment at the
/// transferred length plus the surprise of the residues each partition leaves
/// unaligned. Costs are minimised; a split is accepted when it lowers the sum
/// over all links of the split sequence.
use anyhow::{bail, Context, Result};
use log::trace;
use std::io::BufRead;
use std::path::Path;

use crate::input::{is_comment, open_text_input};
use crate::link_store::Link;
use crate::partition::{Partition, PartitionSet};
use crate::segment_tree::Residue;

/// Floor for probabilities entering a logarithm
pub const SMALL_PROBABILITY: f64 = 1e-20;

/// Cost of a pairing whose transfer is too small to carry signal
pub const ZERO_COST: f64 = 0.0;

/// Half-open residue range `(from, to)`
pub type Span = (Residue, Residue);

/// Fill leading zeros with the first non-zero value and interpolate zero runs
/// between known values
///
/// Inside a run of `n` zeros every step moves `1/n` of the remaining distance
/// from the previous value towards the next known value, so runs longer than
/// two do not lie on the straight line between their neighbours. Trailing
/// zeros take the last known value.
pub fn interpolate(values: &mut [f64]) {
    let Some(first) = values.iter().position(|&v| v != 0.0) else {
        return;
    };
    let leading = values[first];
    values[..first].fill(leading);

    let mut x = first + 1;
    while x < values.len() {
        if values[x] != 0.0 {
            x += 1;
            continue;
        }

        let start = x;
        let mut end = x;
        while end < values.len() && values[end] == 0.0 {
            end += 1;
        }

        let mut last = values[start - 1];
        if end == values.len() {
            values[start..].fill(last);
            break;
        }

        let next = values[end];
        let run = (end - start) as f64;
        for value in &mut values[start..end] {
            last += (next - last) / run;
            *value = last;
        }
        x = end + 1;
    }
}

/// Tabulated probability of cutting an alignment at a given transfer length
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTable {
    values: Vec<f64>,
}

impl TransferTable {
    /// Build from a sparse table where 0 marks a missing value
    pub fn from_sparse(mut values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            bail!("transfer table is empty");
        }
        interpolate(&mut values);
        Ok(TransferTable { values })
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_text_input(path)?;
        Self::parse(reader).with_context(|| format!("reading transfers from {}", path.display()))
    }

    /// Parse `index value` lines; missing indices are filled by interpolation
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut values: Vec<f64> = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if is_comment(&line) {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(x), Some(y)) = (fields.next(), fields.next()) else {
                bail!("line {}: expected 'index value', got '{}'", lineno + 1, line);
            };
            let x: usize = x
                .parse()
                .with_context(|| format!("line {}: invalid index '{}'", lineno + 1, x))?;
            let y: f64 = y
                .parse()
                .with_context(|| format!("line {}: invalid value '{}'", lineno + 1, y))?;

            if values.len() <= x {
                values.resize(x + 1, 0.0);
            }
            values[x] = y;
        }
        Self::from_sparse(values)
    }

    /// Probability for a transfer, clamped to the ends of the table
    pub fn probability(&self, transfer: Residue) -> f64 {
        let last = self.values.len() - 1;
        match usize::try_from(transfer) {
            Ok(x) => self.values[x.min(last)],
            Err(_) => self.values[0],
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// User-level scoring parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringParams {
    /// Residues per grid cell
    pub resolution: f64,
    /// Decay rate of the overhang distribution, per residue
    pub exponential_e: f64,
    /// Scale of the overhang distribution; 0 means "same as e"
    pub exponential_f: f64,
    /// Measure overhang relative to partition length
    pub relative_overhang: bool,
    /// Only charge the overhang of the partition being split
    pub only_query: bool,
}

impl Default for ScoringParams {
    fn default() -> Self {
        ScoringParams {
            resolution: 10.0,
            exponential_e: 0.05,
            exponential_f: 0.0,
            relative_overhang: false,
            only_query: false,
        }
    }
}

/// Scoring model with parameters scaled to the resolution grid
#[derive(Debug, Clone)]
pub struct ScoringModel {
    transfers: TransferTable,
    e: f64,
    f: f64,
    threshold_overlap: Residue,
    relative_overhang: bool,
    only_query: bool,
}

impl ScoringModel {
    pub fn new(params: &ScoringParams, transfers: TransferTable) -> Result<Self> {
        if params.resolution <= 0.0 {
            bail!("resolution must be positive, got {}", params.resolution);
        }
        let f = if params.exponential_f == 0.0 {
            params.exponential_e
        } else {
            params.exponential_f
        };
        if f <= 0.0 {
            bail!("overhang scale must be positive, got {f}");
        }

        Ok(ScoringModel {
            transfers,
            e: params.exponential_e * params.resolution,
            f,
            // Overlaps this small are artefacts of the grid
            threshold_overlap: (12.0 / params.resolution) as Residue,
            relative_overhang: params.relative_overhang,
            only_query: params.only_query,
        })
    }

    pub fn threshold_overlap(&self) -> Residue {
        self.threshold_overlap
    }

    /// Decay rate on the resolution grid
    pub fn e(&self) -> f64 {
        self.e
    }

    pub fn f(&self) -> f64 {
        self.f
    }

    pub fn transfers(&self) -> &TransferTable {
        &self.transfers
    }

    fn overhang_probability(&self, overhang: Residue) -> f64 {
        self.f * (-self.e * overhang as f64).exp()
    }

    /// Cost of pairing partition `part` with partition `other` through a link
    /// aligning `link_part` (same sequence as `part`) to `link_other`
    ///
    /// `part` is mapped through the link into the frame of `other`; the
    /// residues of `other` it lands on are the transfer.
    pub fn score(&self, part: Span, other: Span, link_part: Span, link_other: Span) -> f64 {
        let l1 = part.1 - part.0;
        let l2 = other.1 - other.0;

        let shift = link_other.0 - link_part.0;
        let start = (part.0 + shift).max(link_other.0);
        let end = (part.1 + shift).min(link_other.1);
        let transfer = other.1.min(end) - other.0.max(start);

        if transfer <= self.threshold_overlap {
            return ZERO_COST;
        }

        let p = (1.0 - self.transfers.probability(transfer)).max(SMALL_PROBABILITY);
        let s = -p.ln();

        let (o1, o2) = if self.relative_overhang {
            (l1 - transfer * 100 / l1, l2 - transfer * 100 / l2)
        } else {
            (l1 - transfer, l2 - transfer)
        };
        let p1 = self.overhang_probability(o1);
        let s1 = -p1.ln();
        let p2 = self.overhang_probability(o2);
        let s2 = -p2.ln();

        trace!(
            "part={part:?} other={other:?} link={link_part:?}->{link_other:?} \
             start={start} end={end} l1={l1} l2={l2} t={transfer} \
             p={p} s={s} p1={p1} s1={s1} p2={p2} s2={s2}"
        );

        if self.only_query {
            s + s2
        } else {
            s + s1 + s2
        }
    }

    /// Change in cost from replacing `old` by `new` on the sequence whose
    /// `links` are given, priced against the current partitions of every
    /// linked sequence
    pub fn delta_score(
        &self,
        links: &[Link],
        partitions: &PartitionSet,
        old: &Partition,
        new: &[Partition],
    ) -> f64 {
        let mut delta = 0.0;
        for link in links {
            let link_sbjct = (link.sbjct_from, link.sbjct_to);
            let link_query = (link.query_from, link.query_to);

            for sbjct in partitions.get(link.sbjct_index) {
                let sbjct_span = (sbjct.from, sbjct.to);
                let old_score = self.score(sbjct_span, (old.from, old.to), link_sbjct, link_query);
                let new_score: f64 = new
                    .iter()
                    .map(|partition| {
                        self.score(sbjct_span, (partition.from, partition.to), link_sbjct, link_query)
                    })
                    .sum();
                delta += new_score - old_score;

                trace!(
                    "sbjct={} new_score={} old_score={} inc={} delta={}",
                    link.sbjct_index,
                    new_score,
                    old_score,
                    new_score - old_score,
                    delta
                );
            }
        }
        delta
    }

    /// Cost of the partitions `own` of one sequence against the current
    /// partitions of every sequence it links to
    pub fn sequence_cost(&self, links: &[Link], partitions: &PartitionSet, own: &[Partition]) -> f64 {
        links
            .iter()
            .map(|link| {
                let link_sbjct = (link.sbjct_from, link.sbjct_to);
                let link_query = (link.query_from, link.query_to);
                partitions
                    .get(link.sbjct_index)
                    .iter()
                    .flat_map(|sbjct| own.iter().map(move |query| (sbjct, query)))
                    .map(|(sbjct, query)| {
                        self.score((sbjct.from, sbjct.to), (query.from, query.to), link_sbjct, link_query)
                    })
                    .sum::<f64>()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn flat_model(probability: f64, resolution: f64) -> ScoringModel {
        let params = ScoringParams {
            resolution,
            exponential_e: 0.05,
            ..Default::default()
        };
        ScoringModel::new(&params, TransferTable::from_sparse(vec![probability]).unwrap()).unwrap()
    }

    #[test]
    fn test_interpolate_example() {
        let mut values = vec![0.0, 0.0, 5.0, 0.0, 0.0, 10.0];
        interpolate(&mut values);
        assert_eq!(values, vec![5.0, 5.0, 5.0, 7.5, 8.75, 10.0]);
    }

    #[test]
    fn test_interpolate_edges() {
        let mut values = vec![0.0, 2.0, 0.0, 4.0, 0.0, 0.0];
        interpolate(&mut values);
        assert_eq!(values, vec![2.0, 2.0, 4.0, 4.0, 4.0, 4.0]);

        // Longer runs approach the next value geometrically
        let mut values = vec![5.0, 0.0, 0.0, 0.0, 10.0];
        interpolate(&mut values);
        let expected = [5.0, 5.0 + 5.0 / 3.0, 70.0 / 9.0, 230.0 / 27.0, 10.0];
        for (value, expected) in values.iter().zip(expected) {
            assert!((value - expected).abs() < 1e-9, "{values:?}");
        }

        let mut zeros = vec![0.0; 3];
        interpolate(&mut zeros);
        assert_eq!(zeros, vec![0.0; 3]);
    }

    #[test]
    fn test_parse_transfer_table() -> Result<()> {
        let table = TransferTable::parse(Cursor::new("# x\tp\n2\t0.5\n5\t1.0\n"))?;
        assert_eq!(table.values(), &[0.5, 0.5, 0.5, 0.75, 0.875, 1.0]);
        assert_eq!(table.probability(-3), 0.5);
        assert_eq!(table.probability(4), 0.875);
        assert_eq!(table.probability(500), 1.0);

        assert!(TransferTable::parse(Cursor::new("1\n")).is_err());
        assert!(TransferTable::parse(Cursor::new("a b\n")).is_err());
        assert!(TransferTable::parse(Cursor::new("# only comments\n")).is_err());
        Ok(())
    }

    #[test]
    fn test_parameters_scale_with_resolution() {
        let model = flat_model(0.5, 4.0);
        assert_eq!(model.threshold_overlap(), 3);
        assert!((model.e() - 0.2).abs() < 1e-12);
        assert!((model.f() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_small_transfer_costs_nothing() {
        let model = flat_model(0.5, 1.0);
        assert_eq!(model.threshold_overlap(), 12);

        // Link maps only 12 residues of part onto other
        assert_eq!(model.score((0, 12), (0, 100), (0, 100), (0, 100)), ZERO_COST);
        // Disjoint after mapping
        assert_eq!(model.score((0, 50), (60, 100), (0, 50), (0, 50)), ZERO_COST);
        // Large partitions, but the link itself is short
        assert_eq!(model.score((0, 500), (0, 500), (0, 5), (100, 105)), ZERO_COST);
    }

    #[test]
    fn test_score_terms() {
        let model = flat_model(0.5, 1.0);
        let overhang = |o: f64| -(model.f() * (-model.e() * o).exp()).ln();

        // part 0-50 maps onto 100-150 of other, which spans 100-200
        let score = model.score((0, 50), (100, 200), (0, 50), (100, 150));
        let expected = -(0.5f64).ln() + overhang(0.0) + overhang(50.0);
        assert!((score - expected).abs() < 1e-9);

        let params = ScoringParams {
            resolution: 1.0,
            only_query: true,
            ..Default::default()
        };
        let query_only =
            ScoringModel::new(&params, TransferTable::from_sparse(vec![0.5]).unwrap()).unwrap();
        let score = query_only.score((0, 80), (100, 200), (0, 50), (100, 150));
        let expected = -(0.5f64).ln() + overhang(50.0);
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_relative_overhang() {
        let params = ScoringParams {
            resolution: 1.0,
            relative_overhang: true,
            ..Default::default()
        };
        let model = ScoringModel::new(&params, TransferTable::from_sparse(vec![0.5]).unwrap()).unwrap();
        let overhang = |o: f64| -(model.f() * (-model.e() * o).exp()).ln();

        // part 0-50 is fully transferred: 50 - 50 * 100 / 50 = -50, a negative
        // overhang that lowers the cost; other keeps 100 - 50 * 100 / 100 = 50
        let score = model.score((0, 50), (100, 200), (0, 50), (100, 150));
        let expected = -(0.5f64).ln() + overhang(-50.0) + overhang(50.0);
        assert!((score - expected).abs() < 1e-9);
        assert!((score - 6.684611727667926).abs() < 1e-9);

        // Integer arithmetic: 40 - 20 * 100 / 40 = -10 and 80 - 20 * 100 / 80 = 55
        let score = model.score((0, 40), (0, 80), (0, 20), (0, 20));
        let expected = -(0.5f64).ln() + overhang(-10.0) + overhang(55.0);
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_certain_transfer_is_floored() {
        let model = flat_model(1.0, 1.0);
        let score = model.score((0, 50), (0, 50), (0, 50), (0, 50));
        let expected = -SMALL_PROBABILITY.ln() + 2.0 * -(model.f().ln());
        assert!((score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_parameters() {
        let table = TransferTable::from_sparse(vec![0.5]).unwrap();
        let params = ScoringParams {
            resolution: 0.0,
            ..Default::default()
        };
        assert!(ScoringModel::new(&params, table.clone()).is_err());
        let params = ScoringParams {
            exponential_e: 0.0,
            exponential_f: 0.0,
            ..Default::default()
        };
        assert!(ScoringModel::new(&params, table).is_err());
        assert!(TransferTable::from_sparse(Vec::new()).is_err());
    }
}
