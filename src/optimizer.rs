/// Greedy refinement of partitions
///
/// One iteration visits every sequence and, in list order, every current
/// partition whose tree node has children. The partition is replaced by its
/// children if that strictly lowers the cost over all links of the sequence;
/// otherwise it is kept. The driver repeats iterations until the improvement
/// becomes negligible.
use anyhow::{anyhow, Result};
use log::{debug, info};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::link_store::{Link, LinkStore, OffsetIndex};
use crate::partition::PartitionSet;
use crate::scoring::{ScoringModel, ScoringParams, TransferTable};
use crate::segment_tree::SegmentationForest;
use crate::sequence_index::SequenceMap;

/// Split acceptance options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizerConfig {
    /// Only test splits into exactly two children
    pub disallow_shortening: bool,
    /// Re-examine freshly inserted children before moving on
    pub descend: bool,
}

/// Input files of an optimisation run
#[derive(Debug, Clone)]
pub struct InputFiles {
    pub nids: PathBuf,
    pub trees: PathBuf,
    pub links: PathBuf,
    pub index: PathBuf,
    pub transfers: PathBuf,
    /// Domain file of an earlier run to resume from
    pub resume: Option<PathBuf>,
}

/// Everything one optimisation run owns
pub struct OptimizerState {
    sequences: SequenceMap,
    forest: SegmentationForest,
    partitions: PartitionSet,
    links: LinkStore,
    model: ScoringModel,
    config: OptimizerConfig,
}

impl OptimizerState {
    pub fn new(
        sequences: SequenceMap,
        forest: SegmentationForest,
        partitions: PartitionSet,
        links: LinkStore,
        model: ScoringModel,
        config: OptimizerConfig,
    ) -> Self {
        OptimizerState {
            sequences,
            forest,
            partitions,
            links,
            model,
            config,
        }
    }

    /// Load all inputs and start from one root partition per sequence (or
    /// from the domains of an earlier run)
    pub fn initialise(files: &InputFiles, params: &ScoringParams, config: OptimizerConfig) -> Result<Self> {
        info!("retrieving values for transfers from {}", files.transfers.display());
        let transfers = TransferTable::read(&files.transfers)?;
        let model = ScoringModel::new(params, transfers)?;

        info!("retrieving nids from {}", files.nids.display());
        let sequences = SequenceMap::read(&files.nids)?;
        info!("{} nids in partition", sequences.len());

        info!("retrieving trees from {}", files.trees.display());
        let forest = SegmentationForest::read(&files.trees, &sequences)?;
        info!("{} trees found", forest.num_trees());

        info!("retrieving indices from {}", files.index.display());
        let index = OffsetIndex::read(&files.index)?;
        info!("retrieved {} indices", index.len());

        info!("opening links file {}", files.links.display());
        let links = LinkStore::open(&files.links, Arc::new(index), params.resolution)?;

        let partitions = match &files.resume {
            Some(path) => {
                info!("resuming from domains in {}", path.display());
                PartitionSet::load(path, &forest, &sequences)?
            }
            None => PartitionSet::initial(&forest),
        };

        Ok(OptimizerState::new(sequences, forest, partitions, links, model, config))
    }

    /// One greedy sweep over all sequences
    ///
    /// Returns the total cost reduction (positive when splits were accepted).
    pub fn iterate(&mut self) -> Result<f64> {
        let mut improvement = 0.0;

        for index in 0..self.sequences.len() {
            let nid = self.sequences.nid(index);
            let tree = self.forest.tree(index);
            debug!("checking split of sequence {nid} (index={index})");

            let mut links: Option<Vec<Link>> = None;
            let mut position = 0;
            while position < self.partitions.get(index).len() {
                let current = self.partitions.get(index)[position];
                let children = current.children(tree);

                if children.is_empty() {
                    position += 1;
                    continue;
                }
                if self.config.disallow_shortening && children.len() != 2 {
                    position += 1;
                    continue;
                }

                if links.is_none() {
                    let fetched = self.links.fetch_links(nid, &self.sequences)?;
                    debug!("found {} links for {}", fetched.len(), nid);
                    links = Some(fetched);
                }
                let links = links.as_deref().unwrap_or_default();

                let delta = self
                    .model
                    .delta_score(links, &self.partitions, &current, &children);

                if delta < 0.0 {
                    debug!(
                        "substituting partition {}-{} of {} by {} children (delta={})",
                        current.from,
                        current.to,
                        nid,
                        children.len(),
                        delta
                    );
                    self.partitions.split(index, position, &children);
                    improvement += delta;
                    if !self.config.descend {
                        position += children.len();
                    }
                } else {
                    debug!(
                        "keeping partition {}-{} of {} (delta={})",
                        current.from, current.to, nid, delta
                    );
                    position += 1;
                }
            }
        }

        info!("improvement={}", -improvement);
        Ok(-improvement)
    }

    /// Cost of the current partitioning summed over the links of every
    /// sequence; each link direction present in the file counts once
    ///
    /// Sequences are scored in parallel, each worker on its own link handle.
    pub fn total_cost(&self) -> Result<f64> {
        (0..self.sequences.len())
            .into_par_iter()
            .map_init(
                || self.links.reopen(),
                |store, index| -> Result<f64> {
                    let own = self.partitions.get(index);
                    if own.is_empty() {
                        return Ok(0.0);
                    }
                    let store = store.as_mut().map_err(|e| anyhow!("{e:#}"))?;
                    let links = store.fetch_links(self.sequences.nid(index), &self.sequences)?;
                    Ok(self.model.sequence_cost(&links, &self.partitions, own))
                },
            )
            .sum()
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.num_partitions()
    }

    pub fn partitions(&self) -> &PartitionSet {
        &self.partitions
    }

    pub fn sequences(&self) -> &SequenceMap {
        &self.sequences
    }

    pub fn forest(&self) -> &SegmentationForest {
        &self.forest
    }

    pub fn save_partitions<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.partitions.save(path, &self.sequences)?;
        debug!("partitions written to {}", path.display());
        Ok(())
    }

    pub fn into_partitions(self) -> PartitionSet {
        self.partitions
    }
}

/// Termination policy of the iteration loop
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub max_iterations: usize,
    /// Stop once an iteration improves the cost by no more than this
    pub min_abs_improvement: f64,
    /// Stop once an iteration improves by less than this fraction of the
    /// best improvement seen so far
    pub min_rel_improvement: f64,
    /// Save domains here after every iteration
    pub domains: Option<PathBuf>,
    /// Log the total cost after every iteration
    pub report_cost: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            max_iterations: 100,
            min_abs_improvement: 0.0,
            min_rel_improvement: 0.0,
            domains: None,
            report_cost: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    pub iteration: usize,
    pub improvement: f64,
    pub relative_improvement: f64,
    pub num_partitions: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    AbsoluteImprovement,
    RelativeImprovement,
    MaxIterations,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimiseReport {
    pub iterations: Vec<IterationStats>,
    pub stop: StopReason,
}

/// Iterate until the improvement falls below the configured thresholds or
/// the iteration limit is reached
pub fn optimise(state: &mut OptimizerState, config: &DriverConfig) -> Result<OptimiseReport> {
    let mut iterations: Vec<IterationStats> = Vec::new();
    let mut best_improvement = 0.0f64;

    for iteration in 0..config.max_iterations {
        info!("iteration {iteration}: started");
        let start = Instant::now();

        let improvement = state.iterate()?;
        let relative_improvement = if iterations.is_empty() {
            1.0
        } else if best_improvement > 0.0 {
            improvement / best_improvement
        } else {
            0.0
        };
        best_improvement = best_improvement.max(improvement);

        let stats = IterationStats {
            iteration,
            improvement,
            relative_improvement,
            num_partitions: state.num_partitions(),
            elapsed: start.elapsed(),
        };
        info!(
            "iteration {}: finished in {:.1} seconds: improvement={}, relative improvement={}, ndomains={}",
            iteration,
            stats.elapsed.as_secs_f64(),
            improvement,
            relative_improvement,
            stats.num_partitions
        );
        iterations.push(stats);

        if config.report_cost {
            info!("iteration {}: total cost={}", iteration, state.total_cost()?);
        }
        if let Some(path) = &config.domains {
            state.save_partitions(path)?;
            info!("domains saved to {}", path.display());
        }

        if improvement <= config.min_abs_improvement {
            info!(
                "optimisation stopped because absolute improvement not above {}",
                config.min_abs_improvement
            );
            return Ok(OptimiseReport {
                iterations,
                stop: StopReason::AbsoluteImprovement,
            });
        }
        if relative_improvement < config.min_rel_improvement {
            info!(
                "optimisation stopped because relative improvement less than {}",
                config.min_rel_improvement
            );
            return Ok(OptimiseReport {
                iterations,
                stop: StopReason::RelativeImprovement,
            });
        }
    }

    info!(
        "optimisation stopped because maximum iteration {} reached",
        config.max_iterations
    );
    Ok(OptimiseReport {
        iterations,
        stop: StopReason::MaxIterations,
    })
}
