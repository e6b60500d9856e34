use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use log::info;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;

use adda::input::{is_comment, open_text_input};
use adda::link_store::OffsetIndex;
use adda::optimizer::{optimise, DriverConfig, InputFiles, OptimizerConfig, OptimizerState};
use adda::scoring::ScoringParams;
use adda::union_find::StringComponents;

/// ADDA - decompose alignment graphs into nested domains
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Increase logging (-v info, -vv debug, -vvv trace)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Group tokens connected by pairs into components
    Components {
        /// Whitespace-separated token pairs, one per line (stdin if not given)
        #[clap(value_name = "PAIRS")]
        input: Option<PathBuf>,

        /// Output file (stdout if not specified)
        #[clap(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Build the offset index of a link file
    Index {
        /// Link file grouped by query nid
        #[clap(value_name = "LINKS")]
        links: PathBuf,

        /// Binary index to write
        #[clap(value_name = "INDEX")]
        index: PathBuf,

        /// Re-read the written index and check every offset
        #[clap(long = "verify")]
        verify: bool,
    },

    /// Greedily split sequences into domains
    Optimise(OptimiseArgs),
}

#[derive(clap::Args, Debug)]
struct OptimiseArgs {
    /// Id list of the working set
    #[clap(long = "nids")]
    nids: PathBuf,

    /// Segmentation records (nid node parent level from to)
    #[clap(long = "trees")]
    trees: PathBuf,

    /// Link file grouped by query nid
    #[clap(long = "links")]
    links: PathBuf,

    /// Offset index of the link file
    #[clap(long = "index")]
    index: PathBuf,

    /// Tabulated transfer probabilities (index value)
    #[clap(long = "transfers")]
    transfers: PathBuf,

    /// Domain file to write after every iteration
    #[clap(short = 'o', long = "domains")]
    domains: PathBuf,

    /// Resume from the domain file of an earlier run
    #[clap(long = "resume")]
    resume: Option<PathBuf>,

    /// Residues per grid cell
    #[clap(short = 'r', long = "resolution", default_value = "10")]
    resolution: f64,

    /// Decay rate of the overhang distribution
    #[clap(short = 'e', long = "exponential-e", default_value = "0.05")]
    exponential_e: f64,

    /// Scale of the overhang distribution (0 = same as e)
    #[clap(short = 'f', long = "exponential-f", default_value = "0")]
    exponential_f: f64,

    /// Measure overhangs relative to partition length
    #[clap(long = "relative-overhang")]
    relative_overhang: bool,

    /// Only charge the overhang of the sequence being split
    #[clap(long = "only-query")]
    only_query: bool,

    /// Only test splits into exactly two children
    #[clap(long = "disallow-shortening")]
    disallow_shortening: bool,

    /// Re-examine accepted children immediately
    #[clap(long = "descend")]
    descend: bool,

    /// Maximum number of iterations
    #[clap(short = 'n', long = "max-iterations", default_value = "100")]
    max_iterations: usize,

    /// Stop when an iteration improves the cost by no more than this
    #[clap(long = "min-abs-improvement", default_value = "0")]
    min_abs_improvement: f64,

    /// Stop when improvement relative to the best iteration drops below this
    #[clap(long = "min-rel-improvement", default_value = "0")]
    min_rel_improvement: f64,

    /// Log the total cost after every iteration
    #[clap(long = "report-cost")]
    report_cost: bool,

    /// Number of threads for the total cost report
    #[clap(short = 't', long = "threads", default_value = "8")]
    threads: usize,
}

fn init_logging(verbose: u8) {
    env_logger::Builder::new()
        .filter_level(match verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .parse_default_env()
        .init();
}

fn run_components(input: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let reader: Box<dyn BufRead> = match &input {
        Some(path) => open_text_input(path)?,
        None => Box::new(io::BufReader::new(io::stdin())),
    };

    let mut components = StringComponents::new();
    let mut merges = 0usize;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if is_comment(&line) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(a), Some(b)) = (fields.next(), fields.next()) else {
            bail!("line {}: expected two tokens, got '{}'", lineno + 1, line);
        };
        if components.union(a, b) {
            merges += 1;
        }
    }
    info!(
        "{} tokens in {} components",
        components.len(),
        components.len() - merges
    );

    let mut writer: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("could not create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    writeln!(writer, "token\tcomponent")?;
    for id in 1..=components.len() {
        let component = components.component(id);
        writeln!(writer, "{}\t{}", components.token(id), component)?;
    }
    writer.flush()?;
    Ok(())
}

fn run_index(links: PathBuf, index_path: PathBuf, verify: bool) -> Result<()> {
    let index = OffsetIndex::build(&links)?;
    index.write(&index_path)?;
    info!("index written to {}", index_path.display());

    if verify {
        OffsetIndex::read(&index_path)?.verify(&links)?;
        info!("index {} passed", index_path.display());
    }
    Ok(())
}

fn run_optimise(args: OptimiseArgs) -> Result<()> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build_global()?;

    let files = InputFiles {
        nids: args.nids,
        trees: args.trees,
        links: args.links,
        index: args.index,
        transfers: args.transfers,
        resume: args.resume,
    };
    let params = ScoringParams {
        resolution: args.resolution,
        exponential_e: args.exponential_e,
        exponential_f: args.exponential_f,
        relative_overhang: args.relative_overhang,
        only_query: args.only_query,
    };
    let config = OptimizerConfig {
        disallow_shortening: args.disallow_shortening,
        descend: args.descend,
    };
    let driver = DriverConfig {
        max_iterations: args.max_iterations,
        min_abs_improvement: args.min_abs_improvement,
        min_rel_improvement: args.min_rel_improvement,
        domains: Some(args.domains.clone()),
        report_cost: args.report_cost,
    };

    let mut state = OptimizerState::initialise(&files, &params, config)?;
    info!("{} partitions at start", state.num_partitions());

    let report = optimise(&mut state, &driver)?;
    // Written even when no iteration ran
    state.save_partitions(&args.domains)?;

    info!(
        "{} iterations, {} domains, stopped on {:?}",
        report.iterations.len(),
        state.num_partitions(),
        report.stop
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Components { input, output } => run_components(input, output),
        Command::Index {
            links,
            index,
            verify,
        } => run_index(links, index, verify),
        Command::Optimise(args) => run_optimise(args),
    }
}
