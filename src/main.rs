//! tilesched Command Line Interface
//!
//! Usage:
//!   tilesched [OPTIONS] <graph.json>
//!   tilesched --help
//!
//! Examples:
//!   tilesched model.json                          # Schedule for the CPU preset
//!   tilesched --target=npu -n 64 model.json       # NPU preset, 64 search iterations
//!   tilesched --target-file=edge.json model.json  # Custom memory hierarchy
//!   tilesched --emit=python -o trace.py model.json

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use std::fs;
use std::path::PathBuf;
use tilesched::codegen::{emit, Emit};
use tilesched::ir::GridGraph;
use tilesched::pipeline::Pipeline;
use tilesched::search::{ScheduleConfig, SearchConfig};
use tilesched::solver::SolveOptions;
use tilesched::target::TargetOptions;

/// tilesched - tiling, fusion and buffer placement for tensor graphs
#[derive(Parser, Debug)]
#[command(name = "tilesched")]
#[command(version)]
#[command(about = "Schedules tensor dataflow graphs onto a memory hierarchy", long_about = None)]
struct Cli {
    /// Dataflow graph to schedule (JSON)
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Output file (defaults to stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Built-in target preset
    #[arg(short, long, default_value = "cpu")]
    target: TargetArg,

    /// Target description (JSON); overrides --target
    #[arg(long, value_name = "FILE")]
    target_file: Option<PathBuf>,

    /// Grid expression to schedule (defaults to the last one)
    #[arg(long, value_name = "INDEX")]
    root: Option<usize>,

    /// Merge search iterations; 0 schedules the unfused graph
    #[arg(short = 'n', long, default_value = "32")]
    iterations: usize,

    /// Random seed of the merge search
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Node budget of each constraint solve
    #[arg(long)]
    max_nodes: Option<u64>,

    /// What to emit
    #[arg(long, default_value = "program")]
    emit: EmitKind,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress warnings)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    /// Cache-based CPU with unified memory
    Cpu,
    /// Accelerator with two scratchpads
    Npu,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmitKind {
    /// Scheduled program
    Program,
    /// Python trace script
    Python,
    /// Tile graph (DOT format)
    Dot,
    /// Buffer graph and memory layout
    Buffers,
}

impl From<EmitKind> for Emit {
    fn from(kind: EmitKind) -> Self {
        match kind {
            EmitKind::Program => Emit::Program,
            EmitKind::Python => Emit::Python,
            EmitKind::Dot => Emit::Dot,
            EmitKind::Buffers => Emit::Buffers,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    info!("tilesched v{}", tilesched::VERSION);
    debug!("Input file: {:?}", cli.input);

    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("Failed to read input file: {:?}", cli.input))?;
    let grid = GridGraph::from_json(&source)
        .with_context(|| format!("Failed to parse graph: {:?}", cli.input))?;

    let target = load_target(&cli)?;
    debug!("Target: {:?}", target);

    let root = match cli.root {
        Some(index) if index < grid.len() => tilesched::ir::ExprId(index),
        Some(index) => bail!("root {} is out of range: the graph has {} expressions", index, grid.len()),
        None => grid.last().context("the graph is empty")?,
    };

    let config = build_config(&cli);
    debug!("Schedule config: {:?}", config);

    info!("Scheduling...");
    let region = match Pipeline::new(target, config).run(&grid, root) {
        Ok(region) => region,
        Err(e) => {
            error!("Scheduling failed: {}", e);
            return Err(e).context("Failed to schedule graph");
        }
    };
    for point in &region.actions {
        info!("merged {}", point);
    }

    let output = emit(cli.emit.into(), &region.call, &region.graph, &region.schedule);
    write_output(&cli.output, &output)
}

fn load_target(cli: &Cli) -> Result<TargetOptions> {
    match &cli.target_file {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read target file: {:?}", path))?;
            TargetOptions::from_json(&text)
                .with_context(|| format!("Failed to parse target file: {:?}", path))
        }
        None => Ok(match cli.target {
            TargetArg::Cpu => TargetOptions::cpu(),
            TargetArg::Npu => TargetOptions::npu(),
        }),
    }
}

fn build_config(cli: &Cli) -> ScheduleConfig {
    let mut solve = SolveOptions::default();
    if let Some(nodes) = cli.max_nodes {
        solve = solve.max_nodes(nodes);
    }
    ScheduleConfig::new()
        .with_search(cli.iterations > 0)
        .search_config(SearchConfig::new().iterations(cli.iterations).seed(cli.seed))
        .solve_options(solve)
}

fn write_output(path: &Option<PathBuf>, content: &str) -> Result<()> {
    match path {
        Some(p) => {
            fs::write(p, content)
                .with_context(|| format!("Failed to write output file: {:?}", p))?;
        }
        None => {
            print!("{}", content);
        }
    }
    Ok(())
}
