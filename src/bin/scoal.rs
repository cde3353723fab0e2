use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use scoal_rs::io::config::load_config;
use scoal_rs::io::newick::read_tree;
use scoal_rs::logger::RootProbsLogger;
use scoal_rs::progress;
use scoal_rs::ScoalError;

#[derive(Parser, Debug)]
#[command(name = "scoal")]
#[command(about = "Structured-coalescent tree likelihood under ODE population models", long_about = None)]
struct Cli {
    config_file: PathBuf,
    tree_file: PathBuf,
    /// Write per-sample root-state probabilities as TSV.
    #[arg(long)]
    root_out: Option<PathBuf>,
    /// Write per-node ancestral-state posteriors as TSV (needs
    /// "ancestral": true in the config).
    #[arg(long)]
    ancestral_out: Option<PathBuf>,
    /// Number of evaluations to log.
    #[arg(long, default_value_t = 1)]
    samples: u64,
    #[arg(long)]
    no_progress: bool,
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ScoalError>() {
        Some(ScoalError::Integration(_)) => 2,
        _ => 1,
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("scoal: error: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let config = load_config(&cli.config_file)?;
    let tree = read_tree(&cli.tree_file)?;
    let mut engine = config.build_engine(tree)?;

    let mut logger = match &cli.root_out {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("failed to create {:?}", path))?;
            Some(RootProbsLogger::new(
                BufWriter::new(file),
                engine.num_demes(),
            )?)
        }
        None => None,
    };

    let samples = cli.samples.max(1);
    let pb = if cli.no_progress {
        None
    } else if samples > 1 {
        Some(progress::bar(samples, "scoal", "evaluating"))
    } else {
        Some(progress::spinner("scoal", "evaluating likelihood"))
    };
    let mut log_p = f64::NEG_INFINITY;
    for sample in 0..samples {
        log_p = engine.calculate_log_p()?;
        if let Some(logger) = logger.as_mut() {
            logger.log(sample, engine.root_probs())?;
        }
        if let Some(pb) = &pb {
            if samples > 1 {
                pb.inc(1);
            }
        }
    }
    if let Some(pb) = pb {
        pb.finish_with_message("likelihood done");
    }
    if let Some(logger) = logger {
        logger.finish()?;
    }

    if let Some(path) = &cli.ancestral_out {
        write_ancestral(&engine, path)?;
    }

    println!("logP = {log_p}");
    if engine.integration_failed() {
        return Ok(2);
    }
    Ok(0)
}

fn write_ancestral(engine: &scoal_rs::StructuredTreeLikelihood, path: &PathBuf) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let mut out = BufWriter::new(file);
    write!(out, "node\theight")?;
    for name in engine.deme_names() {
        write!(out, "\t{name}")?;
    }
    writeln!(out)?;
    let tree = engine.tree();
    for node in 0..tree.n_nodes {
        if let Some(p) = engine.ancestral_probs(node) {
            write!(out, "{node}\t{}", tree.height[node])?;
            for v in p {
                write!(out, "\t{v}")?;
            }
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}
