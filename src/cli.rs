//! # Command line interface for `serotyper`
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::score::{ScoreMetric, WeightMetric};

#[derive(Parser)]
#[command(
    name="serotyper",
    author,
    version,
    about="In silico serotyping of bacterial genome assemblies",
    long_about = None,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Print debug messages to stderr
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Type assemblies (fasta, optionally gzipped) against a locus database
    Assembly(AssemblyArgs),
    /// Convert previously written JSON results into other formats
    Convert(ConvertArgs),
    /// Extract database entries as FASTA
    Extract(ExtractArgs),
}

#[derive(Args)]
pub struct AssemblyArgs {
    /// Locus database. Expected format is JSON
    #[arg(short, long)]
    pub db: PathBuf,

    /// Assemblies in fasta(.gz) format
    #[arg(required = true)]
    pub input: Vec<PathBuf>,

    /// Output table file, appended to when it exists (default: stdout)
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Also write results to this file as one JSON object per line
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Also write per-sample locus, gene and protein sequences to this directory
    #[arg(long)]
    pub fasta: Option<PathBuf>,

    /// Do not print the table header line
    #[arg(long)]
    pub no_header: bool,

    /// Sample name override; only sensible with a single input
    #[arg(long)]
    pub sample: Option<String>,

    /// Number of threads for the aligner and for typing assemblies in parallel
    #[arg(short, long, default_value_t = 1, value_parser = threads_in_range)]
    pub threads: usize,

    /// Minimum percent coverage for a gene alignment to be used for scoring
    #[arg(long, default_value_t = 50.0)]
    pub min_cov: f64,

    /// Alignment metric to use for scoring
    #[arg(long, value_enum, default_value_t = ScoreMetric::MatchingBases)]
    pub score: ScoreMetric,

    /// Weighting for the scoring metric
    #[arg(long, value_enum, default_value_t = WeightMetric::PropFound)]
    pub weight: WeightMetric,

    /// Number of full-length candidate loci carried through to the second
    /// scoring stage
    #[arg(long, default_value_t = 1)]
    pub max_full: usize,

    /// Species-level gene identity threshold (default: database specific)
    #[arg(long)]
    pub gene_threshold: Option<f64>,

    /// Maximum number of unexpected in-locus genes for a typeable result
    #[arg(long, default_value_t = 1)]
    pub max_other_genes: usize,

    /// Minimum percentage of expected genes found for a typeable result
    #[arg(long, default_value_t = 50.0)]
    pub percent_expected_genes: f64,

    /// Keep results with below-threshold gene identities typeable
    #[arg(long)]
    pub allow_below_threshold: bool,
}

#[derive(Args)]
pub struct ConvertArgs {
    /// Locus database the results were typed against. Expected format is JSON
    #[arg(short, long)]
    pub db: PathBuf,

    /// Result files, one JSON object per line
    #[arg(required = true)]
    pub json: Vec<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = ConvertFormat::Json)]
    pub format: ConvertFormat,

    /// Only convert results for these sample names
    #[arg(short, long, num_args = 1..)]
    pub samples: Vec<String>,

    /// Only convert results matching these best-match loci
    #[arg(short, long, num_args = 1..)]
    pub loci: Vec<String>,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConvertFormat {
    /// JSON, one object per line
    Json,
    /// Tab-separated values
    Tsv,
    /// Locus nucleotide sequences in fasta format
    Locus,
    /// Gene nucleotide sequences in fasta format
    Genes,
    /// Protein sequences in fasta format
    Proteins,
}

#[derive(Args)]
pub struct ExtractArgs {
    /// Locus database. Expected format is JSON
    #[arg(short, long)]
    pub db: PathBuf,

    /// What to extract
    #[arg(value_enum)]
    pub format: ExtractFormat,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExtractFormat {
    /// Locus nucleotide sequences
    Loci,
    /// Gene nucleotide sequences
    Genes,
    /// Gene protein sequences
    Proteins,
}

fn threads_in_range(s: &str) -> Result<usize> {
    let threads = s
        .parse()
        .context("Could not parse value passed to --threads to integer")?;
    if threads < 1 {
        bail!("--threads must be at least 1");
    }
    Ok(threads)
}
