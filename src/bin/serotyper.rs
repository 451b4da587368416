use std::{
    fs::File,
    io::{BufRead, BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, warn};
use rayon::{prelude::*, ThreadPoolBuilder};

use serotyper::{
    assembly::Assembly,
    cli::{AssemblyArgs, Cli, Commands, ConvertArgs, ConvertFormat, ExtractArgs, ExtractFormat},
    database::Database,
    io::{open_read_maybe_gz, OutputOptions, ResultWriter},
    score::ScoringParams,
    typing::TypingResult,
    typing_pipeline, utils, TypingParams,
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    match cli.command {
        Commands::Assembly(args) => run_assembly(args),
        Commands::Convert(args) => run_convert(args),
        Commands::Extract(args) => run_extract(args),
    }
}

fn run_assembly(args: AssemblyArgs) -> Result<()> {
    utils::check_program("minimap2")?;
    let mut db = Database::from_json(&args.db)?;
    if let Some(threshold) = args.gene_threshold {
        db.gene_threshold = threshold;
    }
    let writer = ResultWriter::new(&OutputOptions {
        tsv: args.out,
        json: args.json,
        fasta_dir: args.fasta,
        no_header: args.no_header,
    })?;
    let params = TypingParams {
        scoring: ScoringParams {
            min_cov: args.min_cov,
            max_full: args.max_full,
            score_metric: args.score,
            weight_metric: args.weight,
        },
        threads: args.threads,
        max_other_genes: args.max_other_genes,
        percent_expected_genes: args.percent_expected_genes,
        allow_below_threshold: args.allow_below_threshold,
    };
    let sample = match (&args.sample, args.input.len()) {
        (Some(_), n) if n > 1 => {
            warn!("--sample is ignored when typing more than one assembly");
            None
        }
        (sample, _) => sample.as_deref(),
    };

    ThreadPoolBuilder::new().num_threads(args.threads).build_global()?;
    args.input.par_iter().for_each(|input| {
        // Each assembly is typed independently; an error fails that assembly
        // only and the run continues.
        if let Err(e) = type_one(input, sample, &db, &params, &writer) {
            error!("Error typing {}: {e:?}", input.display());
        }
    });
    Ok(())
}

fn type_one(
    path: &Path,
    sample: Option<&str>,
    db: &Database,
    params: &TypingParams,
    writer: &ResultWriter,
) -> Result<()> {
    let mut assembly = Assembly::from_path(path)?;
    if let Some(sample) = sample {
        assembly.name = sample.to_string();
    }
    match typing_pipeline(&assembly, db, params)? {
        Some(result) => writer.write(&result, db),
        None => Ok(()),
    }
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    let db = Database::from_json(&args.db)?;
    let mut results: Vec<TypingResult> = Vec::new();
    for file in &args.json {
        for line in open_read_maybe_gz(file)?.lines() {
            let line = line.with_context(|| format!("Error reading {}", file.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            if !passes_filters(&line, &args.samples, &args.loci) {
                continue;
            }
            match TypingResult::from_json(&line, &db) {
                Ok(result) => results.push(result),
                Err(e) => warn!("Skipping result line in {}: {e}", file.display()),
            }
        }
    }

    let mut out = open_out(args.out.as_deref())?;
    match args.format {
        ConvertFormat::Json => {
            for result in &results {
                writeln!(out, "{}", result.to_json()?)?;
            }
        }
        ConvertFormat::Tsv => {
            let mut tsv = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
            tsv.write_record(TypingResult::tsv_headers())?;
            for result in &results {
                tsv.write_record(result.tsv_row(&db)?)?;
            }
            tsv.flush()?;
        }
        ConvertFormat::Locus => {
            for result in &results {
                out.write_all(result.locus_fasta().as_bytes())?;
            }
        }
        ConvertFormat::Genes => {
            for result in &results {
                out.write_all(result.gene_fasta().as_bytes())?;
            }
        }
        ConvertFormat::Proteins => {
            for result in &results {
                out.write_all(result.protein_fasta().as_bytes())?;
            }
        }
    }
    Ok(())
}

/// Cheap sample/locus filter on the raw JSON line, applied before the full
/// rehydration.
fn passes_filters(line: &str, samples: &[String], loci: &[String]) -> bool {
    if samples.is_empty() && loci.is_empty() {
        return true;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return true; // let rehydration report the parse error
    };
    let field = |key: &str| value.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    (samples.is_empty() || samples.contains(&field("sample_name")))
        && (loci.is_empty() || loci.contains(&field("best_match")))
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let db = Database::from_json(&args.db)?;
    let fasta = match args.format {
        ExtractFormat::Loci => db.all_locus_fasta(),
        ExtractFormat::Genes => db.all_gene_fasta(),
        ExtractFormat::Proteins => db.all_protein_fasta(),
    };
    open_out(args.out.as_deref())?.write_all(fasta.as_bytes())?;
    Ok(())
}

fn open_out(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Could not create {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout()),
    })
}
