//! # Input/output plumbing
//!
//! Transparent gzip reading for FASTA input and the shared result writers.
//! Several assemblies may be typed in parallel, so all writes to the shared
//! TSV and JSON outputs funnel through one mutex-guarded writer per file;
//! per-sample FASTA files are written independently.
use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, Context, Result};
use flate2::bufread::MultiGzDecoder;
use log::info;

use crate::{database::Database, typing::TypingResult};

/// Transparently open a file with a gzip decoder when the path ends in
/// `.gz`.
pub fn open_read_maybe_gz<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Could not open {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Destinations for typing results. `tsv` falls back to stdout when unset;
/// the JSON and FASTA outputs are only written when requested.
#[derive(Debug, Default)]
pub struct OutputOptions {
    pub tsv: Option<PathBuf>,
    pub json: Option<PathBuf>,
    pub fasta_dir: Option<PathBuf>,
    pub no_header: bool,
}

/// Shared, thread-safe writer set for typing results.
pub struct ResultWriter {
    tsv: Mutex<csv::Writer<Box<dyn Write + Send>>>,
    json: Option<Mutex<Box<dyn Write + Send>>>,
    fasta_dir: Option<PathBuf>,
}

impl ResultWriter {
    /// Open the requested outputs, appending to existing files. The TSV
    /// header is written once, unless suppressed or the file already holds
    /// content from an earlier run.
    pub fn new(options: &OutputOptions) -> Result<ResultWriter> {
        let (tsv, mut write_header): (Box<dyn Write + Send>, bool) = match &options.tsv {
            Some(path) => {
                let file = open_append(path)?;
                let fresh = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
                (Box::new(file), fresh)
            }
            None => (Box::new(std::io::stdout()), true),
        };
        write_header &= !options.no_header;
        let mut tsv = csv::WriterBuilder::new().delimiter(b'\t').from_writer(tsv);
        if write_header {
            tsv.write_record(TypingResult::tsv_headers())
                .context("Could not write table header")?;
            tsv.flush()?;
        }
        let json = match &options.json {
            Some(path) => Some(Mutex::new(Box::new(open_append(path)?) as Box<dyn Write + Send>)),
            None => None,
        };
        if let Some(dir) = &options.fasta_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("Could not create {}", dir.display()))?;
        }
        Ok(ResultWriter { tsv: Mutex::new(tsv), json, fasta_dir: options.fasta_dir.clone() })
    }

    /// Write one typing result to every configured output.
    pub fn write(&self, result: &TypingResult, db: &Database) -> Result<()> {
        let row = result.tsv_row(db)?;
        {
            let mut tsv = self.tsv.lock().map_err(|_| anyhow!("Poisoned table writer lock"))?;
            tsv.write_record(&row).context("Could not write table row")?;
            tsv.flush()?;
        }
        if let Some(json) = &self.json {
            let line = result.to_json()?;
            let mut json = json.lock().map_err(|_| anyhow!("Poisoned JSON writer lock"))?;
            writeln!(json, "{line}").context("Could not write JSON result")?;
        }
        if let Some(dir) = &self.fasta_dir {
            for (ext, content) in [
                ("fna", result.locus_fasta()),
                ("ffn", result.gene_fasta()),
                ("faa", result.protein_fasta()),
            ] {
                let path = dir.join(format!("{}_typing_results.{ext}", result.sample_name));
                fs::write(&path, content)
                    .with_context(|| format!("Could not write {}", path.display()))?;
            }
            info!("Wrote locus sequences for {} to {}", result.sample_name, dir.display());
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Could not open {} for writing", path.display()))
}
