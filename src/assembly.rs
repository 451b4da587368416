//! # Assemblies and the external aligner
//!
//! A bacterial genome assembly is an ordered set of named contigs read from
//! a (optionally gzipped) FASTA file. Alignments against an assembly are
//! produced by a minimap2 child process that receives the query FASTA on
//! stdin and writes PAF to stdout; the exchange is a single blocking
//! write-all-then-read-all and the exit code is not consulted, the PAF
//! reader deals with empty or malformed output.
use std::{
    io::{BufRead, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{bail, Context, Result};
use bio::alphabets::dna;
use bio::io::fasta;
use indexmap::IndexMap;
use log::debug;

use crate::{
    alignment::{iter_alns, Alignment, Strand},
    io::open_read_maybe_gz,
    utils::sample_name_from_path,
};

/// One contig of an assembly: name, description, and sequence.
#[derive(Debug)]
pub struct Contig {
    pub name: String,
    pub desc: String,
    pub seq: Vec<u8>,
}

impl Contig {
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}

#[derive(Debug)]
pub struct Assembly {
    pub path: PathBuf,
    pub name: String,
    pub contigs: IndexMap<String, Contig>,
}

impl Assembly {
    /// Read an assembly from a FASTA file, transparently decompressing
    /// `.gz` input. The sample name is the file name with `.gz` and the
    /// final extension stripped.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Assembly> {
        let path = path.as_ref();
        let name = sample_name_from_path(
            path.to_str().with_context(|| format!("Non-UTF8 path {}", path.display()))?,
        )?;
        let reader = open_read_maybe_gz(path)?;
        let mut assembly = Self::from_reader(&name, reader)
            .with_context(|| format!("Could not read assembly {}", path.display()))?;
        assembly.path = path.to_path_buf();
        Ok(assembly)
    }

    pub fn from_reader(name: &str, reader: impl BufRead) -> Result<Assembly> {
        let mut contigs = IndexMap::new();
        for record in fasta::Reader::from_bufread(reader).records() {
            let record = record.context("Invalid FASTA record")?;
            contigs.insert(
                record.id().to_string(),
                Contig {
                    name: record.id().to_string(),
                    desc: record.desc().unwrap_or_default().to_string(),
                    seq: record.seq().to_vec(),
                },
            );
        }
        if contigs.is_empty() {
            bail!("No contigs found in assembly {name}");
        }
        Ok(Assembly { path: PathBuf::new(), name: name.to_string(), contigs })
    }

    /// Extract `[start, end)` from a contig, reverse-complemented when
    /// `strand` is `-`.
    pub fn seq(&self, ctg: &str, start: usize, end: usize, strand: Strand) -> Result<Vec<u8>> {
        let contig = self
            .contigs
            .get(ctg)
            .with_context(|| format!("Assembly {} has no contig {ctg}", self.name))?;
        if start > end || end > contig.len() {
            bail!("Range {start}-{end} out of bounds for contig {ctg} ({} bp)", contig.len());
        }
        let slice = &contig.seq[start..end];
        Ok(match strand {
            Strand::Reverse => dna::revcomp(slice),
            _ => slice.to_vec(),
        })
    }

    /// Map a FASTA blob of query sequences against this assembly with
    /// minimap2, returning the parsed PAF records. `threads` is passed
    /// through to the aligner.
    pub fn map(&self, queries: &str, threads: usize) -> Result<Vec<Alignment>> {
        let mut child = Command::new("minimap2")
            .arg("-c")
            .arg("-t")
            .arg(threads.to_string())
            .arg(&self.path)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to launch minimap2")?;
        let mut stdin = child.stdin.take().context("Failed to open minimap2 stdin")?;
        let mut stdout = child.stdout.take().context("Failed to open minimap2 stdout")?;

        let paf = std::thread::scope(|scope| -> Result<String> {
            let writer = scope.spawn(move || {
                // A write error means the aligner exited early; the empty or
                // truncated PAF stream is handled downstream.
                if let Err(e) = stdin.write_all(queries.as_bytes()) {
                    debug!("Error writing to minimap2 stdin: {e}");
                }
            });
            let mut paf = String::new();
            stdout.read_to_string(&mut paf).context("Error reading minimap2 output")?;
            let _ = writer.join();
            Ok(paf)
        })?;
        let _ = child.wait();

        Ok(iter_alns(&paf).collect())
    }
}
