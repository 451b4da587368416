//! # Alignment records
//!
//! Parsing and handling of alignments in PAF format as produced by minimap2.
//! The typing pipeline never computes alignments itself, it only consumes the
//! PAF stream written by the external aligner, so this module is the single
//! place where coordinates enter the crate. All coordinates are 0-based and
//! half-open, as in the PAF specification.
use std::{collections::HashMap, fmt};

use anyhow::{anyhow, bail, Context, Result};
use log::warn;

use crate::utils::range_overlap;

/// Strand of an alignment or a gene relative to its reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strand {
    Forward,
    Reverse,
    #[default]
    Unknown,
}

impl Strand {
    pub fn from_symbol(s: &str) -> Strand {
        match s {
            "+" => Strand::Forward,
            "-" => Strand::Reverse,
            _ => Strand::Unknown,
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strand::Forward => write!(f, "+"),
            Strand::Reverse => write!(f, "-"),
            Strand::Unknown => write!(f, "unknown"),
        }
    }
}

/// A typed value from the `TAG:TYPE:VALUE` columns of a PAF line.
/// `i` tags are integers, `f` tags are floats, everything else is kept as a
/// string.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Int(i64),
    Float(f64),
    String(String),
}

impl TagValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TagValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// One alignment parsed from a PAF line. Immutable after parsing.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Query sequence name
    pub q: String,
    /// Query sequence length
    pub q_len: usize,
    /// Query start coordinate
    pub q_st: usize,
    /// Query end coordinate
    pub q_en: usize,
    /// Strand of the query relative to the target
    pub strand: Strand,
    /// Target (contig) sequence name
    pub ctg: String,
    /// Target sequence length
    pub ctg_len: usize,
    /// Target start coordinate on the original strand
    pub r_st: usize,
    /// Target end coordinate on the original strand
    pub r_en: usize,
    /// Number of matching bases in the alignment
    pub mlen: usize,
    /// Number of bases, including gaps, in the alignment
    pub blen: usize,
    /// Mapping quality (0-255, 255 for missing)
    pub mapq: u8,
    /// Optional `TAG:TYPE:VALUE` fields
    pub tags: HashMap<String, TagValue>,
}

impl Alignment {
    /// Parse a line in PAF format.
    pub fn from_paf_line(line: &str) -> Result<Alignment> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            bail!("Line has < 12 columns: {line}");
        }
        let parse_int = |i: usize| -> Result<usize> {
            fields[i]
                .parse()
                .with_context(|| format!("Invalid integer in PAF column {}: {}", i + 1, fields[i]))
        };
        let mut tags = HashMap::new();
        for field in &fields[12..] {
            let mut parts = field.splitn(3, ':');
            let (tag, typ, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(tag), Some(typ), Some(value)) => (tag, typ, value),
                _ => bail!("Invalid tag field '{field}' in line: {line}"),
            };
            let value = match typ {
                "i" => TagValue::Int(
                    value.parse().with_context(|| format!("Invalid integer tag '{field}'"))?,
                ),
                "f" => TagValue::Float(
                    value.parse().with_context(|| format!("Invalid float tag '{field}'"))?,
                ),
                _ => TagValue::String(value.to_string()),
            };
            tags.insert(tag.to_string(), value);
        }
        Ok(Alignment {
            q: fields[0].to_string(),
            q_len: parse_int(1)?,
            q_st: parse_int(2)?,
            q_en: parse_int(3)?,
            strand: Strand::from_symbol(fields[4]),
            ctg: fields[5].to_string(),
            ctg_len: parse_int(6)?,
            r_st: parse_int(7)?,
            r_en: parse_int(8)?,
            mlen: parse_int(9)?,
            blen: parse_int(10)?,
            mapq: fields[11].parse().with_context(|| format!("Invalid mapq: {}", fields[11]))?,
            tags,
        })
    }

    /// Integer tag value, e.g. the `AS` alignment score emitted by minimap2.
    pub fn tag_i64(&self, tag: &str) -> Result<i64> {
        self.tags
            .get(tag)
            .and_then(TagValue::as_i64)
            .ok_or_else(|| anyhow!("Alignment {self} has no integer tag '{tag}'"))
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{} {}:{}-{}",
            self.q, self.q_st, self.q_en, self.ctg, self.r_st, self.r_en
        )
    }
}

/// Iterate over the alignments in a chunk of PAF data, skipping lines that
/// cannot be parsed with a warning. The iterator is lazy and single-pass.
pub fn iter_alns(data: &str) -> impl Iterator<Item = Alignment> + '_ {
    data.lines().filter_map(|line| match Alignment::from_paf_line(line) {
        Ok(aln) => Some(aln),
        Err(e) => {
            warn!("Skipping invalid alignment line: {e}");
            None
        }
    })
}

/// Group alignments by a key, e.g. the query gene name or the target contig.
/// Alignments are stably sorted on the key first, so ordering within a group
/// is the input order.
pub fn group_alns(
    alns: impl IntoIterator<Item = Alignment>,
    key: fn(&Alignment) -> &str,
) -> Vec<(String, Vec<Alignment>)> {
    let mut alns: Vec<Alignment> = alns.into_iter().collect();
    alns.sort_by(|a, b| key(a).cmp(key(b)));
    let mut groups: Vec<(String, Vec<Alignment>)> = Vec::new();
    for aln in alns {
        match groups.last_mut() {
            Some((k, group)) if k == key(&aln) => group.push(aln),
            _ => groups.push((key(&aln).to_string(), vec![aln])),
        }
    }
    groups
}

/// Yield the alignments that do not conflict with the `keep` alignment.
/// Two alignments conflict when they are on the same contig and the overlap
/// makes up at least `overlap_fraction` of the candidate's aligned bases.
pub fn cull(
    keep: &Alignment,
    alignments: impl IntoIterator<Item = Alignment>,
    overlap_fraction: f64,
) -> Vec<Alignment> {
    alignments
        .into_iter()
        .filter(|a| {
            a.ctg != keep.ctg
                || (range_overlap((a.r_st, a.r_en), (keep.r_st, keep.r_en)) as f64 / a.blen as f64)
                    < overlap_fraction
        })
        .collect()
}

/// Reduce a set of alignments to a pairwise non-conflicting subset, greedily
/// keeping the highest `mlen` first. Ties in `mlen` keep the input order.
pub fn cull_all(alignments: Vec<Alignment>, overlap_fraction: f64) -> Vec<Alignment> {
    let mut kept = Vec::new();
    let mut sorted = alignments;
    sorted.sort_by(|a, b| b.mlen.cmp(&a.mlen));
    while !sorted.is_empty() {
        let keep = sorted.remove(0);
        sorted = cull(&keep, sorted, overlap_fraction);
        kept.push(keep);
    }
    kept
}
