//! # Root for utility functions in `serotyper`
//!
//! Miscellaneous helpers shared across the crate: interval arithmetic used by
//! the overlap culler and the locus reconstructor, and filename handling for
//! inferring sample names from assembly paths.
use std::{
    cmp,
    path::Path,
    process::{Command, Stdio},
};

use anyhow::{bail, Context, Result};

/// Determine the overlap between two ranges, each specified by their start
/// and end coordinates.
/// **NOTE:** ranges follow the 0-based half-open coordinate system: [start, end)
///
/// # Examples
///
/// ```
/// let overlap = serotyper::utils::range_overlap((10, 15), (13, 25));
/// assert_eq!(2, overlap);
/// ```
pub fn range_overlap(a: (usize, usize), b: (usize, usize)) -> usize {
    let lo = cmp::max(a.0, b.0);
    let hi = cmp::min(a.1, b.1);
    hi.saturating_sub(lo)
}

/// Merge overlapping intervals into contiguous ranges, never letting a merged
/// range span more than `max_span` bases. Input intervals do not need to be
/// sorted. Output intervals are sorted and pairwise disjoint.
///
/// # Examples
///
/// ```
/// use serotyper::utils::merge_ranges;
///
/// let merged = merge_ranges(vec![(20, 30), (0, 12), (10, 15)], 100);
/// assert_eq!(vec![(0, 15), (20, 30)], merged);
/// ```
pub fn merge_ranges(mut intervals: Vec<(usize, usize)>, max_span: usize) -> Vec<(usize, usize)> {
    intervals.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(intervals.len());
    let mut intervals = intervals.into_iter();
    let Some(mut acc) = intervals.next() else {
        return merged;
    };
    for (start, end) in intervals {
        let span = cmp::max(acc.1, end) - acc.0;
        if start <= acc.1 && span <= max_span {
            acc.1 = cmp::max(acc.1, end);
        } else {
            merged.push(acc);
            acc = (start, end);
        }
    }
    merged.push(acc);
    merged
}

/// Infer a sample name from the filepath of an assembly file.
/// A trailing `.gz` is stripped before the final extension.
///
/// # Examples
///
/// ```
/// let name = serotyper::utils::sample_name_from_path("./path/to/sample.fasta.gz").unwrap();
/// assert_eq!("sample", name);
/// ```
pub fn sample_name_from_path(filepath: &str) -> Result<String> {
    let context = || format!("Could not infer sample name from path {filepath}");
    let name = Path::new(filepath)
        .file_name()
        .with_context(context)?
        .to_str()
        .with_context(context)?;
    let name = name.strip_suffix(".gz").unwrap_or(name);
    Ok(name.rsplit_once('.').map_or(name, |(stem, _)| stem).to_string())
}

/// Check that an external program can be launched. Used to fail early when
/// the aligner is not on PATH rather than mid-pipeline.
pub fn check_program(program: &str) -> Result<()> {
    match Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(_) => Ok(()),
        Err(e) => bail!("Could not run '{program}', is it installed and on PATH? ({e})"),
    }
}
