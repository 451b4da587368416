//! # serotyper
//!
//! This library serves as the backbone for the `serotyper` binary, which
//! performs in silico serotyping of bacterial genome assemblies: it selects
//! the reference locus best matching an assembly, reconstructs that locus
//! from the assembly contigs, and reports per-gene evidence together with a
//! phenotype, problems, and confidence verdict.
pub mod alignment;
pub mod assembly;
pub mod cli;
pub mod database;
pub mod io;
pub mod score;
pub mod translate;
pub mod typing;
pub mod utils;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::{
    alignment::{cull, cull_all, group_alns, Alignment},
    assembly::Assembly,
    database::Database,
    score::{score_loci, BestMatch, ScoringParams},
    typing::{GenePhenotype, GeneResult, GeneType, LocusPiece, TypingResult},
    utils::{merge_ranges, range_overlap},
};

/// Fraction of a candidate's aligned bases that must overlap a kept
/// alignment for the candidate to be culled.
pub const OVERLAP_FRACTION: f64 = 0.1;

/// Tunables of the typing pipeline. The scoring parameters select the best
/// match; the remainder governs the confidence verdict.
#[derive(Debug, Clone, Copy)]
pub struct TypingParams {
    pub scoring: ScoringParams,
    /// Worker threads passed through to the external aligner
    pub threads: usize,
    /// Unexpected in-locus genes tolerated before a result is untypeable
    pub max_other_genes: usize,
    /// Minimum percentage of expected genes found for a fragmented or
    /// incomplete locus to stay typeable
    pub percent_expected_genes: f64,
    /// Keep below-threshold results typeable
    pub allow_below_threshold: bool,
}

impl Default for TypingParams {
    fn default() -> Self {
        TypingParams {
            scoring: ScoringParams::default(),
            threads: 1,
            max_other_genes: 1,
            percent_expected_genes: 50.0,
            allow_below_threshold: false,
        }
    }
}

/// Type one assembly against the database.
///
/// Runs the external aligner twice (all database genes against the assembly
/// for scoring, then the best-match locus sequence for reconstruction, plus
/// a third pass for extra genes when the best match calls for them), and
/// assembles the finalized [`TypingResult`]. Returns `None` when no gene
/// alignment is sufficient for typing.
pub fn typing_pipeline(
    assembly: &Assembly,
    db: &Database,
    params: &TypingParams,
) -> Result<Option<TypingResult>> {
    let gene_alns = assembly.map(&db.all_gene_fasta(), params.threads)?;
    debug!("{}: {} gene alignments", assembly.name, gene_alns.len());
    let Some(best) = score_loci(gene_alns, db, &params.scoring) else {
        warn!("No gene alignments sufficient for typing {}", assembly.name);
        return Ok(None);
    };
    let (_, best_locus) =
        db.loci.get_index(best.locus_index).context("Best match locus index out of range")?;
    info!("{}: best match {} (zscore {:.2})", assembly.name, best_locus.name, best.zscore);

    let locus_alns = assembly.map(&best_locus.fasta(), params.threads)?;
    let extra_alns = if best_locus.has_extra_phenotype_genes() {
        assembly.map(&db.extra_gene_fasta(), params.threads)?
    } else {
        Vec::new()
    };
    let result = build_result(assembly, db, best, locus_alns, extra_alns, params)?;
    info!("Finished typing {result}");
    Ok(Some(result))
}

/// Assemble a finalized typing result from the scored best match and the
/// best-locus and extra-gene alignments. Separated from [`typing_pipeline`]
/// so the reconstruction and classification stages can run on pre-computed
/// PAF records.
pub fn build_result(
    assembly: &Assembly,
    db: &Database,
    best: BestMatch,
    locus_alns: Vec<Alignment>,
    extra_alns: Vec<Alignment>,
    params: &TypingParams,
) -> Result<TypingResult> {
    let (best_name, best_locus) =
        db.loci.get_index(best.locus_index).context("Best match locus index out of range")?;
    let mut result = TypingResult::new(&assembly.name, best_name, best.zscore);

    // Reconstruct candidate locus pieces from the merged alignment ranges on
    // each contig. Strands are resolved later from the expected-gene members
    // since a piece can merge alignments from both strands.
    let max_span = db.largest_locus().len();
    for (ctg, alns) in group_alns(locus_alns, |a| a.ctg.as_str()) {
        let ranges = alns.iter().map(|a| (a.r_st, a.r_en)).collect();
        for (start, end) in merge_ranges(ranges, max_span) {
            result.pieces.push(LocusPiece::new(&ctg, start, end));
        }
    }

    // Pool the scored gene alignments with the single best alignment of
    // every extra gene.
    let mut alignments = best.alignments;
    for (_, mut group) in group_alns(extra_alns, |a| a.q.as_str()) {
        let mut best_i = 0;
        for (i, a) in group.iter().enumerate().skip(1) {
            if a.mlen > group[best_i].mlen {
                best_i = i;
            }
        }
        alignments.push(group.swap_remove(best_i));
    }

    // Remove other-gene alignments conflicting with each other or with an
    // expected-gene alignment.
    let (expected, other): (Vec<Alignment>, Vec<Alignment>) =
        alignments.into_iter().partition(|a| best_locus.genes.contains_key(&a.q));
    let mut other = cull_all(other, OVERLAP_FRACTION);
    for anchor in &expected {
        other = cull(anchor, other, OVERLAP_FRACTION);
    }

    let mut previous: Option<usize> = None;
    for aln in expected.into_iter().chain(other) {
        let (gene, gene_type) = if let Some(gene) = best_locus.genes.get(&aln.q) {
            (gene, GeneType::Expected)
        } else if let Some(gene) = db.extra_gene(&aln.q) {
            (gene, GeneType::Extra)
        } else if let Some(gene) = db.gene(&aln.q) {
            (gene, GeneType::Unexpected)
        } else {
            warn!("Alignment query {} not found in database, skipping", aln.q);
            continue;
        };
        let piece = result
            .pieces
            .iter()
            .position(|p| p.id == aln.ctg && range_overlap((p.start, p.end), (aln.r_st, aln.r_en)) > 0);
        // Would the gene, extended past the alignment, run off a contig edge?
        let partial = aln.r_st <= aln.q_st
            || aln.r_en <= aln.q_en
            || aln.ctg_len.saturating_sub(aln.r_en) <= gene.len().saturating_sub(aln.q_en);
        let dna = match assembly.seq(&aln.ctg, aln.r_st, aln.r_en, aln.strand) {
            Ok(dna) => dna,
            Err(e) => {
                warn!("Could not extract DNA for {aln}: {e}");
                continue;
            }
        };
        let mut gene_result = GeneResult {
            id: aln.ctg.clone(),
            gene_name: gene.name.clone(),
            gene_index: gene.index,
            start: aln.r_st,
            end: aln.r_en,
            strand: aln.strand,
            piece,
            neighbour_left: previous,
            neighbour_right: None,
            dna_seq: String::from_utf8_lossy(&dna).into_owned(),
            protein_seq: String::new(),
            partial,
            below_threshold: false,
            phenotype: GenePhenotype::Present,
            gene_type,
            percent_identity: 0.0,
            percent_coverage: 0.0,
        };
        gene_result.compare_translation(gene);
        gene_result.below_threshold = gene_result.percent_identity < db.gene_threshold;
        if gene_result.piece.is_none() && gene_result.below_threshold {
            // An unrelated homologue elsewhere in the genome
            continue;
        }
        previous = Some(result.add_gene_result(gene_result));
    }

    result.finalize(
        assembly,
        db,
        params.allow_below_threshold,
        params.max_other_genes,
        params.percent_expected_genes,
    )?;
    Ok(result)
}
