//! # Locus scoring and best-match selection
//!
//! Aggregates per-gene alignments of the whole database gene set against an
//! assembly into per-locus scores, weights them, and picks the best-match
//! locus. The per-gene best alignment is the one with the most matching
//! bases; a gene only counts when its best alignment passes the coverage
//! gate `q_len / blen * 100 >= min_cov`.
use clap::ValueEnum;
use log::warn;
use ndarray::prelude::*;

use crate::{
    alignment::{group_alns, Alignment},
    database::Database,
};

/// Alignment metric contributing to a locus score. Each counted gene adds
/// `metric / blen` to the score of its locus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScoreMetric {
    /// minimap2 DP alignment score (`AS` tag)
    #[value(name = "AS")]
    AlignmentScore,
    /// Matching bases
    #[value(name = "mlen")]
    MatchingBases,
    /// Aligned bases including gaps
    #[value(name = "blen")]
    AlignedBases,
    /// Query gene length
    #[value(name = "q_len")]
    QueryLength,
}

/// Weighting applied to the accumulated locus scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WeightMetric {
    /// No weighting
    #[value(name = "none")]
    None,
    /// Multiply by the number of locus genes found
    #[value(name = "n_found")]
    GenesFound,
    /// Divide by the number of locus genes expected
    #[value(name = "n_expected")]
    GenesExpected,
    /// Multiply by the proportion of locus genes found
    #[value(name = "prop_found")]
    PropFound,
    /// Divide by the total aligned bases of the counted best alignments
    #[value(name = "blen")]
    AlignedBases,
    /// Divide by the total query length of the counted best alignments
    #[value(name = "q_len")]
    QueryLength,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoringParams {
    /// Minimum percent coverage for a gene alignment to be counted
    pub min_cov: f64,
    /// Number of full-length candidate loci carried through to a future
    /// second scoring stage; accepted and recorded, no further effect yet
    pub max_full: usize,
    pub score_metric: ScoreMetric,
    pub weight_metric: WeightMetric,
}

impl Default for ScoringParams {
    fn default() -> Self {
        ScoringParams {
            min_cov: 50.0,
            max_full: 1,
            score_metric: ScoreMetric::MatchingBases,
            weight_metric: WeightMetric::PropFound,
        }
    }
}

/// Outcome of best-match selection.
#[derive(Debug)]
pub struct BestMatch {
    /// Index of the best-match locus in the database locus order
    pub locus_index: usize,
    /// Z-score of the best-match locus across all weighted locus scores
    pub zscore: f64,
    /// Every alignment of every gene group whose best alignment passed the
    /// coverage gate, for all loci; downstream classification needs the
    /// losing loci's alignments to fill the unexpected and outside-locus
    /// categories.
    pub alignments: Vec<Alignment>,
}

/// Score all loci from the grouped gene alignments and select the best
/// match. Returns `None` when no gene alignment passes the coverage gate.
/// Ties in the weighted score keep the first locus in database order.
pub fn score_loci(
    gene_alns: Vec<Alignment>,
    db: &Database,
    params: &ScoringParams,
) -> Option<BestMatch> {
    let n = db.len();
    let mut scores = Array1::<f64>::zeros(n);
    let mut found = Array1::<f64>::zeros(n);
    let mut blen_totals = Array1::<f64>::zeros(n);
    let mut qlen_totals = Array1::<f64>::zeros(n);
    let expected = Array1::from_iter(db.loci.values().map(|l| l.genes.len() as f64));
    let mut kept: Vec<Alignment> = Vec::new();

    for (gene, group) in group_alns(gene_alns, |a| a.q.as_str()) {
        let mut best = &group[0];
        for a in &group[1..] {
            if a.mlen > best.mlen {
                best = a;
            }
        }
        if best.q_len as f64 / best.blen as f64 * 100.0 < params.min_cov {
            continue;
        }
        let locus = gene.split('_').next().unwrap_or(&gene);
        let Some(i) = db.loci.get_index_of(locus) else {
            warn!("Gene {gene} does not belong to any database locus, skipping");
            continue;
        };
        let value = match params.score_metric {
            ScoreMetric::AlignmentScore => best.tag_i64("AS").map_or_else(
                |_| {
                    warn!("Alignment for {gene} has no AS tag, falling back to matching bases");
                    best.mlen as f64
                },
                |v| v as f64,
            ),
            ScoreMetric::MatchingBases => best.mlen as f64,
            ScoreMetric::AlignedBases => best.blen as f64,
            ScoreMetric::QueryLength => best.q_len as f64,
        };
        scores[i] += value / best.blen as f64;
        found[i] += 1.0;
        blen_totals[i] += best.blen as f64;
        qlen_totals[i] += best.q_len as f64;
        kept.extend(group);
    }

    if kept.is_empty() {
        return None;
    }

    let mut weighted = match params.weight_metric {
        WeightMetric::None => scores,
        WeightMetric::GenesFound => scores * found,
        WeightMetric::GenesExpected => scores / &expected,
        WeightMetric::PropFound => scores * (found / &expected),
        WeightMetric::AlignedBases => scores / blen_totals,
        WeightMetric::QueryLength => scores / qlen_totals,
    };
    // loci with no counted genes can divide 0 by 0 under the ratio weights
    weighted.mapv_inplace(|x| if x.is_finite() { x } else { 0.0 });

    let zscores = zscores(&weighted);
    let mut best_idx = 0;
    for (i, score) in weighted.iter().enumerate() {
        if *score > weighted[best_idx] {
            best_idx = i;
        }
    }

    Some(BestMatch { locus_index: best_idx, zscore: zscores[best_idx], alignments: kept })
}

/// Z-scores of a score vector, all zero when the standard deviation is zero.
fn zscores(scores: &Array1<f64>) -> Array1<f64> {
    let mean = scores.mean().unwrap_or(0.0);
    let std = (scores.mapv(|x| (x - mean).powi(2)).sum() / scores.len() as f64).sqrt();
    if std == 0.0 {
        Array1::zeros(scores.len())
    } else {
        scores.mapv(|x| (x - mean) / std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    const DB_JSON: &str = r#"{
        "gene_threshold": 90.0,
        "loci": [
            {"name": "K1", "seq": "ACGTACGTACGT", "genes": [
                {"name": "K1_1", "strand": "+", "seq": "ACGTAC"},
                {"name": "K1_2", "strand": "+", "seq": "GTACGT"}
            ]},
            {"name": "K2", "seq": "TTTTACGTACGT", "genes": [
                {"name": "K2_1", "strand": "+", "seq": "TTTTAC"},
                {"name": "K2_2", "strand": "+", "seq": "GTACGT"}
            ]}
        ]
    }"#;

    fn db() -> Database {
        Database::from_reader(DB_JSON.as_bytes()).unwrap()
    }

    fn paf(q: &str, q_len: usize, blen: usize, mlen: usize) -> Alignment {
        Alignment::from_paf_line(&format!(
            "{q}\t{q_len}\t0\t{q_len}\t+\tctg\t10000\t100\t{}\t{mlen}\t{blen}\t60",
            100 + blen
        ))
        .unwrap()
    }

    #[test]
    fn best_match_is_deterministic() {
        let alns = vec![
            paf("K1_1", 6, 6, 6),
            paf("K1_2", 6, 6, 6),
            paf("K2_1", 6, 6, 3),
        ];
        let best = score_loci(alns.clone(), &db(), &ScoringParams::default()).unwrap();
        assert_eq!(0, best.locus_index);
        let again = score_loci(alns, &db(), &ScoringParams::default()).unwrap();
        assert_eq!(best.locus_index, again.locus_index);
    }

    #[test]
    fn score_ties_break_by_database_order() {
        // same score contribution for both loci
        let alns = vec![paf("K1_1", 6, 6, 6), paf("K2_1", 6, 6, 6)];
        let best = score_loci(alns, &db(), &ScoringParams::default()).unwrap();
        assert_eq!(0, best.locus_index);
    }

    #[test]
    fn zscore_is_zero_without_score_spread() {
        let alns = vec![paf("K1_1", 6, 6, 6), paf("K2_1", 6, 6, 6)];
        let best = score_loci(alns, &db(), &ScoringParams::default()).unwrap();
        assert_eq!(0.0, best.zscore);
    }

    #[test]
    fn coverage_gate_uses_query_length_over_aligned_bases() {
        // gappy alignment: blen far above q_len fails the gate
        let alns = vec![paf("K1_1", 100, 250, 90)];
        assert!(score_loci(alns, &db(), &ScoringParams::default()).is_none());
        // short alignment of a long query passes it
        let alns = vec![paf("K1_1", 100, 50, 45)];
        assert!(score_loci(alns, &db(), &ScoringParams::default()).is_some());
    }

    #[test]
    fn kept_alignments_cover_losing_loci_too() {
        let alns = vec![
            paf("K1_1", 6, 6, 6),
            paf("K1_1", 6, 6, 4),
            paf("K2_1", 6, 6, 5),
        ];
        let best = score_loci(alns, &db(), &ScoringParams::default()).unwrap();
        assert_eq!(0, best.locus_index);
        assert_eq!(3, best.alignments.len());
    }
}
