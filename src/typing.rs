//! # Typing results
//!
//! Structs storing the outcome of typing one assembly: the reconstructed
//! locus pieces, the per-gene evidence, and the derived summary verdict.
//! A [`TypingResult`] owns its gene results in an arena (`genes`); the five
//! category lists, the piece membership lists, and the left/right neighbour
//! links are all indices into that arena, so the doubly-linked neighbour
//! chain needs no reference cycles and can be rebuilt from serialized keys.
//!
//! Results round-trip through a one-object-per-line JSON form in which all
//! numbers are strings (kept for compatibility with result files written by
//! earlier releases); the derived summary fields are restored verbatim on
//! rehydration, never recomputed.
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    alignment::Strand,
    assembly::Assembly,
    database::{Database, Gene, Locus},
    translate::{percent_identity, translate},
};

/// Protein coverage below which a non-partial gene hit is called truncated.
const TRUNCATION_COVERAGE: f64 = 95.0;
/// Minimum protein coverage for a below-threshold expected gene to raise the
/// `*` problem flag.
const BELOW_THRESHOLD_MIN_COVERAGE: f64 = 90.0;

/// Category of a gene hit relative to the best-match locus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneType {
    /// Gene of the best-match locus
    Expected,
    /// Gene of some other database locus
    Unexpected,
    /// Gene listed only in phenotype annotations
    Extra,
}

impl GeneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneType::Expected => "expected_genes",
            GeneType::Unexpected => "unexpected_genes",
            GeneType::Extra => "extra_genes",
        }
    }
}

impl FromStr for GeneType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<GeneType> {
        match s {
            "expected_genes" => Ok(GeneType::Expected),
            "unexpected_genes" => Ok(GeneType::Unexpected),
            "extra_genes" => Ok(GeneType::Extra),
            other => bail!("Unknown gene type '{other}'"),
        }
    }
}

/// State of a single gene hit as reported in phenotypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenePhenotype {
    Present,
    Truncated,
}

impl fmt::Display for GenePhenotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenePhenotype::Present => write!(f, "present"),
            GenePhenotype::Truncated => write!(f, "truncated"),
        }
    }
}

impl FromStr for GenePhenotype {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<GenePhenotype> {
        match s {
            "present" => Ok(GenePhenotype::Present),
            "truncated" => Ok(GenePhenotype::Truncated),
            other => bail!("Unknown gene phenotype '{other}'"),
        }
    }
}

/// Typeability verdict for a typing result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Typeable,
    Untypeable,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Typeable => write!(f, "Typeable"),
            Confidence::Untypeable => write!(f, "Untypeable"),
        }
    }
}

impl FromStr for Confidence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Confidence> {
        match s {
            "Typeable" => Ok(Confidence::Typeable),
            "Untypeable" => Ok(Confidence::Untypeable),
            other => bail!("Unknown confidence '{other}'"),
        }
    }
}

/// One contiguous stretch of assembly sequence attributed to the
/// reconstructed locus. The start/end expand as gene results are attached;
/// the strand is the consensus of the expected-gene members and is resolved
/// during finalisation.
#[derive(Debug)]
pub struct LocusPiece {
    /// Contig the piece lies on
    pub id: String,
    pub start: usize,
    pub end: usize,
    pub strand: Strand,
    pub sequence: String,
    /// Arena indices of member gene results, by category
    pub expected_genes: Vec<usize>,
    pub unexpected_genes: Vec<usize>,
    pub extra_genes: Vec<usize>,
}

impl LocusPiece {
    pub fn new(id: &str, start: usize, end: usize) -> LocusPiece {
        LocusPiece {
            id: id.to_string(),
            start,
            end,
            strand: Strand::Unknown,
            sequence: String::new(),
            expected_genes: Vec::new(),
            unexpected_genes: Vec::new(),
            extra_genes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Stable identifier used as the serialized reference key.
    pub fn key(&self) -> String {
        format!("{}:{}-{}{}", self.id, self.start, self.end, self.strand)
    }

    fn add_gene_result(&mut self, idx: usize, gene_result: &GeneResult) {
        self.start = self.start.min(gene_result.start);
        self.end = self.end.max(gene_result.end);
        match gene_result.gene_type {
            GeneType::Expected => self.expected_genes.push(idx),
            GeneType::Unexpected => self.unexpected_genes.push(idx),
            GeneType::Extra => self.extra_genes.push(idx),
        }
    }
}

/// Evidence for a single gene in a typing result.
#[derive(Debug)]
pub struct GeneResult {
    /// Contig the hit lies on
    pub id: String,
    /// Name of the reference gene
    pub gene_name: String,
    /// Intra-locus order index of the reference gene
    pub gene_index: usize,
    pub start: usize,
    pub end: usize,
    pub strand: Strand,
    /// Index of the enclosing piece; `None` means outside the locus
    pub piece: Option<usize>,
    /// Arena indices of the neighbouring gene results
    pub neighbour_left: Option<usize>,
    pub neighbour_right: Option<usize>,
    pub dna_seq: String,
    pub protein_seq: String,
    /// The alignment abuts a contig edge, the full gene would not fit
    pub partial: bool,
    pub below_threshold: bool,
    pub phenotype: GenePhenotype,
    pub gene_type: GeneType,
    /// Protein-level percent identity against the reference gene
    pub percent_identity: f64,
    /// Protein length as a percentage of the reference protein length
    pub percent_coverage: f64,
}

impl GeneResult {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Stable identifier used as the serialized reference key.
    pub fn key(&self) -> String {
        format!("{} {}:{}-{}{}", self.gene_name, self.id, self.start, self.end, self.strand)
    }

    /// Summary cell for table output:
    /// `name,identity%,coverage%[,partial][,truncated][,below_id_threshold]`.
    pub fn details(&self) -> String {
        let mut s = format!(
            "{},{:.2}%,{:.2}%",
            self.gene_name, self.percent_identity, self.percent_coverage
        );
        if self.partial {
            s.push_str(",partial");
        }
        if self.phenotype == GenePhenotype::Truncated {
            s.push_str(",truncated");
        }
        if self.below_threshold {
            s.push_str(",below_id_threshold");
        }
        s
    }

    /// Translate the extracted DNA and align the protein to the reference.
    ///
    /// Frames 0, 1, 2 are tried in order and the first frame yielding a
    /// non-empty protein wins; the hit start shifts by the accepted frame.
    /// When no frame translates, the identity and coverage stay at zero and
    /// the hit is retained. A non-partial hit covering less than 95% of the
    /// reference protein is called truncated, except for unexpected genes
    /// outside the locus.
    pub fn compare_translation(&mut self, gene: &Gene) {
        if self.dna_seq.is_empty() {
            warn!("No DNA sequence for {}", self.key());
            return;
        }
        let dna = self.dna_seq.as_bytes();
        let mut protein = Vec::new();
        for frame in 0..3usize {
            protein = dna.get(frame..).map(translate).unwrap_or_default();
            if !protein.is_empty() {
                self.start += frame;
                break;
            }
        }
        if protein.is_empty() {
            warn!("No protein sequence for {}", self.key());
            return;
        }
        let reference = gene.protein();
        if !reference.is_empty() {
            self.percent_identity = percent_identity(&protein, reference);
            self.percent_coverage = protein.len() as f64 / reference.len() as f64 * 100.0;
            if !self.partial
                && self.percent_coverage < TRUNCATION_COVERAGE
                && !(self.gene_type == GeneType::Unexpected && self.piece.is_none())
            {
                self.phenotype = GenePhenotype::Truncated;
            }
        }
        self.protein_seq = String::from_utf8_lossy(&protein).into_owned();
    }
}

/// The results of typing one sample against a locus database.
#[derive(Debug)]
pub struct TypingResult {
    pub sample_name: String,
    /// Name of the best-match locus
    pub best_match: String,
    /// Z-score of the best-match locus over all weighted locus scores
    pub zscore: f64,
    /// Reconstructed locus pieces. During the pipeline this holds every
    /// candidate piece; finalisation drops pieces without expected genes and
    /// sorts the rest into locus order.
    pub pieces: Vec<LocusPiece>,
    /// Arena of gene results, in acceptance order
    pub genes: Vec<GeneResult>,
    pub expected_genes_inside_locus: Vec<usize>,
    pub expected_genes_outside_locus: Vec<usize>,
    pub unexpected_genes_inside_locus: Vec<usize>,
    pub unexpected_genes_outside_locus: Vec<usize>,
    /// Extra genes have no inside/outside split
    pub extra_genes: Vec<usize>,
    /// Best-match genes with no accepted hit, in locus order
    pub missing_genes: Vec<String>,
    // Summary fields, computed once by `finalize` and restored verbatim on
    // rehydration.
    pub percent_identity: f64,
    pub percent_coverage: f64,
    pub phenotype: String,
    pub problems: String,
    pub confidence: Confidence,
}

impl fmt::Display for TypingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sample_name, self.best_match)
    }
}

impl TypingResult {
    pub fn new(sample_name: &str, best_match: &str, zscore: f64) -> TypingResult {
        TypingResult {
            sample_name: sample_name.to_string(),
            best_match: best_match.to_string(),
            zscore,
            pieces: Vec::new(),
            genes: Vec::new(),
            expected_genes_inside_locus: Vec::new(),
            expected_genes_outside_locus: Vec::new(),
            unexpected_genes_inside_locus: Vec::new(),
            unexpected_genes_outside_locus: Vec::new(),
            extra_genes: Vec::new(),
            missing_genes: Vec::new(),
            percent_identity: 0.0,
            percent_coverage: 0.0,
            phenotype: String::new(),
            problems: String::new(),
            confidence: Confidence::Untypeable,
        }
    }

    /// Total length of the reconstructed locus.
    pub fn len(&self) -> usize {
        self.pieces.iter().map(LocusPiece::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Arena indices of all gene results in reporting order: expected inside,
    /// unexpected inside, expected outside, unexpected outside, extra.
    pub fn gene_result_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.expected_genes_inside_locus
            .iter()
            .chain(&self.unexpected_genes_inside_locus)
            .chain(&self.expected_genes_outside_locus)
            .chain(&self.unexpected_genes_outside_locus)
            .chain(&self.extra_genes)
            .copied()
    }

    /// Move a gene result into the arena, linking it to its left neighbour
    /// and filing it into its piece and category list. Returns the arena
    /// index.
    pub fn add_gene_result(&mut self, gene_result: GeneResult) -> usize {
        let idx = self.genes.len();
        if let Some(left) = gene_result.neighbour_left {
            self.genes[left].neighbour_right = Some(idx);
        }
        self.genes.push(gene_result);
        self.attach(idx);
        idx
    }

    /// File an arena entry into its piece and category list.
    fn attach(&mut self, idx: usize) {
        let (piece, gene_type) = (self.genes[idx].piece, self.genes[idx].gene_type);
        match (piece, gene_type) {
            (Some(piece), _) => {
                self.pieces[piece].add_gene_result(idx, &self.genes[idx]);
                match gene_type {
                    GeneType::Expected => self.expected_genes_inside_locus.push(idx),
                    GeneType::Unexpected => self.unexpected_genes_inside_locus.push(idx),
                    GeneType::Extra => self.extra_genes.push(idx),
                }
            }
            (None, GeneType::Expected) => self.expected_genes_outside_locus.push(idx),
            (None, GeneType::Unexpected) => self.unexpected_genes_outside_locus.push(idx),
            (None, GeneType::Extra) => self.extra_genes.push(idx),
        }
    }

    /// Finalise the result: resolve piece strands and sequences, drop pieces
    /// without expected genes, order pieces and gene lists by the reference
    /// locus gene order, fill in missing genes, and compute the summary
    /// fields.
    pub fn finalize(
        &mut self,
        assembly: &Assembly,
        db: &Database,
        allow_below_threshold: bool,
        max_other_genes: usize,
        percent_expected_genes: f64,
    ) -> Result<()> {
        let locus = db
            .loci
            .get(&self.best_match)
            .with_context(|| format!("Best match {} not found in database", self.best_match))?;

        // Resolve strand and sequence for pieces holding expected genes and
        // drop the rest. Gene results attached to a dropped piece stay in
        // their inside-locus list but lose the piece reference.
        let candidates = std::mem::take(&mut self.pieces);
        let n_candidates = candidates.len();
        let mut kept: Vec<(usize, LocusPiece)> = Vec::new();
        for (old_idx, mut piece) in candidates.into_iter().enumerate() {
            if piece.expected_genes.is_empty() {
                continue;
            }
            let same_strand = piece
                .expected_genes
                .iter()
                .filter(|&&g| {
                    db.gene(&self.genes[g].gene_name)
                        .is_some_and(|gene| gene.strand == self.genes[g].strand)
                })
                .count();
            piece.strand = if 2 * same_strand > piece.expected_genes.len() {
                Strand::Forward
            } else {
                Strand::Reverse
            };
            let seq = assembly.seq(&piece.id, piece.start, piece.end, piece.strand)?;
            piece.sequence = String::from_utf8_lossy(&seq).into_owned();
            kept.push((old_idx, piece));
        }
        // Order pieces by the lowest locus gene index they contain.
        kept.sort_by_key(|(_, piece)| {
            piece.expected_genes.iter().map(|&g| self.genes[g].gene_index).min()
        });
        let mut remap = vec![None; n_candidates];
        let mut pieces = Vec::with_capacity(kept.len());
        for (new_idx, (old_idx, piece)) in kept.into_iter().enumerate() {
            remap[old_idx] = Some(new_idx);
            pieces.push(piece);
        }
        self.pieces = pieces;
        for gene_result in &mut self.genes {
            gene_result.piece = gene_result.piece.and_then(|old| remap[old]);
        }

        // Order the four in/out lists by locus gene order.
        let genes = &self.genes;
        for list in [
            &mut self.expected_genes_inside_locus,
            &mut self.expected_genes_outside_locus,
            &mut self.unexpected_genes_inside_locus,
            &mut self.unexpected_genes_outside_locus,
        ] {
            list.sort_by_key(|&i| genes[i].gene_index);
        }

        let found: HashSet<&str> = self
            .expected_genes_inside_locus
            .iter()
            .chain(&self.expected_genes_outside_locus)
            .map(|&i| self.genes[i].gene_name.as_str())
            .collect();
        let mut missing: Vec<&Gene> = locus
            .genes
            .values()
            .filter(|gene| !found.contains(gene.name.as_str()))
            .collect();
        missing.sort_by_key(|gene| gene.index);
        self.missing_genes = missing.into_iter().map(|gene| gene.name.clone()).collect();

        self.percent_identity = self.mean_expected_identity();
        self.percent_coverage = self.expected_gene_coverage(locus);
        self.phenotype = self.resolve_phenotype(locus);
        self.problems = self.collect_problems();
        self.confidence = self.resolve_confidence(
            locus,
            allow_below_threshold,
            max_other_genes,
            percent_expected_genes,
        );
        Ok(())
    }

    /// Mean protein identity of the expected in-locus genes, 0 when none.
    fn mean_expected_identity(&self) -> f64 {
        let hits = &self.expected_genes_inside_locus;
        if hits.is_empty() {
            return 0.0;
        }
        hits.iter().map(|&i| self.genes[i].percent_identity).sum::<f64>() / hits.len() as f64
    }

    /// Summed expected in-locus hit lengths over the summed reference gene
    /// lengths. Expanded hits can push this above 100%.
    fn expected_gene_coverage(&self, locus: &Locus) -> f64 {
        if self.expected_genes_inside_locus.is_empty() {
            return 0.0;
        }
        let hit_total: usize =
            self.expected_genes_inside_locus.iter().map(|&i| self.genes[i].len()).sum();
        let gene_total: usize = locus.genes.values().map(Gene::len).sum();
        hit_total as f64 / gene_total as f64 * 100.0
    }

    /// First phenotype catalogue entry whose gene set is fully present among
    /// the expected and extra gene hits; the catalogue is sorted largest set
    /// first so entries with extra genes win over their subsets. Falls back
    /// to the locus type label.
    fn resolve_phenotype(&self, locus: &Locus) -> String {
        let states: HashSet<(String, String)> = self
            .gene_result_order()
            .filter(|&i| {
                matches!(self.genes[i].gene_type, GeneType::Expected | GeneType::Extra)
            })
            .map(|i| (self.genes[i].gene_name.clone(), self.genes[i].phenotype.to_string()))
            .collect();
        locus
            .phenotypes
            .iter()
            .find(|p| {
                p.genes.iter().filter(|(gene, state)| {
                    states.contains(&(gene.clone(), state.clone()))
                }).count() == p.genes.len()
            })
            .map(|p| p.label.clone())
            .unwrap_or_else(|| locus.type_label.clone())
    }

    fn collect_problems(&self) -> String {
        let mut problems = String::new();
        if self.pieces.len() != 1 {
            problems.push_str(&format!("?{}", self.pieces.len()));
        }
        if !self.missing_genes.is_empty() {
            problems.push('-');
        }
        if !self.unexpected_genes_inside_locus.is_empty() {
            problems.push('+');
        }
        if self.expected_genes_inside_locus.iter().any(|&i| {
            self.genes[i].percent_coverage >= BELOW_THRESHOLD_MIN_COVERAGE
                && self.genes[i].below_threshold
        }) {
            problems.push('*');
        }
        if self
            .gene_result_order()
            .any(|i| self.genes[i].phenotype == GenePhenotype::Truncated)
        {
            problems.push('!');
        }
        problems
    }

    fn resolve_confidence(
        &self,
        locus: &Locus,
        allow_below_threshold: bool,
        max_other_genes: usize,
        percent_expected_genes: f64,
    ) -> Confidence {
        let p = self.expected_genes_inside_locus.len() as f64 / locus.genes.len() as f64 * 100.0;
        let other_genes = self
            .unexpected_genes_inside_locus
            .iter()
            .filter(|&&i| self.genes[i].phenotype != GenePhenotype::Truncated)
            .count();
        if !allow_below_threshold && self.problems.contains('*') {
            Confidence::Untypeable
        } else if self.pieces.len() == 1 && self.missing_genes.is_empty() && other_genes == 0 {
            Confidence::Typeable
        } else if other_genes <= max_other_genes && p >= percent_expected_genes {
            Confidence::Typeable
        } else {
            Confidence::Untypeable
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Serialize to the one-object-per-line JSON form.
    pub fn to_json(&self) -> Result<String> {
        let piece_key = |piece: Option<usize>| {
            piece.map(|p| self.pieces[p].key()).unwrap_or_default()
        };
        let neighbour_key = |neighbour: Option<usize>| {
            neighbour.map(|n| self.genes[n].key()).unwrap_or_default()
        };
        let gene_json = |&i: &usize| {
            let g = &self.genes[i];
            JsonGeneResult {
                id: g.id.clone(),
                start: g.start.to_string(),
                end: g.end.to_string(),
                strand: g.strand.to_string(),
                dna_seq: g.dna_seq.clone(),
                protein_seq: g.protein_seq.clone(),
                partial: python_bool(g.partial),
                below_threshold: python_bool(g.below_threshold),
                phenotype: g.phenotype.to_string(),
                gene_type: g.gene_type.as_str().to_string(),
                percent_identity: g.percent_identity.to_string(),
                percent_coverage: g.percent_coverage.to_string(),
                gene: g.gene_name.clone(),
                piece: piece_key(g.piece),
                neighbour_left: neighbour_key(g.neighbour_left),
                neighbour_right: neighbour_key(g.neighbour_right),
            }
        };
        let json = JsonTypingResult {
            sample_name: self.sample_name.clone(),
            best_match: self.best_match.clone(),
            confidence: self.confidence.to_string(),
            phenotype: self.phenotype.clone(),
            problems: self.problems.clone(),
            percent_identity: self.percent_identity.to_string(),
            percent_coverage: self.percent_coverage.to_string(),
            missing_genes: self.missing_genes.clone(),
            pieces: self
                .pieces
                .iter()
                .map(|p| JsonPiece {
                    id: p.id.clone(),
                    start: p.start.to_string(),
                    end: p.end.to_string(),
                    strand: p.strand.to_string(),
                    sequence: p.sequence.clone(),
                })
                .collect(),
            expected_genes_inside_locus: self.expected_genes_inside_locus.iter().map(gene_json).collect(),
            expected_genes_outside_locus: self.expected_genes_outside_locus.iter().map(gene_json).collect(),
            unexpected_genes_inside_locus: self.unexpected_genes_inside_locus.iter().map(gene_json).collect(),
            unexpected_genes_outside_locus: self.unexpected_genes_outside_locus.iter().map(gene_json).collect(),
            extra_genes: self.extra_genes.iter().map(gene_json).collect(),
        };
        serde_json::to_string(&json).context("Could not serialize typing result")
    }

    /// Rehydrate a result from its serialized JSON line. Gene references are
    /// resolved through the database; piece and neighbour keys that no
    /// longer resolve become `None`. The summary fields are restored
    /// verbatim.
    pub fn from_json(line: &str, db: &Database) -> Result<TypingResult> {
        let raw: JsonTypingResult =
            serde_json::from_str(line).context("Could not parse result JSON line")?;
        if !db.loci.contains_key(&raw.best_match) {
            bail!("Best match {} not found in database", raw.best_match);
        }
        let mut result = TypingResult::new(&raw.sample_name, &raw.best_match, 0.0);
        result.percent_identity = parse_float(&raw.percent_identity, "percent_identity")?;
        result.percent_coverage = parse_float(&raw.percent_coverage, "percent_coverage")?;
        result.phenotype = raw.phenotype;
        result.problems = raw.problems;
        result.confidence = raw.confidence.parse()?;
        result.missing_genes = raw.missing_genes;

        for piece in &raw.pieces {
            let mut p = LocusPiece::new(
                &piece.id,
                parse_int(&piece.start, "piece start")?,
                parse_int(&piece.end, "piece end")?,
            );
            p.strand = Strand::from_symbol(&piece.strand);
            p.sequence = piece.sequence.clone();
            result.pieces.push(p);
        }
        let piece_index: std::collections::HashMap<String, usize> =
            result.pieces.iter().enumerate().map(|(i, p)| (p.key(), i)).collect();

        // Build the arena in the reporting order used by the writer so that
        // re-serialization preserves list order.
        let mut neighbour_keys: Vec<(String, String)> = Vec::new();
        let mut gene_index: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for raw_gene in raw
            .expected_genes_inside_locus
            .iter()
            .chain(&raw.unexpected_genes_inside_locus)
            .chain(&raw.expected_genes_outside_locus)
            .chain(&raw.unexpected_genes_outside_locus)
            .chain(&raw.extra_genes)
        {
            let gene = db
                .gene(&raw_gene.gene)
                .or_else(|| db.extra_gene(&raw_gene.gene))
                .ok_or_else(|| anyhow!("Gene {} not found in database", raw_gene.gene))?;
            let gene_result = GeneResult {
                id: raw_gene.id.clone(),
                gene_name: gene.name.clone(),
                gene_index: gene.index,
                start: parse_int(&raw_gene.start, "gene start")?,
                end: parse_int(&raw_gene.end, "gene end")?,
                strand: Strand::from_symbol(&raw_gene.strand),
                piece: piece_index.get(&raw_gene.piece).copied(),
                neighbour_left: None,
                neighbour_right: None,
                dna_seq: raw_gene.dna_seq.clone(),
                protein_seq: raw_gene.protein_seq.clone(),
                partial: raw_gene.partial == "True",
                below_threshold: raw_gene.below_threshold == "True",
                phenotype: raw_gene.phenotype.parse()?,
                gene_type: raw_gene.gene_type.parse()?,
                percent_identity: parse_float(&raw_gene.percent_identity, "percent_identity")?,
                percent_coverage: parse_float(&raw_gene.percent_coverage, "percent_coverage")?,
            };
            gene_index.insert(gene_result.key(), result.genes.len());
            neighbour_keys.push((raw_gene.neighbour_left.clone(), raw_gene.neighbour_right.clone()));
            result.genes.push(gene_result);
        }
        for (idx, (left, right)) in neighbour_keys.into_iter().enumerate() {
            result.genes[idx].neighbour_left = gene_index.get(&left).copied();
            result.genes[idx].neighbour_right = gene_index.get(&right).copied();
        }
        for idx in 0..result.genes.len() {
            result.attach(idx);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Table and FASTA output
    // ------------------------------------------------------------------

    pub fn tsv_headers() -> [&'static str; 19] {
        [
            "Assembly",
            "Best match locus",
            "Best match type",
            "Confidence",
            "Problems",
            "Identity",
            "Coverage",
            "Length discrepancy",
            "Expected genes in locus",
            "Expected genes in locus, details",
            "Missing expected genes",
            "Other genes in locus",
            "Other genes in locus, details",
            "Expected genes outside locus",
            "Expected genes outside locus, details",
            "Other genes outside locus",
            "Other genes outside locus, details",
            "Truncated genes, details",
            "Extra genes",
        ]
    }

    /// One row of tab-separated output, in header order.
    pub fn tsv_row(&self, db: &Database) -> Result<Vec<String>> {
        let locus = db
            .loci
            .get(&self.best_match)
            .with_context(|| format!("Best match {} not found in database", self.best_match))?;
        let expected_total = locus.genes.len();
        let details = |list: &[usize]| {
            list.iter().map(|&i| self.genes[i].details()).join(";")
        };
        let distinct_found: HashSet<&str> = self
            .expected_genes_inside_locus
            .iter()
            .filter_map(|&i| db.gene(&self.genes[i].gene_name).map(|g| g.gene_name.as_str()))
            .collect();
        let ratio = |n: usize| {
            format!("{n} / {expected_total} ({:.2}%)", n as f64 / expected_total as f64 * 100.0)
        };
        Ok(vec![
            self.sample_name.clone(),
            self.best_match.clone(),
            self.phenotype.clone(),
            self.confidence.to_string(),
            self.problems.clone(),
            format!("{:.2}%", self.percent_identity),
            format!("{:.2}%", self.percent_coverage),
            if self.pieces.len() == 1 {
                format!("{} bp", self.len() as i64 - locus.len() as i64)
            } else {
                "n/a".to_string()
            },
            ratio(distinct_found.len()),
            details(&self.expected_genes_inside_locus),
            self.missing_genes.join(";"),
            self.unexpected_genes_inside_locus.len().to_string(),
            details(&self.unexpected_genes_inside_locus),
            ratio(self.expected_genes_outside_locus.len()),
            details(&self.expected_genes_outside_locus),
            self.unexpected_genes_outside_locus.len().to_string(),
            details(&self.unexpected_genes_outside_locus),
            self.gene_result_order()
                .filter(|&i| self.genes[i].phenotype == GenePhenotype::Truncated)
                .map(|i| self.genes[i].details())
                .join(";"),
            details(&self.extra_genes),
        ])
    }

    /// Nucleotide sequence of the reconstructed locus, one record per piece.
    pub fn locus_fasta(&self) -> String {
        self.pieces
            .iter()
            .map(|p| format!(">{}|{}\n{}\n", self.sample_name, p.key(), p.sequence))
            .collect()
    }

    /// Nucleotide sequences of all gene hits.
    pub fn gene_fasta(&self) -> String {
        let mut fasta = String::new();
        for i in self.gene_result_order() {
            let g = &self.genes[i];
            if g.dna_seq.is_empty() {
                warn!("No DNA sequence for {}", g.key());
                continue;
            }
            fasta.push_str(&format!(
                ">{} {}|{}:{}-{}{}\n{}\n",
                g.gene_name, self.sample_name, g.id, g.start, g.end, g.strand, g.dna_seq
            ));
        }
        fasta
    }

    /// Protein sequences of all gene hits.
    pub fn protein_fasta(&self) -> String {
        let mut fasta = String::new();
        for i in self.gene_result_order() {
            let g = &self.genes[i];
            if g.protein_seq.is_empty() {
                warn!("No protein sequence for {}", g.key());
                continue;
            }
            fasta.push_str(&format!(
                ">{} {}|{}:{}-{}{}\n{}\n",
                g.gene_name, self.sample_name, g.id, g.start, g.end, g.strand, g.protein_seq
            ));
        }
        fasta
    }
}

fn python_bool(b: bool) -> String {
    if b { "True".to_string() } else { "False".to_string() }
}

fn parse_int(s: &str, what: &str) -> Result<usize> {
    s.parse().with_context(|| format!("Invalid {what} '{s}' in result JSON"))
}

fn parse_float(s: &str, what: &str) -> Result<f64> {
    s.parse().with_context(|| format!("Invalid {what} '{s}' in result JSON"))
}

#[derive(Serialize, Deserialize)]
struct JsonTypingResult {
    sample_name: String,
    best_match: String,
    confidence: String,
    phenotype: String,
    problems: String,
    percent_identity: String,
    percent_coverage: String,
    missing_genes: Vec<String>,
    pieces: Vec<JsonPiece>,
    expected_genes_inside_locus: Vec<JsonGeneResult>,
    expected_genes_outside_locus: Vec<JsonGeneResult>,
    unexpected_genes_inside_locus: Vec<JsonGeneResult>,
    unexpected_genes_outside_locus: Vec<JsonGeneResult>,
    extra_genes: Vec<JsonGeneResult>,
}

#[derive(Serialize, Deserialize)]
struct JsonPiece {
    id: String,
    start: String,
    end: String,
    strand: String,
    sequence: String,
}

#[derive(Serialize, Deserialize)]
struct JsonGeneResult {
    id: String,
    start: String,
    end: String,
    strand: String,
    dna_seq: String,
    protein_seq: String,
    partial: String,
    below_threshold: String,
    phenotype: String,
    gene_type: String,
    percent_identity: String,
    percent_coverage: String,
    gene: String,
    piece: String,
    neighbour_left: String,
    neighbour_right: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    const DB_JSON: &str = r#"{
        "gene_threshold": 90.0,
        "loci": [
            {
                "name": "K1",
                "type_label": "K1",
                "seq": "ATGGCTGCTTAAATGAAAGCTTAAATGCCAGATTAA",
                "genes": [
                    {"name": "K1_1", "strand": "+", "seq": "ATGGCTGCTTAA"},
                    {"name": "K1_2", "strand": "+", "seq": "ATGAAAGCTTAA"},
                    {"name": "K1_3", "strand": "-", "seq": "ATGCCAGATTAA"}
                ],
                "phenotypes": [
                    {"genes": [["K1_1", "present"], ["Extra_1", "present"]], "label": "K1-extra"},
                    {"genes": [["K1_1", "present"]], "label": "K1-plain"}
                ]
            },
            {
                "name": "K2",
                "type_label": "K2",
                "seq": "ATGTTTGGGTAA",
                "genes": [{"name": "K2_1", "strand": "+", "seq": "ATGTTTGGGTAA"}]
            }
        ],
        "extra_loci": [
            {
                "name": "Extra",
                "seq": "ATGCCCGGGTAA",
                "genes": [{"name": "Extra_1", "strand": "+", "seq": "ATGCCCGGGTAA"}]
            }
        ]
    }"#;

    fn db() -> Database {
        Database::from_reader(DB_JSON.as_bytes()).unwrap()
    }

    fn gene_result(
        gene: &str,
        index: usize,
        start: usize,
        end: usize,
        piece: Option<usize>,
        gene_type: GeneType,
    ) -> GeneResult {
        GeneResult {
            id: "ctg1".to_string(),
            gene_name: gene.to_string(),
            gene_index: index,
            start,
            end,
            strand: Strand::Forward,
            piece,
            neighbour_left: None,
            neighbour_right: None,
            dna_seq: "ATG".to_string(),
            protein_seq: "M".to_string(),
            partial: false,
            below_threshold: false,
            phenotype: GenePhenotype::Present,
            gene_type,
            percent_identity: 100.0,
            percent_coverage: 100.0,
        }
    }

    #[test]
    fn add_gene_result_links_neighbours_and_expands_piece() {
        let mut result = TypingResult::new("sample", "K1", 0.0);
        result.pieces.push(LocusPiece::new("ctg1", 100, 150));
        let first = result.add_gene_result(gene_result("K1_1", 1, 90, 120, Some(0), GeneType::Expected));
        let mut second = gene_result("K1_2", 2, 120, 170, Some(0), GeneType::Expected);
        second.neighbour_left = Some(first);
        let second = result.add_gene_result(second);

        assert_eq!(Some(second), result.genes[first].neighbour_right);
        assert_eq!(Some(first), result.genes[second].neighbour_left);
        assert_eq!((90, 170), (result.pieces[0].start, result.pieces[0].end));
        assert_eq!(vec![first, second], result.pieces[0].expected_genes);
        assert_eq!(vec![first, second], result.expected_genes_inside_locus);
    }

    #[test]
    fn attach_splits_inside_and_outside() {
        let mut result = TypingResult::new("sample", "K1", 0.0);
        result.pieces.push(LocusPiece::new("ctg1", 0, 1000));
        result.add_gene_result(gene_result("K1_1", 1, 10, 20, Some(0), GeneType::Expected));
        result.add_gene_result(gene_result("K1_2", 2, 30, 40, None, GeneType::Expected));
        result.add_gene_result(gene_result("K2_1", 1, 50, 60, Some(0), GeneType::Unexpected));
        result.add_gene_result(gene_result("K2_1", 1, 70, 80, None, GeneType::Unexpected));
        result.add_gene_result(gene_result("Extra_1", 1, 90, 95, None, GeneType::Extra));

        assert_eq!(1, result.expected_genes_inside_locus.len());
        assert_eq!(1, result.expected_genes_outside_locus.len());
        assert_eq!(1, result.unexpected_genes_inside_locus.len());
        assert_eq!(1, result.unexpected_genes_outside_locus.len());
        assert_eq!(1, result.extra_genes.len());
    }

    #[test]
    fn problems_are_ordered_flags() {
        let mut result = TypingResult::new("sample", "K1", 0.0);
        // two pieces, a missing gene, an unexpected gene, and a truncation
        result.pieces.push(LocusPiece::new("ctg1", 0, 100));
        result.pieces.push(LocusPiece::new("ctg2", 0, 100));
        result.missing_genes.push("K1_3".to_string());
        result.add_gene_result(gene_result("K1_1", 1, 0, 50, Some(0), GeneType::Expected));
        result.add_gene_result(gene_result("K2_1", 1, 60, 90, Some(0), GeneType::Unexpected));
        let mut truncated = gene_result("K1_2", 2, 0, 50, Some(1), GeneType::Expected);
        truncated.phenotype = GenePhenotype::Truncated;
        result.add_gene_result(truncated);

        assert_eq!("?2-+!", result.collect_problems());
    }

    #[test]
    fn below_threshold_flag_requires_coverage() {
        let mut result = TypingResult::new("sample", "K1", 0.0);
        result.pieces.push(LocusPiece::new("ctg1", 0, 100));
        let mut hit = gene_result("K1_1", 1, 0, 50, Some(0), GeneType::Expected);
        hit.below_threshold = true;
        hit.percent_coverage = 92.0;
        result.add_gene_result(hit);
        assert_eq!("*", result.collect_problems());

        let mut result = TypingResult::new("sample", "K1", 0.0);
        result.pieces.push(LocusPiece::new("ctg1", 0, 100));
        let mut hit = gene_result("K1_1", 1, 0, 50, Some(0), GeneType::Expected);
        hit.below_threshold = true;
        hit.percent_coverage = 80.0;
        result.add_gene_result(hit);
        assert_eq!("", result.collect_problems());
    }

    #[test]
    fn phenotype_prefers_largest_gene_set() {
        let db = db();
        let locus = &db.loci["K1"];
        let mut result = TypingResult::new("sample", "K1", 0.0);
        result.pieces.push(LocusPiece::new("ctg1", 0, 1000));
        result.add_gene_result(gene_result("K1_1", 1, 0, 12, Some(0), GeneType::Expected));
        assert_eq!("K1-plain", result.resolve_phenotype(locus));

        result.add_gene_result(gene_result("Extra_1", 1, 500, 512, None, GeneType::Extra));
        assert_eq!("K1-extra", result.resolve_phenotype(locus));
    }

    #[test]
    fn truncated_unexpected_genes_do_not_count_as_other() {
        let db = db();
        let locus = &db.loci["K1"];
        let mut result = TypingResult::new("sample", "K1", 0.0);
        result.pieces.push(LocusPiece::new("ctg1", 0, 1000));
        for (name, index) in [("K1_1", 1), ("K1_2", 2), ("K1_3", 3)] {
            result.add_gene_result(gene_result(name, index, 0, 12, Some(0), GeneType::Expected));
        }
        let mut unexpected = gene_result("K2_1", 1, 500, 512, Some(0), GeneType::Unexpected);
        unexpected.phenotype = GenePhenotype::Truncated;
        result.add_gene_result(unexpected);

        assert_eq!(Confidence::Typeable, result.resolve_confidence(locus, false, 1, 50.0));
    }

    #[test]
    fn json_round_trip_preserves_result() {
        let db = db();
        let mut result = TypingResult::new("sample", "K1", 0.0);
        let mut piece = LocusPiece::new("ctg1", 10, 200);
        piece.strand = Strand::Forward;
        piece.sequence = "ACGT".to_string();
        result.pieces.push(piece);
        let first = result.add_gene_result(gene_result("K1_1", 1, 10, 22, Some(0), GeneType::Expected));
        let mut second = gene_result("K1_2", 2, 30, 42, Some(0), GeneType::Expected);
        second.neighbour_left = Some(first);
        result.add_gene_result(second);
        let mut outside = gene_result("K2_1", 1, 500, 512, None, GeneType::Unexpected);
        outside.neighbour_left = Some(1);
        result.add_gene_result(outside);
        result.missing_genes = vec!["K1_3".to_string()];
        result.percent_identity = 99.5;
        result.percent_coverage = 98.0;
        result.phenotype = "K1-plain".to_string();
        result.problems = "-".to_string();
        result.confidence = Confidence::Typeable;

        let line = result.to_json().unwrap();
        let back = TypingResult::from_json(&line, &db).unwrap();
        assert_eq!(result.sample_name, back.sample_name);
        assert_eq!(result.best_match, back.best_match);
        assert_eq!(result.phenotype, back.phenotype);
        assert_eq!(result.problems, back.problems);
        assert_eq!(result.confidence, back.confidence);
        assert_eq!(result.percent_identity, back.percent_identity);
        assert_eq!(result.percent_coverage, back.percent_coverage);
        assert_eq!(result.missing_genes, back.missing_genes);
        assert_eq!(result.pieces.len(), back.pieces.len());
        assert_eq!(result.pieces[0].key(), back.pieces[0].key());
        assert_eq!(
            result.expected_genes_inside_locus.len(),
            back.expected_genes_inside_locus.len()
        );
        // neighbour chain and piece links survive the round trip
        assert_eq!(Some(1), back.genes[0].neighbour_right);
        assert_eq!(Some(0), back.genes[1].neighbour_left);
        assert_eq!(Some(0), back.genes[0].piece);
        assert_eq!(None, back.genes[2].piece);
        assert_eq!(line, back.to_json().unwrap());
    }

    #[test]
    fn rehydration_fails_for_unknown_gene() {
        let db = db();
        let mut result = TypingResult::new("sample", "K1", 0.0);
        result.pieces.push(LocusPiece::new("ctg1", 0, 100));
        result.add_gene_result(gene_result("K1_1", 1, 0, 12, Some(0), GeneType::Expected));
        let line = result.to_json().unwrap().replace("K1_1", "K9_1");
        assert!(TypingResult::from_json(&line, &db).is_err());
    }

    #[test]
    fn unknown_best_match_is_an_error() {
        let db = db();
        let result = TypingResult::new("sample", "K9", 0.0);
        let line = result.to_json().unwrap();
        assert!(TypingResult::from_json(&line, &db).is_err());
    }
}
