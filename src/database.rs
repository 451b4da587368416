//! # Reference locus database
//!
//! In-memory model of a curated locus database: loci, their genes, phenotype
//! catalogues, and extra (phenotype-modifying) loci. The database is loaded
//! once from a JSON document, validated, and then shared read-only between
//! typing runs.
//!
//! The database JSON carries, per locus: the locus nucleotide sequence, the
//! genes (name, strand, sequence), a fallback type label, and an optional
//! phenotype catalogue mapping gene sets to phenotype labels, e.g.:
//! `
//! {
//!     "gene_threshold": 90.0,
//!     "loci": [
//!         {
//!             "name": "K1",
//!             "type_label": "K1",
//!             "seq": "ATG...",
//!             "genes": [{"name": "K1_1_wzi", "strand": "+", "seq": "ATG..."}],
//!             "phenotypes": [{"genes": [["K1_1_wzi", "present"]], "label": "K1"}]
//!         }
//!     ],
//!     "extra_loci": []
//! }
//! `
use std::{fs::File, io::BufReader, io::Read, path::Path, sync::OnceLock};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use log::info;
use serde::Deserialize;

use crate::{alignment::Strand, translate::translate};

/// A reference gene of a locus. Gene names have the form
/// `<locus>_<index>[_<gene name>]`; the integer after the first underscore
/// defines the intra-locus order and is validated at load time.
#[derive(Debug)]
pub struct Gene {
    pub name: String,
    /// Biological identifier, may repeat across paralogs
    pub gene_name: String,
    /// Intra-locus order, the integer after the first `_` in `name`
    pub index: usize,
    /// Strand of the gene on its locus
    pub strand: Strand,
    pub seq: String,
    protein: OnceLock<Vec<u8>>,
}

impl Gene {
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Reference protein, translated once on first use.
    pub fn protein(&self) -> &[u8] {
        self.protein.get_or_init(|| translate(self.seq.as_bytes()))
    }
}

/// A phenotype catalogue entry: the set of `(gene name, gene state)` pairs
/// that must all be present in a typing result for `label` to apply.
#[derive(Debug)]
pub struct Phenotype {
    pub genes: Vec<(String, String)>,
    pub label: String,
}

/// A named cluster of co-located reference genes encoding a
/// serotype-defining region.
#[derive(Debug)]
pub struct Locus {
    pub name: String,
    /// Fallback label when no phenotype entry matches
    pub type_label: String,
    pub seq: String,
    pub genes: IndexMap<String, Gene>,
    /// Sorted largest gene set first at load time; the phenotype resolver
    /// relies on this ordering.
    pub phenotypes: Vec<Phenotype>,
}

impl Locus {
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Nucleotide sequence of the locus as a single FASTA record.
    pub fn fasta(&self) -> String {
        format!(">{}\n{}\n", self.name, self.seq)
    }

    /// Nucleotide sequences of all genes of the locus as a FASTA stream.
    pub fn gene_fasta(&self) -> String {
        self.genes.values().map(|g| format!(">{}\n{}\n", g.name, g.seq)).collect()
    }

    /// Whether any phenotype entry names an `Extra` gene, in which case the
    /// extra loci are mapped against the assembly as well.
    pub fn has_extra_phenotype_genes(&self) -> bool {
        self.phenotypes
            .iter()
            .any(|p| p.genes.iter().any(|(gene, _)| gene.starts_with("Extra")))
    }
}

#[derive(Debug)]
pub struct Database {
    pub loci: IndexMap<String, Locus>,
    /// Loci holding genes listed only in phenotype annotations
    pub extra_loci: IndexMap<String, Locus>,
    /// Percent identity floor below which a gene hit is flagged as
    /// below species level
    pub gene_threshold: f64,
    largest_locus: usize,
}

#[derive(Deserialize)]
struct JsonDatabase {
    gene_threshold: f64,
    loci: Vec<JsonLocus>,
    #[serde(default)]
    extra_loci: Vec<JsonLocus>,
}

#[derive(Deserialize)]
struct JsonLocus {
    name: String,
    #[serde(default)]
    type_label: String,
    seq: String,
    genes: Vec<JsonGene>,
    #[serde(default)]
    phenotypes: Vec<JsonPhenotype>,
}

#[derive(Deserialize)]
struct JsonGene {
    name: String,
    #[serde(default)]
    gene_name: Option<String>,
    strand: String,
    seq: String,
}

#[derive(Deserialize)]
struct JsonPhenotype {
    genes: Vec<(String, String)>,
    label: String,
}

impl Database {
    /// Load and validate a database from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Database> {
        let file = File::open(&path)
            .with_context(|| format!("Could not read database {}", path.as_ref().display()))?;
        let db = Self::from_reader(BufReader::new(file))
            .with_context(|| format!("Could not parse database {}", path.as_ref().display()))?;
        info!(
            "Loaded database with {} loci ({} extra), gene threshold {}%",
            db.loci.len(),
            db.extra_loci.len(),
            db.gene_threshold
        );
        Ok(db)
    }

    pub fn from_reader(reader: impl Read) -> Result<Database> {
        let raw: JsonDatabase =
            serde_json::from_reader(reader).context("Could not deserialize database JSON")?;
        let loci = build_loci(raw.loci)?;
        let extra_loci = build_loci(raw.extra_loci)?;
        if loci.is_empty() {
            bail!("Database contains no loci");
        }
        let largest_locus = loci
            .values()
            .enumerate()
            .max_by_key(|(_, l)| l.len())
            .map(|(i, _)| i)
            .unwrap(); // unwrap here because we bail on empty databases above
        Ok(Database { loci, extra_loci, gene_threshold: raw.gene_threshold, largest_locus })
    }

    /// Number of loci in the database.
    pub fn len(&self) -> usize {
        self.loci.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loci.is_empty()
    }

    /// The longest locus; its length bounds the span of merged alignment
    /// ranges during locus reconstruction.
    pub fn largest_locus(&self) -> &Locus {
        &self.loci[self.largest_locus]
    }

    /// Look up a gene across all loci by its qualified name.
    pub fn gene(&self, name: &str) -> Option<&Gene> {
        let (locus, _) = name.split_once('_')?;
        self.loci.get(locus)?.genes.get(name)
    }

    /// Look up a gene across the extra loci by its qualified name.
    pub fn extra_gene(&self, name: &str) -> Option<&Gene> {
        let (locus, _) = name.split_once('_')?;
        self.extra_loci.get(locus)?.genes.get(name)
    }

    /// Nucleotide sequences of every gene of every locus as one FASTA stream.
    pub fn all_gene_fasta(&self) -> String {
        self.loci.values().map(Locus::gene_fasta).collect()
    }

    /// Nucleotide sequences of all loci as one FASTA stream.
    pub fn all_locus_fasta(&self) -> String {
        self.loci.values().map(Locus::fasta).collect()
    }

    /// Protein sequences of every gene of every locus as one FASTA stream.
    pub fn all_protein_fasta(&self) -> String {
        self.loci
            .values()
            .flat_map(|l| l.genes.values())
            .map(|g| format!(">{}\n{}\n", g.name, String::from_utf8_lossy(g.protein())))
            .collect()
    }

    /// Nucleotide sequences of every extra-locus gene as one FASTA stream.
    pub fn extra_gene_fasta(&self) -> String {
        self.extra_loci.values().map(Locus::gene_fasta).collect()
    }
}

fn build_loci(raw_loci: Vec<JsonLocus>) -> Result<IndexMap<String, Locus>> {
    let mut loci = IndexMap::with_capacity(raw_loci.len());
    for raw in raw_loci {
        if raw.name.contains('_') {
            bail!("Locus name '{}' must not contain an underscore", raw.name);
        }
        let mut genes = IndexMap::with_capacity(raw.genes.len());
        for gene in raw.genes {
            let index = gene_order_index(&gene.name, &raw.name)?;
            let strand = match gene.strand.as_str() {
                "+" => Strand::Forward,
                "-" => Strand::Reverse,
                other => bail!("Gene {} has invalid strand '{other}'", gene.name),
            };
            let gene_name = gene
                .gene_name
                .or_else(|| gene.name.splitn(3, '_').nth(2).map(String::from))
                .unwrap_or_else(|| gene.name.clone());
            if genes
                .insert(
                    gene.name.clone(),
                    Gene {
                        name: gene.name.clone(),
                        gene_name,
                        index,
                        strand,
                        seq: gene.seq,
                        protein: OnceLock::new(),
                    },
                )
                .is_some()
            {
                bail!("Duplicate gene {} in locus {}", gene.name, raw.name);
            }
        }
        let mut phenotypes: Vec<Phenotype> =
            raw.phenotypes.into_iter().map(|p| Phenotype { genes: p.genes, label: p.label }).collect();
        // largest gene set first, the resolver tests sets with extra genes
        // before their subsets
        phenotypes.sort_by_key(|p| std::cmp::Reverse(p.genes.len()));
        let locus = Locus {
            name: raw.name.clone(),
            type_label: raw.type_label,
            seq: raw.seq,
            genes,
            phenotypes,
        };
        if loci.insert(raw.name.clone(), locus).is_some() {
            bail!("Duplicate locus {}", raw.name);
        }
    }
    Ok(loci)
}

/// Parse and validate the intra-locus order index from a gene name of the
/// form `<locus>_<index>[_<suffix>]`.
fn gene_order_index(gene_name: &str, locus_name: &str) -> Result<usize> {
    let rest = gene_name
        .strip_prefix(locus_name)
        .and_then(|r| r.strip_prefix('_'))
        .with_context(|| format!("Gene name '{gene_name}' does not start with '{locus_name}_'"))?;
    rest.split('_')
        .next()
        .unwrap_or("")
        .parse()
        .with_context(|| format!("Gene name '{gene_name}' has no numeric order index"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB_JSON: &str = r#"{
        "gene_threshold": 90.0,
        "loci": [
            {
                "name": "K1",
                "type_label": "K1",
                "seq": "ATGGCTGCTTAAATGAAAGCTTAA",
                "genes": [
                    {"name": "K1_1_wzi", "strand": "+", "seq": "ATGGCTGCTTAA"},
                    {"name": "K1_2", "strand": "-", "seq": "ATGAAAGCTTAA"}
                ],
                "phenotypes": [
                    {"genes": [["K1_1_wzi", "present"]], "label": "K1-variant"},
                    {"genes": [["K1_1_wzi", "present"], ["Extra_1_mod", "present"]], "label": "K1-extra"}
                ]
            },
            {
                "name": "K2",
                "seq": "ATGTTTGGGTAA",
                "genes": [{"name": "K2_1", "strand": "+", "seq": "ATGTTTGGGTAA"}]
            }
        ],
        "extra_loci": [
            {
                "name": "Extra",
                "seq": "ATGCCCGGGTAA",
                "genes": [{"name": "Extra_1_mod", "strand": "+", "seq": "ATGCCCGGGTAA"}]
            }
        ]
    }"#;

    #[test]
    fn loads_and_indexes_genes() {
        let db = Database::from_reader(DB_JSON.as_bytes()).unwrap();
        assert_eq!(2, db.len());
        let gene = db.gene("K1_2").unwrap();
        assert_eq!(2, gene.index);
        assert_eq!("K1_2", gene.gene_name);
        assert_eq!("wzi", db.gene("K1_1_wzi").unwrap().gene_name);
        assert!(db.gene("K9_1").is_none());
        assert!(db.extra_gene("Extra_1_mod").is_some());
    }

    #[test]
    fn largest_locus_is_longest() {
        let db = Database::from_reader(DB_JSON.as_bytes()).unwrap();
        assert_eq!("K1", db.largest_locus().name);
    }

    #[test]
    fn phenotypes_are_sorted_largest_first() {
        let db = Database::from_reader(DB_JSON.as_bytes()).unwrap();
        let locus = &db.loci["K1"];
        assert_eq!("K1-extra", locus.phenotypes[0].label);
        assert!(locus.has_extra_phenotype_genes());
        assert!(!db.loci["K2"].has_extra_phenotype_genes());
    }

    #[test]
    fn reference_protein_is_cached_translation() {
        let db = Database::from_reader(DB_JSON.as_bytes()).unwrap();
        assert_eq!(b"MAA", db.gene("K1_1_wzi").unwrap().protein());
    }

    #[test]
    fn rejects_malformed_gene_names() {
        let bad = r#"{
            "gene_threshold": 90.0,
            "loci": [{"name": "K1", "seq": "A", "genes": [{"name": "K1_x", "strand": "+", "seq": "A"}]}]
        }"#;
        assert!(Database::from_reader(bad.as_bytes()).is_err());
    }

    #[test]
    fn gene_fasta_streams_in_order() {
        let db = Database::from_reader(DB_JSON.as_bytes()).unwrap();
        let fasta = db.all_gene_fasta();
        let headers: Vec<&str> =
            fasta.lines().filter(|l| l.starts_with('>')).collect();
        assert_eq!(vec![">K1_1_wzi", ">K1_2", ">K2_1"], headers);
    }
}
