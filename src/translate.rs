//! # Translation and protein comparison
//!
//! Bacterial (NCBI table 11) translation of extracted gene sequences and
//! local protein alignment against the database reference proteins. The
//! protein aligner mirrors BLASTP scoring: BLOSUM62 with gap open -11 and
//! gap extend -1.
use bio::alignment::{pairwise::Aligner, AlignmentOperation};
use bio::scores::blosum62;

const GAP_OPEN: i32 = -11;
const GAP_EXTEND: i32 = -1;

/// Amino acid for one codon under NCBI translation table 11. Codons with
/// ambiguous or unexpected bases translate to `X`.
fn codon_to_aa(codon: &[u8]) -> u8 {
    match codon {
        b"TTT" | b"TTC" => b'F',
        b"TTA" | b"TTG" | b"CTT" | b"CTC" | b"CTA" | b"CTG" => b'L',
        b"ATT" | b"ATC" | b"ATA" => b'I',
        b"ATG" => b'M',
        b"GTT" | b"GTC" | b"GTA" | b"GTG" => b'V',
        b"TCT" | b"TCC" | b"TCA" | b"TCG" | b"AGT" | b"AGC" => b'S',
        b"CCT" | b"CCC" | b"CCA" | b"CCG" => b'P',
        b"ACT" | b"ACC" | b"ACA" | b"ACG" => b'T',
        b"GCT" | b"GCC" | b"GCA" | b"GCG" => b'A',
        b"TAT" | b"TAC" => b'Y',
        b"TAA" | b"TAG" | b"TGA" => b'*',
        b"CAT" | b"CAC" => b'H',
        b"CAA" | b"CAG" => b'Q',
        b"AAT" | b"AAC" => b'N',
        b"AAA" | b"AAG" => b'K',
        b"GAT" | b"GAC" => b'D',
        b"GAA" | b"GAG" => b'E',
        b"TGT" | b"TGC" => b'C',
        b"TGG" => b'W',
        b"CGT" | b"CGC" | b"CGA" | b"CGG" | b"AGA" | b"AGG" => b'R',
        b"GGT" | b"GGC" | b"GGA" | b"GGG" => b'G',
        _ => b'X',
    }
}

/// Translate a DNA sequence, stopping at the first stop codon. A trailing
/// partial codon is ignored. Case-insensitive.
pub fn translate(dna: &[u8]) -> Vec<u8> {
    let mut protein = Vec::with_capacity(dna.len() / 3);
    for codon in dna.chunks_exact(3) {
        let aa = codon_to_aa(&codon.to_ascii_uppercase());
        if aa == b'*' {
            break;
        }
        protein.push(aa);
    }
    protein
}

/// Percent identity of the best-scoring local alignment between a query and
/// a reference protein: identical columns over alignment length. Returns 0
/// when either sequence is empty.
pub fn percent_identity(query: &[u8], reference: &[u8]) -> f64 {
    if query.is_empty() || reference.is_empty() {
        return 0.0;
    }
    let mut aligner =
        Aligner::with_capacity(query.len(), reference.len(), GAP_OPEN, GAP_EXTEND, &blosum62);
    let alignment = aligner.local(query, reference);
    let mut identities = 0usize;
    let mut length = 0usize;
    for op in &alignment.operations {
        match op {
            AlignmentOperation::Match => {
                identities += 1;
                length += 1;
            }
            AlignmentOperation::Subst | AlignmentOperation::Del | AlignmentOperation::Ins => {
                length += 1;
            }
            AlignmentOperation::Xclip(_) | AlignmentOperation::Yclip(_) => {}
        }
    }
    if length == 0 {
        return 0.0;
    }
    identities as f64 / length as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_until_stop() {
        assert_eq!(b"MAK".to_vec(), translate(b"ATGGCTAAATAAGCT"));
        // lowercase input, trailing partial codon
        assert_eq!(b"MA".to_vec(), translate(b"atggctaa"));
    }

    #[test]
    fn leading_stop_gives_empty_protein() {
        assert!(translate(b"TAAATGGCT").is_empty());
        assert!(translate(b"AT").is_empty());
    }

    #[test]
    fn ambiguous_codon_is_x() {
        assert_eq!(b"MXK".to_vec(), translate(b"ATGGNTAAA"));
    }

    #[test]
    fn identical_proteins_are_100_percent() {
        let p = b"MAKGLSDEQWRTYHVNNPIF";
        assert!((percent_identity(p, p) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn single_substitution_identity() {
        let reference = b"MAKGLSDEQWRTYHVNNPIF";
        let query = b"MAKGLSDEQARTYHVNNPIF".to_vec();
        let identity = percent_identity(&query, reference);
        assert!((identity - 95.0).abs() < 1.0, "identity was {identity}");
    }

    #[test]
    fn empty_query_is_zero() {
        assert_eq!(0.0, percent_identity(b"", b"MAK"));
    }
}
