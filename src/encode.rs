//! K-mer encoding: residue mapping, rolling reverse complement, canonicalization,
//! and the strand-tagged key used by partial runs.
//!
//! Conventions
//! - Nucleotide k-mers are **LSB-aligned** 2-bit codes (lower `2k` bits, A=0 C=1 G=2 T=3).
//! - Protein k-mers are base-20 values over [`PROTEIN_ALPHABET`].
//! - Partial-run keys for nucleotides carry the strand in bit 63 (set = forward).
//!   Only [`Alphabet::pack`] and [`Alphabet::unpack`] look at that bit.

/// Bit 63 of a nucleotide partial-run key: set for forward, clear for reverse.
pub const STRAND_BIT: u64 = 1 << 63;

/// Key terminating every partial run.
pub const SENTINEL_KEY: u64 = u64::MAX;

/// Amino-acid ordering used for protein k-mer values.
pub const PROTEIN_ALPHABET: &[u8; 20] = b"ACDEFGHIKLMNPQRSTVWY";

/// 256-entry LUT: ASCII → 2-bit (A=0, C=1, G=2, T/U=3), 0xFF for ambiguous.
pub static MAP_LUT: [u8; 256] = {
    const X: u8 = 0xFF;
    let mut t = [X; 256];
    t[b'A' as usize] = 0;
    t[b'a' as usize] = 0;
    t[b'C' as usize] = 1;
    t[b'c' as usize] = 1;
    t[b'G' as usize] = 2;
    t[b'g' as usize] = 2;
    t[b'T' as usize] = 3;
    t[b't' as usize] = 3;
    t[b'U' as usize] = 3;
    t[b'u' as usize] = 3;
    t
};

/// 256-entry LUT: ASCII → amino-acid rank in [`PROTEIN_ALPHABET`], 0xFF otherwise.
pub static AA_LUT: [u8; 256] = {
    let mut t = [0xFFu8; 256];
    let mut i = 0;
    while i < PROTEIN_ALPHABET.len() {
        let c = PROTEIN_ALPHABET[i];
        t[c as usize] = i as u8;
        t[c.to_ascii_lowercase() as usize] = i as u8;
        i += 1;
    }
    t
};

/// Strand of a k-mer occurrence relative to its stored (canonical) value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Strand {
    #[default]
    Forward,
    Reverse,
}

impl Strand {
    #[inline]
    pub fn is_reverse(self) -> bool {
        matches!(self, Strand::Reverse)
    }
}

/// A k-mer value together with the strand it was observed on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StrandedKmer {
    pub value: u64,
    pub strand: Strand,
}

/// Sequence alphabet of an index. Selects the merge comparator and key decoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Alphabet {
    Nucleotide,
    Protein,
}

impl Alphabet {
    /// Number of residues.
    #[inline]
    pub fn size(self) -> u32 {
        match self {
            Alphabet::Nucleotide => 4,
            Alphabet::Protein => PROTEIN_ALPHABET.len() as u32,
        }
    }

    /// Largest k whose values fit next to the strand bit.
    pub fn max_k(self) -> usize {
        match self {
            Alphabet::Nucleotide => 31,
            Alphabet::Protein => 14,
        }
    }

    /// Number of significant bits in a k-mer value for this alphabet.
    pub fn key_bits(self, k: usize) -> u32 {
        match self {
            Alphabet::Nucleotide => (2 * k as u32).min(63),
            Alphabet::Protein => match (self.size() as u64).checked_pow(k as u32) {
                Some(space) => 64 - (space - 1).leading_zeros(),
                None => 63,
            },
        }
    }

    /// Stable numeric tag persisted in index metadata.
    pub fn code(self) -> u32 {
        match self {
            Alphabet::Nucleotide => 1,
            Alphabet::Protein => 0,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Alphabet::Protein),
            1 => Some(Alphabet::Nucleotide),
            _ => None,
        }
    }

    /// Ordering key of a raw partial-run key. Nucleotide keys ignore the strand bit.
    #[inline]
    pub fn sort_key(self, raw: u64) -> u64 {
        match self {
            Alphabet::Nucleotide if raw != SENTINEL_KEY => raw & !STRAND_BIT,
            _ => raw,
        }
    }

    /// Split a raw partial-run key into value and strand.
    #[inline]
    pub fn unpack(self, raw: u64) -> StrandedKmer {
        match self {
            Alphabet::Nucleotide => StrandedKmer {
                value: raw & !STRAND_BIT,
                strand: if raw & STRAND_BIT != 0 {
                    Strand::Forward
                } else {
                    Strand::Reverse
                },
            },
            Alphabet::Protein => StrandedKmer {
                value: raw,
                strand: Strand::Forward,
            },
        }
    }

    /// Inverse of [`Alphabet::unpack`].
    #[inline]
    pub fn pack(self, kmer: StrandedKmer) -> u64 {
        match self {
            Alphabet::Nucleotide => match kmer.strand {
                Strand::Forward => kmer.value | STRAND_BIT,
                Strand::Reverse => kmer.value & !STRAND_BIT,
            },
            Alphabet::Protein => kmer.value,
        }
    }
}

/// 2-bit encoding via LUT: A=00, C=01, G=10, T=11. `None` if ambiguous.
#[inline]
pub fn map_base(b: u8) -> Option<u8> {
    let v = MAP_LUT[b as usize];
    if v <= 3 { Some(v) } else { None }
}

/// Amino-acid rank. `None` for anything outside the 20 standard residues.
#[inline]
pub fn map_residue(b: u8) -> Option<u8> {
    let v = AA_LUT[b as usize];
    if v < 20 { Some(v) } else { None }
}

/// Encode a nucleotide window to an **LSB-aligned** `u64`. None if `k>31` or ambiguous.
#[inline]
pub fn encode_kmer(window: &[u8]) -> Option<u64> {
    let k = window.len();
    if k == 0 || k > 31 {
        return None;
    }
    let mut code: u64 = 0;
    for &b in window {
        let v = map_base(b)? as u64;
        code = (code << 2) | v;
    }
    Some(code)
}

/// Encode a protein window as a base-20 value. None if `k>14` or a residue is unknown.
#[inline]
pub fn encode_protein_kmer(window: &[u8]) -> Option<u64> {
    let k = window.len();
    if k == 0 || k > Alphabet::Protein.max_k() {
        return None;
    }
    let mut code: u64 = 0;
    for &b in window {
        code = code * 20 + map_residue(b)? as u64;
    }
    Some(code)
}

/// Reverse-complement an **LSB-aligned** code (lower `2k` bits used).
#[inline]
pub fn revcomp(code_lsb: u64, k: usize) -> u64 {
    debug_assert!(k <= 32);
    let mut rc: u64 = 0;
    for i in 0..k {
        let base = (code_lsb >> (i * 2)) & 0b11;
        let comp = base ^ 0b11;
        let shift = (k - 1 - i) * 2;
        rc |= comp << shift;
    }
    rc
}

/// Canonicalize an **LSB-aligned** code. The strand is forward when the
/// forward code is the smaller of the pair.
#[inline]
pub fn canonical(code_lsb: u64, k: usize) -> StrandedKmer {
    let rc = revcomp(code_lsb, k);
    if code_lsb <= rc {
        StrandedKmer {
            value: code_lsb,
            strand: Strand::Forward,
        }
    } else {
        StrandedKmer {
            value: rc,
            strand: Strand::Reverse,
        }
    }
}
