//! Index metadata and the reuse compatibility check.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};

use crate::encode::Alphabet;
use crate::index::IndexError;

/// Build parameters an index was created with. An index may only be reused
/// by a run whose parameters match on every field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexMetadata {
    pub comp_bias_correction: bool,
    pub max_seq_len: u32,
    pub alphabet: Alphabet,
    pub alphabet_size: u32,
    pub kmer_size: u32,
    pub mask: bool,
    pub kmer_threshold: i32,
    pub spaced_kmer: bool,
    pub substitution_matrix: String,
    pub spaced_pattern: String,
}

impl IndexMetadata {
    /// Metadata for a plain (unmasked, unspaced) index over `alphabet` and `k`.
    pub fn new(alphabet: Alphabet, k: usize) -> Self {
        IndexMetadata {
            comp_bias_correction: false,
            max_seq_len: u32::MAX,
            alphabet,
            alphabet_size: alphabet.size(),
            kmer_size: k as u32,
            mask: false,
            kmer_threshold: 0,
            spaced_kmer: false,
            substitution_matrix: String::new(),
            spaced_pattern: String::new(),
        }
    }

    /// Name of the first field that differs, if any.
    pub fn first_mismatch(&self, run: &IndexMetadata) -> Option<&'static str> {
        if self.comp_bias_correction != run.comp_bias_correction {
            return Some("comp_bias_correction");
        }
        if self.max_seq_len != run.max_seq_len {
            return Some("max_seq_len");
        }
        if self.alphabet != run.alphabet {
            return Some("alphabet");
        }
        if self.alphabet_size != run.alphabet_size {
            return Some("alphabet_size");
        }
        if self.kmer_size != run.kmer_size {
            return Some("kmer_size");
        }
        if self.mask != run.mask {
            return Some("mask");
        }
        if self.kmer_threshold != run.kmer_threshold {
            return Some("kmer_threshold");
        }
        if self.spaced_kmer != run.spaced_kmer {
            return Some("spaced_kmer");
        }
        if self.substitution_matrix != run.substitution_matrix {
            return Some("substitution_matrix");
        }
        if self.spaced_pattern != run.spaced_pattern {
            return Some("spaced_pattern");
        }
        None
    }

    /// True if an index built with `self` can serve a run configured as `run`.
    pub fn is_compatible(&self, run: &IndexMetadata) -> bool {
        match self.first_mismatch(run) {
            Some(field) => {
                tracing::info!("Index not reusable: {field} differs, rebuild required");
                false
            }
            None => true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.substitution_matrix.len());
        // writes into a Vec cannot fail
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, w: &mut Vec<u8>) -> std::io::Result<()> {
        w.write_u8(self.comp_bias_correction as u8)?;
        w.write_u32::<LE>(self.max_seq_len)?;
        w.write_u32::<LE>(self.alphabet.code())?;
        w.write_u32::<LE>(self.alphabet_size)?;
        w.write_u32::<LE>(self.kmer_size)?;
        w.write_u8(self.mask as u8)?;
        w.write_i32::<LE>(self.kmer_threshold)?;
        w.write_u8(self.spaced_kmer as u8)?;
        write_str(w, &self.substitution_matrix)?;
        write_str(w, &self.spaced_pattern)?;
        Ok(())
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, IndexError> {
        let r = &mut bytes;
        let comp_bias_correction = r.read_u8()? != 0;
        let max_seq_len = r.read_u32::<LE>()?;
        let code = r.read_u32::<LE>()?;
        let alphabet = Alphabet::from_code(code)
            .ok_or_else(|| IndexError::Format(format!("unknown alphabet code {code}")))?;
        Ok(IndexMetadata {
            comp_bias_correction,
            max_seq_len,
            alphabet,
            alphabet_size: r.read_u32::<LE>()?,
            kmer_size: r.read_u32::<LE>()?,
            mask: r.read_u8()? != 0,
            kmer_threshold: r.read_i32::<LE>()?,
            spaced_kmer: r.read_u8()? != 0,
            substitution_matrix: read_str(&mut *r)?,
            spaced_pattern: read_str(&mut *r)?,
        })
    }
}

fn write_str(w: &mut Vec<u8>, s: &str) -> std::io::Result<()> {
    w.write_u32::<LE>(s.len() as u32)?;
    w.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_str(r: &mut &[u8]) -> Result<String, IndexError> {
    let len = r.read_u32::<LE>()? as usize;
    if len > r.len() {
        return Err(IndexError::Format(format!(
            "metadata string of {len} bytes, {} left",
            r.len()
        )));
    }
    let (s, rest) = r.split_at(len);
    *r = rest;
    String::from_utf8(s.to_vec()).map_err(|e| IndexError::Format(format!("metadata string: {e}")))
}
