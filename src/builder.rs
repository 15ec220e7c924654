//! Index construction: k-mer extraction, shard runs built in parallel (rayon),
//! then either the k-way merge or the single-split writer.

use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::encode::{Alphabet, MAP_LUT, Strand, StrandedKmer, map_residue};
use crate::index::{IndexError, KmerEntry, MAX_GRID_BITS};
use crate::io::{SectionSink, write_partial_run};
use crate::merge::{IndexMerger, MergeStats};
use crate::meta::IndexMetadata;
use crate::radix::radix_sort_entries;
use crate::writer::{SingleSplitIndexWriter, pick_center_kmers};

/// What the merge keeps of a group of entries sharing one k-mer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GroupPolicy {
    /// Only the first entry popped for each k-mer.
    #[default]
    FirstPerKmer,
    /// Every entry.
    KeepAll,
}

/// One database sequence.
#[derive(Clone, Debug)]
pub struct SequenceRecord {
    pub id: u32,
    pub seq: Vec<u8>,
}

impl SequenceRecord {
    pub fn new(id: u32, seq: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            seq: seq.into(),
        }
    }
}

/// Build-time configuration.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    alphabet: Alphabet,
    k: usize,
    grid_bits: u32,
    segment_bytes: usize,
    pick_offset: usize,
    group_policy: GroupPolicy,
    shards: usize,
    threads: Option<usize>,
    tmp_dir: PathBuf,
    min_seq_len: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            alphabet: Alphabet::Nucleotide,
            k: 15,
            grid_bits: 20,
            segment_bytes: 64 * 1024 * 1024,
            pick_offset: 0,
            group_policy: GroupPolicy::FirstPerKmer,
            shards: 1,
            threads: None,
            tmp_dir: std::env::temp_dir(),
            min_seq_len: 0,
        }
    }
}

impl BuildConfig {
    pub fn new(alphabet: Alphabet, k: usize) -> Self {
        Self {
            alphabet,
            k,
            ..Self::default()
        }
    }
    /// `log2` of the maximum number of grid buckets (recommended 16..24).
    pub fn with_grid_bits(mut self, b: u32) -> Self {
        self.grid_bits = b;
        self
    }
    /// Buffered ENTRIES size that triggers a flush to the sink.
    pub fn with_segment_bytes(mut self, n: usize) -> Self {
        self.segment_bytes = n;
        self
    }
    /// Position of the representative inside a group of equal k-mers (default: 0).
    pub fn with_pick_offset(mut self, n: usize) -> Self {
        self.pick_offset = n;
        self
    }
    pub fn with_group_policy(mut self, p: GroupPolicy) -> Self {
        self.group_policy = p;
        self
    }
    /// Number of partial runs to build and merge (1 = single split).
    pub fn with_shards(mut self, n: usize) -> Self {
        self.shards = n;
        self
    }
    /// Fix the number of rayon threads used for shard construction.
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }
    /// Directory for temporary partial runs.
    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }
    /// Minimum sequence length to consider (shorter sequences are skipped).
    pub fn min_seq_len(mut self, n: usize) -> Self {
        self.min_seq_len = n;
        self
    }

    pub fn alphabet(&self) -> Alphabet {
        self.alphabet
    }
    pub fn k(&self) -> usize {
        self.k
    }
    pub fn grid_bits(&self) -> u32 {
        self.grid_bits
    }
    pub fn segment_bytes(&self) -> usize {
        self.segment_bytes
    }
    pub fn pick_offset(&self) -> usize {
        self.pick_offset
    }
    pub fn group_policy(&self) -> GroupPolicy {
        self.group_policy
    }
    pub fn shards(&self) -> usize {
        self.shards
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        let max_k = self.alphabet.max_k();
        if self.k == 0 || self.k > max_k {
            return Err(IndexError::Config(format!(
                "k must be 1..={max_k} for {:?}, got {}",
                self.alphabet, self.k
            )));
        }
        if self.grid_bits == 0 || self.grid_bits > MAX_GRID_BITS {
            return Err(IndexError::Config(format!(
                "grid bits must be 1..={MAX_GRID_BITS}, got {}",
                self.grid_bits
            )));
        }
        if self.shards == 0 {
            return Err(IndexError::Config("need at least one shard".into()));
        }
        Ok(())
    }
}

// ---- Rolling extraction (O(1) canonicalization) ----

/// Append every valid k-mer of `seq` to `out` as raw partial-run entries.
/// Ambiguous residues restart the window.
pub fn extract_kmers(
    out: &mut Vec<KmerEntry>,
    seq_id: u32,
    seq: &[u8],
    alphabet: Alphabet,
    k: usize,
) {
    if k == 0 || k > alphabet.max_k() || seq.len() < k {
        return;
    }
    let seq_len = u32::try_from(seq.len()).unwrap_or(u32::MAX);
    match alphabet {
        Alphabet::Nucleotide => {
            let mask: u64 = (1u64 << (2 * k)) - 1;
            let mut fwd: u64 = 0;
            let mut rc: u64 = 0;
            let mut len: usize = 0;

            for (i, &b) in seq.iter().enumerate() {
                let v_raw = MAP_LUT[b as usize];
                if v_raw > 3 {
                    fwd = 0;
                    rc = 0;
                    len = 0;
                    continue;
                }
                let v = v_raw as u64;
                fwd = ((fwd << 2) | v) & mask;
                rc = (rc >> 2) | ((v ^ 0b11) << (2 * (k - 1)));
                len += 1;

                if len >= k {
                    let kmer = StrandedKmer {
                        value: fwd.min(rc),
                        strand: if fwd <= rc {
                            Strand::Forward
                        } else {
                            Strand::Reverse
                        },
                    };
                    let pos = (i + 1 - k) as u32;
                    out.push(KmerEntry::new(alphabet.pack(kmer), seq_id, pos, seq_len));
                }
            }
        }
        Alphabet::Protein => {
            let modulus = 20u64.pow(k as u32 - 1);
            let mut code: u64 = 0;
            let mut len: usize = 0;
            for (i, &b) in seq.iter().enumerate() {
                let Some(v) = map_residue(b) else {
                    code = 0;
                    len = 0;
                    continue;
                };
                code = (code % modulus) * 20 + v as u64;
                len += 1;
                if len >= k {
                    let pos = (i + 1 - k) as u32;
                    out.push(KmerEntry::new(code, seq_id, pos, seq_len));
                }
            }
        }
    }
}

/// `(position, k-mer value)` pairs of a query, strand dropped, ready for
/// index lookups.
pub fn query_kmers(seq: &[u8], alphabet: Alphabet, k: usize) -> Vec<(u32, u64)> {
    let mut raw = Vec::new();
    extract_kmers(&mut raw, 0, seq, alphabet, k);
    raw.into_iter()
        .map(|e| (e.pos, alphabet.unpack(e.key).value))
        .collect()
}

/// Extract and sort the entries of `records`. Not yet reduced.
pub fn sorted_entries(records: &[SequenceRecord], cfg: &BuildConfig) -> Vec<KmerEntry> {
    let parts: Vec<Vec<KmerEntry>> = records
        .par_iter()
        .filter(|r| r.seq.len() >= cfg.min_seq_len)
        .map(|r| {
            let mut v = Vec::with_capacity(r.seq.len().saturating_sub(cfg.k.saturating_sub(1)));
            extract_kmers(&mut v, r.id, &r.seq, cfg.alphabet, cfg.k);
            v
        })
        .collect();
    let mut entries = parts.concat();
    radix_sort_entries(&mut entries, cfg.alphabet);
    entries
}

/// Build one shard: extract, sort, pick center k-mers, write a run file.
pub fn build_partial_run(
    records: &[SequenceRecord],
    cfg: &BuildConfig,
    path: &Path,
) -> Result<usize, IndexError> {
    let mut entries = sorted_entries(records, cfg);
    let kept = pick_center_kmers(&mut entries, cfg.alphabet, cfg.pick_offset);
    write_partial_run(path, &entries)?;
    debug!("run {}: {} entries", path.display(), kept);
    Ok(kept)
}

/// Contiguous record range of shard `i` out of `shards`. Every shard is
/// non-empty while `shards <= len`.
fn shard_range(len: usize, shards: usize, i: usize) -> std::ops::Range<usize> {
    (i * len / shards)..((i + 1) * len / shards)
}

/// Temporary run files, removed when dropped.
struct RunFiles {
    paths: Vec<PathBuf>,
}

impl Drop for RunFiles {
    fn drop(&mut self) {
        for p in &self.paths {
            let _ = fs::remove_file(p);
        }
    }
}

/// Build a complete index over `records` into `sink`.
///
/// With one shard the sorted entries go straight to the
/// [`SingleSplitIndexWriter`]; otherwise each shard is written as a partial
/// run concurrently and the runs are merged with the [`IndexMerger`].
pub fn build_index<S: SectionSink + ?Sized>(
    records: &[SequenceRecord],
    cfg: &BuildConfig,
    meta: &IndexMetadata,
    sink: &mut S,
) -> Result<MergeStats, IndexError> {
    cfg.validate()?;
    if meta.alphabet != cfg.alphabet || meta.kmer_size as usize != cfg.k {
        return Err(IndexError::Config(format!(
            "metadata ({:?}, k={}) does not describe this build ({:?}, k={})",
            meta.alphabet, meta.kmer_size, cfg.alphabet, cfg.k
        )));
    }

    let pool = {
        let mut b = rayon::ThreadPoolBuilder::new();
        if let Some(n) = cfg.threads {
            b = b.num_threads(n);
        }
        b.build()
            .map_err(|e| IndexError::Config(format!("thread pool: {e}")))?
    };

    let shards = cfg.shards.min(records.len()).max(1);
    if shards == 1 {
        info!("Building single split over {} sequences", records.len());
        let entries = pool.install(|| sorted_entries(records, cfg));
        return SingleSplitIndexWriter::new(cfg).write(entries, meta, sink);
    }

    fs::create_dir_all(&cfg.tmp_dir)?;
    let run_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let runs = RunFiles {
        paths: (0..shards)
            .map(|i| {
                cfg.tmp_dir.join(format!(
                    "kpf.tmp.{}.{run_id}.split.{i}.bin",
                    std::process::id()
                ))
            })
            .collect(),
    };

    info!("Building {} splits over {} sequences", shards, records.len());
    pool.install(|| {
        runs.paths
            .par_iter()
            .enumerate()
            .map(|(i, path)| {
                let part = &records[shard_range(records.len(), shards, i)];
                build_partial_run(part, cfg, path)
            })
            .collect::<Result<Vec<usize>, IndexError>>()
    })?;

    IndexMerger::new(cfg).merge_paths(&runs.paths, meta, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{STRAND_BIT, canonical, encode_kmer, encode_protein_kmer};

    #[test]
    fn nucleotide_extraction_is_canonical_with_strand() {
        let mut out = Vec::new();
        extract_kmers(&mut out, 3, b"ACGTTNAAC", Alphabet::Nucleotide, 3);
        // ACG CGT GTT | AAC
        assert_eq!(out.len(), 4);
        for (e, w) in out.iter().zip([&b"ACG"[..], b"CGT", b"GTT", b"AAC"]) {
            let c = canonical(encode_kmer(w).unwrap(), 3);
            assert_eq!(Alphabet::Nucleotide.unpack(e.key), c);
            assert_eq!(e.seq_id, 3);
            assert_eq!(e.seq_len, 9);
        }
        assert_eq!(out[3].pos, 6);
        // GTT reverse-complements to AAC
        assert_eq!(Alphabet::Nucleotide.unpack(out[2].key).strand, Strand::Reverse);
        assert_eq!(out[3].key & STRAND_BIT, STRAND_BIT);
    }

    #[test]
    fn protein_extraction_rolls_base_twenty() {
        let mut out = Vec::new();
        extract_kmers(&mut out, 0, b"MKVXLAW", Alphabet::Protein, 2);
        let kmers: Vec<u64> = out.iter().map(|e| e.key).collect();
        let expect: Vec<u64> = [&b"MK"[..], b"KV", b"LA", b"AW"]
            .iter()
            .map(|w| encode_protein_kmer(w).unwrap())
            .collect();
        assert_eq!(kmers, expect);
        assert_eq!(out[2].pos, 4);
    }

    #[test]
    fn short_sequences_yield_nothing() {
        let mut out = Vec::new();
        extract_kmers(&mut out, 0, b"AC", Alphabet::Nucleotide, 3);
        assert!(out.is_empty());
    }

    #[test]
    fn shard_ranges_cover_every_record_once() {
        for (len, shards) in [(9, 4), (5, 4), (8, 3), (4, 4), (100, 7)] {
            let ranges: Vec<_> = (0..shards).map(|i| shard_range(len, shards, i)).collect();
            assert_eq!(ranges.len(), shards);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges[shards - 1].end, len);
            assert!(ranges.iter().all(|r| !r.is_empty()));
            assert!(ranges.windows(2).all(|w| w[0].end == w[1].start));
        }
    }

    #[test]
    fn config_rejects_out_of_range_k() {
        assert!(BuildConfig::new(Alphabet::Nucleotide, 32).validate().is_err());
        assert!(BuildConfig::new(Alphabet::Protein, 15).validate().is_err());
        assert!(BuildConfig::new(Alphabet::Protein, 0).validate().is_err());
        assert!(BuildConfig::new(Alphabet::Protein, 6).validate().is_ok());
        assert!(
            BuildConfig::new(Alphabet::Protein, 6)
                .with_grid_bits(0)
                .validate()
                .is_err()
        );
    }
}
