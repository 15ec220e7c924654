//! External k-way merge of sorted partial runs into one index.
//!
//! Every run is memory-mapped read-only. A min-heap holds one head item per
//! run; popping the minimum and pushing that run's next entry yields a global
//! order in O(T log N). The merged stream is fed straight into a
//! [`KmerIndexTable`], which flushes segments to the sink as it grows.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, info};

use crate::builder::{BuildConfig, GroupPolicy};
use crate::encode::Alphabet;
use crate::index::{IndexError, KmerEntry, KmerIndexTable};
use crate::io::{INDEX_VERSION, SectionKey, SectionSink, map_partial_run};
use crate::meta::IndexMetadata;

const RECORD_BYTES: usize = std::mem::size_of::<KmerEntry>();

/// One shard's sorted, sentinel-terminated entries, mapped read-only.
pub struct PartialIndexRun {
    path: PathBuf,
    map: Mmap,
    len: usize,
}

impl PartialIndexRun {
    /// Map a run file and validate its framing.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let map = map_partial_run(path)?;
        if map.len() % RECORD_BYTES != 0 {
            return Err(IndexError::Format(format!(
                "run '{}' has {} bytes, not a multiple of {RECORD_BYTES}",
                path.display(),
                map.len()
            )));
        }
        let records: &[KmerEntry] = bytemuck::try_cast_slice(&map[..])
            .map_err(|e| IndexError::Cast(format!("{}: {e:?}", path.display())))?;
        let len = records
            .iter()
            .position(KmerEntry::is_sentinel)
            .ok_or_else(|| {
                IndexError::Format(format!("run '{}' has no sentinel", path.display()))
            })?;
        Ok(PartialIndexRun {
            path: path.to_path_buf(),
            map,
            len,
        })
    }

    /// Entries before the sentinel.
    pub fn entries(&self) -> &[KmerEntry] {
        // layout validated in `open`
        &bytemuck::cast_slice::<u8, KmerEntry>(&self.map[..])[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Current head of one run inside the merge heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeHeapItem {
    /// Comparator key: the raw key, strand bit cleared for nucleotides.
    pub sort_key: u64,
    /// Raw partial-run key.
    pub kmer: u64,
    pub seq_id: u32,
    pub pos: u32,
    pub seq_len: u32,
    pub run: usize,
    pub(crate) offset: usize,
}

impl MergeHeapItem {
    fn new(alphabet: Alphabet, e: &KmerEntry, run: usize, offset: usize) -> Self {
        MergeHeapItem {
            sort_key: alphabet.sort_key(e.key),
            kmer: e.key,
            seq_id: e.seq_id,
            pos: e.pos,
            seq_len: e.seq_len,
            run,
            offset,
        }
    }
}

impl Ord for MergeHeapItem {
    // ties fall back to source order, never to sequence id
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key
            .cmp(&other.sort_key)
            .then(self.run.cmp(&other.run))
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for MergeHeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Summary of one merge or single-split write.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub runs: usize,
    pub input_entries: u64,
    pub written_entries: u64,
    pub distinct_kmers: u64,
}

/// Writes the VERSION and META records that precede ENTRIES.
pub(crate) fn write_preamble<S: SectionSink + ?Sized>(
    meta: &IndexMetadata,
    sink: &mut S,
) -> Result<(), IndexError> {
    sink.write_data(SectionKey::Version, INDEX_VERSION.as_bytes())?;
    sink.align_to_page_size()?;
    sink.write_data(SectionKey::Meta, &meta.encode())?;
    sink.align_to_page_size()
}

/// K-way merger over N partial runs.
#[derive(Clone, Debug)]
pub struct IndexMerger {
    alphabet: Alphabet,
    k: usize,
    grid_bits: u32,
    segment_bytes: usize,
    policy: GroupPolicy,
}

impl IndexMerger {
    pub fn new(cfg: &BuildConfig) -> Self {
        IndexMerger {
            alphabet: cfg.alphabet(),
            k: cfg.k(),
            grid_bits: cfg.grid_bits(),
            segment_bytes: cfg.segment_bytes(),
            policy: cfg.group_policy(),
        }
    }

    /// Open every run, then merge. A run that fails to open aborts before
    /// anything is written.
    pub fn merge_paths<S: SectionSink + ?Sized>(
        &self,
        paths: &[PathBuf],
        meta: &IndexMetadata,
        sink: &mut S,
    ) -> Result<MergeStats, IndexError> {
        let runs = paths
            .iter()
            .map(|p| PartialIndexRun::open(p))
            .collect::<Result<Vec<_>, _>>()?;
        self.merge_runs(&runs, meta, sink)
    }

    pub fn merge_runs<S: SectionSink + ?Sized>(
        &self,
        runs: &[PartialIndexRun],
        meta: &IndexMetadata,
        sink: &mut S,
    ) -> Result<MergeStats, IndexError> {
        info!("Merge {} splits ...", runs.len());
        let alphabet = self.alphabet;
        let mut stats = MergeStats {
            runs: runs.len(),
            ..MergeStats::default()
        };

        write_preamble(meta, sink)?;
        let mut table = KmerIndexTable::new(alphabet, self.k, self.grid_bits, self.segment_bytes);
        table.begin(sink)?;

        let mut heap: BinaryHeap<Reverse<MergeHeapItem>> = BinaryHeap::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            debug!("run {} ({}): {} entries", i, run.path().display(), run.len());
            stats.input_entries += run.len() as u64;
            if let Some(first) = run.entries().first() {
                heap.push(Reverse(MergeHeapItem::new(alphabet, first, i, 0)));
            }
        }

        let mut prev_kmer: Option<u64> = None;
        while let Some(Reverse(item)) = heap.pop() {
            let run = &runs[item.run];
            let next = item.offset + 1;
            if let Some(e) = run.entries().get(next) {
                let head = MergeHeapItem::new(alphabet, e, item.run, next);
                if head.sort_key < item.sort_key {
                    return Err(IndexError::Format(format!(
                        "run '{}' is not sorted at entry {next}",
                        run.path().display()
                    )));
                }
                heap.push(Reverse(head));
            }

            let kmer = alphabet.unpack(item.kmer);
            let new_group = prev_kmer != Some(kmer.value);
            if new_group {
                if table.needs_flush(kmer.value) {
                    table.flush(sink)?;
                }
                stats.distinct_kmers += 1;
            }
            if new_group || self.policy == GroupPolicy::KeepAll {
                table.add_element_sorted(kmer, item.seq_id, item.pos, item.seq_len);
                stats.written_entries += 1;
            }
            prev_kmer = Some(kmer.value);
        }
        info!(
            "Merged {} entries into {} ({} distinct k-mers)",
            stats.input_entries, stats.written_entries, stats.distinct_kmers
        );

        table.finish(sink)?;
        Ok(stats)
    }
}
