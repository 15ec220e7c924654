//! KmerIndexTable: sorted entry buffer with segment flushes and a coarse grid,
//! plus the mmap-backed reader that resolves lookups through that grid.

use bytemuck::{Pod, Zeroable};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::encode::{Alphabet, SENTINEL_KEY, Strand, StrandedKmer};
use crate::io::{INDEX_VERSION, IndexFile, SectionKey, SectionSink};
use crate::meta::IndexMetadata;

/// Size in bytes of one persisted [`IndexEntry`].
pub const ENTRY_BYTES: usize = std::mem::size_of::<IndexEntry>();

/// Upper bound on `log2(grid buckets)`.
pub const MAX_GRID_BITS: u32 = 32;

#[derive(Debug, Error)]
/// Errors returned while building or opening an index.
pub enum IndexError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A partial run could not be opened or mapped. Aborts the whole build.
    #[error("cannot open partial run '{}': {source}", path.display())]
    RunOpen {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Invalid file or run layout.
    #[error("Invalid index data: {0}")]
    Format(String),
    /// Bytemuck cast failed.
    #[error("Cast error: {0}")]
    Cast(String),
    /// Invalid build or scoring parameters.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// One k-mer occurrence as produced by a shard builder.
///
/// `key` is the raw partial-run key: for nucleotides bit 63 carries the strand
/// (see [`Alphabet::pack`]). [`KmerEntry::sentinel`] terminates a run.
#[repr(C)]
#[derive(Copy, Clone, Default, Pod, Zeroable, PartialEq, Eq, Debug)]
pub struct KmerEntry {
    pub key: u64,
    pub seq_id: u32,
    pub pos: u32,
    pub seq_len: u32,
    pub reserved: u32,
}

impl KmerEntry {
    pub fn new(key: u64, seq_id: u32, pos: u32, seq_len: u32) -> Self {
        Self {
            key,
            seq_id,
            pos,
            seq_len,
            reserved: 0,
        }
    }

    pub fn sentinel() -> Self {
        Self::new(SENTINEL_KEY, 0, 0, 0)
    }

    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.key == SENTINEL_KEY
    }
}

/// Persisted entry: strand-free k-mer value plus its location.
#[repr(C)]
#[derive(Copy, Clone, Default, Pod, Zeroable, PartialEq, Eq, Debug)]
pub struct IndexEntry {
    pub kmer: u64,
    pub seq_id: u32,
    pub pos: u32,
    pub seq_len: u32,
    /// 0 = forward, 1 = reverse.
    pub strand: u32,
}

impl IndexEntry {
    #[inline]
    pub fn strand(&self) -> Strand {
        if self.strand == 0 {
            Strand::Forward
        } else {
            Strand::Reverse
        }
    }
}

/// Shift applied to k-mer values to obtain their grid bucket.
///
/// Bounds the bucket count by `2^grid_bits` whatever the alphabet and k.
pub fn grid_resolution(alphabet: Alphabet, k: usize, grid_bits: u32) -> u32 {
    alphabet.key_bits(k).saturating_sub(grid_bits)
}

fn grid_buckets(alphabet: Alphabet, k: usize, resolution: u32) -> usize {
    let bits = alphabet.key_bits(k);
    let max_key = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
    ((max_key >> resolution) + 1) as usize
}

/// Append-only entry table that streams its ENTRIES section to a sink in
/// segments and derives the grid offsets from what it has written.
pub struct KmerIndexTable {
    resolution: u32,
    num_buckets: usize,
    flush_entries: usize,
    buffer: Vec<IndexEntry>,
    flushed_bytes: u64,
    entries_num: u64,
    grid: Vec<u64>,
    last_kmer: Option<u64>,
}

impl KmerIndexTable {
    /// `segment_bytes` is the buffered size that triggers a flush.
    pub fn new(alphabet: Alphabet, k: usize, grid_bits: u32, segment_bytes: usize) -> Self {
        let resolution = grid_resolution(alphabet, k, grid_bits);
        let flush_entries = (segment_bytes / ENTRY_BYTES).max(1);
        KmerIndexTable {
            resolution,
            num_buckets: grid_buckets(alphabet, k, resolution),
            flush_entries,
            buffer: Vec::with_capacity(flush_entries.min(1 << 20)),
            flushed_bytes: 0,
            entries_num: 0,
            grid: Vec::new(),
            last_kmer: None,
        }
    }

    /// Open the ENTRIES record on `sink`. Call once before the first flush.
    pub fn begin<S: SectionSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), IndexError> {
        sink.write_start()
    }

    /// True when the buffer has reached the segment size. Checked before the
    /// first entry of a new k-mer group so groups never straddle a segment.
    #[inline]
    pub fn needs_flush(&self, next_kmer: u64) -> bool {
        debug_assert!(self.last_kmer.is_none_or(|prev| next_kmer >= prev));
        self.buffer.len() >= self.flush_entries
    }

    /// Append an entry. Values must arrive in non-decreasing k-mer order.
    pub fn add_element_sorted(&mut self, kmer: StrandedKmer, seq_id: u32, pos: u32, seq_len: u32) {
        debug_assert!(self.last_kmer.is_none_or(|prev| kmer.value >= prev));
        let bucket = (kmer.value >> self.resolution) as usize;
        if bucket >= self.grid.len() {
            let offset = self.flushed_bytes + (self.buffer.len() * ENTRY_BYTES) as u64;
            // empty buckets in between inherit the previous bucket's offset
            let fill = self.grid.last().copied().unwrap_or(0);
            self.grid.resize(bucket, fill);
            self.grid.push(offset);
        }
        self.buffer.push(IndexEntry {
            kmer: kmer.value,
            seq_id,
            pos,
            seq_len,
            strand: kmer.strand.is_reverse() as u32,
        });
        self.entries_num += 1;
        self.last_kmer = Some(kmer.value);
    }

    /// Write the buffered entries to `sink` and reset the buffer.
    pub fn flush<S: SectionSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), IndexError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let bytes = bytemuck::cast_slice::<IndexEntry, u8>(&self.buffer);
        sink.write_add(bytes)?;
        self.flushed_bytes += bytes.len() as u64;
        debug!(
            "Flushed {} entries ({} bytes total)",
            self.buffer.len(),
            self.flushed_bytes
        );
        self.buffer.clear();
        Ok(())
    }

    /// Extend the grid to its full bucket count. Trailing empty buckets
    /// inherit the last recorded offset.
    pub fn setup_offset_table(&mut self) {
        let fill = self.grid.last().copied().unwrap_or(0);
        if self.grid.len() < self.num_buckets {
            self.grid.resize(self.num_buckets, fill);
        }
    }

    /// Final flush, then ENTRIESOFFSETS, ENTRIESGRIDSIZE and ENTRIESNUM, each
    /// page-aligned.
    pub fn finish<S: SectionSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), IndexError> {
        self.flush(sink)?;
        sink.write_end(SectionKey::Entries)?;
        sink.align_to_page_size()?;

        self.setup_offset_table();
        tracing::info!("Write ENTRIESOFFSETS ({} buckets)", self.grid.len());
        sink.write_data(
            SectionKey::EntriesOffsets,
            bytemuck::cast_slice::<u64, u8>(&self.grid),
        )?;
        sink.align_to_page_size()?;

        tracing::info!("Write ENTRIESGRIDSIZE ({})", self.resolution);
        let resolution = u64::from(self.resolution);
        sink.write_data(SectionKey::EntriesGridSize, &resolution.to_le_bytes())?;
        sink.align_to_page_size()?;

        tracing::info!("Write ENTRIESNUM ({})", self.entries_num);
        sink.write_data(SectionKey::EntriesNum, &self.entries_num.to_le_bytes())?;
        sink.align_to_page_size()?;
        Ok(())
    }

    pub fn offsets(&self) -> &[u64] {
        &self.grid
    }

    pub fn grid_resolution(&self) -> u32 {
        self.resolution
    }

    pub fn table_entries_num(&self) -> u64 {
        self.entries_num
    }
}

/// Read-only, memory-mapped view of a persisted index.
pub struct KmerIndexReader {
    file: IndexFile,
    meta: IndexMetadata,
    resolution: u32,
    entries_num: u64,
}

impl KmerIndexReader {
    /// Open an index file via mmap.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let file = IndexFile::open(path)?;
        let version = file.version()?;
        if !version.starts_with(INDEX_VERSION) {
            return Err(IndexError::Format(format!(
                "index written by version {version:?}, expected {INDEX_VERSION:?}"
            )));
        }
        let meta = IndexMetadata::decode(file.section(SectionKey::Meta)?)?;
        let resolution = file.scalar_u64(SectionKey::EntriesGridSize)?;
        if resolution > 63 {
            return Err(IndexError::Format(format!(
                "grid resolution {resolution} out of range"
            )));
        }
        let entries_num = file.scalar_u64(SectionKey::EntriesNum)?;

        let reader = KmerIndexReader {
            file,
            meta,
            resolution: resolution as u32,
            entries_num,
        };
        if reader.entries()?.len() as u64 != entries_num {
            return Err(IndexError::Format(format!(
                "ENTRIESNUM says {} but ENTRIES holds {}",
                entries_num,
                reader.entries()?.len()
            )));
        }
        Ok(reader)
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.meta
    }

    pub fn grid_resolution(&self) -> u32 {
        self.resolution
    }

    pub fn len(&self) -> u64 {
        self.entries_num
    }

    pub fn is_empty(&self) -> bool {
        self.entries_num == 0
    }

    pub fn entries(&self) -> Result<&[IndexEntry], IndexError> {
        self.file.section_slice::<IndexEntry>(SectionKey::Entries)
    }

    pub fn offsets(&self) -> Result<&[u64], IndexError> {
        self.file.section_slice::<u64>(SectionKey::EntriesOffsets)
    }

    /// All entries stored for `kmer` (strand-free value).
    ///
    /// Starts at the grid offset of the k-mer's bucket and scans forward until
    /// the first larger k-mer.
    pub fn lookup(&self, kmer: u64) -> Result<&[IndexEntry], IndexError> {
        let entries = self.entries()?;
        let offsets = self.offsets()?;
        let bucket = (kmer >> self.resolution) as usize;
        let Some(&offset) = offsets.get(bucket) else {
            return Ok(&[]);
        };
        let mut start = offset as usize / ENTRY_BYTES;
        while start < entries.len() && entries[start].kmer < kmer {
            start += 1;
        }
        let mut end = start;
        while end < entries.len() && entries[end].kmer == kmer {
            end += 1;
        }
        Ok(&entries[start..end])
    }
}
