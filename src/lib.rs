//! K-mer prefilter index (edition 2024).
//!
//! Two halves:
//! - Build: sequences are cut into k-mers, sorted into partial runs, merged
//!   (k-way, over mmapped runs) and written as a gridded ENTRIES table into a
//!   page-aligned `.kpi` container.
//! - Query: k-mer matches are accumulated per database sequence in packed
//!   8-lane slots, thresholded through a score histogram, and ranked by a
//!   Poisson-tail significance estimate.
//!
//! Nucleotide k-mers are canonical, with the strand of each occurrence kept
//! in the top bit of the partial-run key. See [`encode`] for the conventions.

mod builder;
pub mod encode;
mod index;
mod io;
mod merge;
mod meta;
mod radix;
mod score;
mod stats;
mod writer;

pub use builder::{
    BuildConfig, GroupPolicy, SequenceRecord, build_index, build_partial_run, extract_kmers,
    query_kmers, sorted_entries,
};
pub use encode::{Alphabet, Strand, StrandedKmer, canonical, encode_kmer, revcomp};
pub use index::{
    ENTRY_BYTES, IndexEntry, IndexError, KmerEntry, KmerIndexReader, KmerIndexTable,
    grid_resolution,
};
pub use io::{
    INDEX_EXTENSION, INDEX_VERSION, IndexFile, IndexFileWriter, MemorySink, PAGE_SIZE, SectionKey,
    SectionSink, find_index, index_path, write_partial_run,
};
pub use merge::{IndexMerger, MergeHeapItem, MergeStats, PartialIndexRun};
pub use meta::IndexMetadata;
pub use radix::radix_sort_entries;
pub use score::{
    DEFAULT_KMER_MATCH_PROB, DEFAULT_MAX_HITS, Hit, LANES, QueryScoreAccumulator, ScoreConfig,
    accumulate_query,
};
pub use stats::{LogFactorialTable, ScoreHistogram, SignificanceModel};
pub use writer::{PICK_WINDOW, SingleSplitIndexWriter, pick_center_kmers};
