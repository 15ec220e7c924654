//! Single-split index writing and representative ("center") k-mer picking.

use tracing::info;

use crate::builder::BuildConfig;
use crate::encode::Alphabet;
use crate::index::{IndexError, KmerEntry, KmerIndexTable};
use crate::io::SectionSink;
use crate::merge::{MergeStats, write_preamble};
use crate::meta::IndexMetadata;

/// Pick offsets are clamped to the first `PICK_WINDOW` entries of a group.
pub const PICK_WINDOW: usize = 10;

/// Collapse every run of entries sharing a k-mer (strand ignored) to one
/// representative at `pick_offset` within the run, clamped to the run.
///
/// Stops at the first sentinel, which is dropped along with everything after
/// it. Entries are compacted in place and the vector truncated to the
/// survivors, whose count is returned. Applying it twice changes nothing.
pub fn pick_center_kmers(
    entries: &mut Vec<KmerEntry>,
    alphabet: Alphabet,
    pick_offset: usize,
) -> usize {
    let end = entries
        .iter()
        .position(KmerEntry::is_sentinel)
        .unwrap_or(entries.len());

    let mut write_pos = 0;
    let mut group_start = 0;
    while group_start < end {
        let key = alphabet.sort_key(entries[group_start].key);
        let mut group_end = group_start + 1;
        while group_end < end && alphabet.sort_key(entries[group_end].key) == key {
            group_end += 1;
        }
        let window = (group_end - group_start).min(PICK_WINDOW);
        entries[write_pos] = entries[group_start + pick_offset.min(window - 1)];
        write_pos += 1;
        group_start = group_end;
    }
    entries.truncate(write_pos);
    write_pos
}

/// Writes an index from one already-sorted in-memory entry array.
#[derive(Clone, Debug)]
pub struct SingleSplitIndexWriter {
    alphabet: Alphabet,
    k: usize,
    grid_bits: u32,
    segment_bytes: usize,
    pick_offset: usize,
}

impl SingleSplitIndexWriter {
    pub fn new(cfg: &BuildConfig) -> Self {
        SingleSplitIndexWriter {
            alphabet: cfg.alphabet(),
            k: cfg.k(),
            grid_bits: cfg.grid_bits(),
            segment_bytes: cfg.segment_bytes(),
            pick_offset: cfg.pick_offset(),
        }
    }

    /// Reduce `entries` to one representative per k-mer and write the index
    /// sections to `sink`. `entries` must be sorted by the alphabet's key.
    pub fn write<S: SectionSink + ?Sized>(
        &self,
        mut entries: Vec<KmerEntry>,
        meta: &IndexMetadata,
        sink: &mut S,
    ) -> Result<MergeStats, IndexError> {
        let alphabet = self.alphabet;
        let input = entries
            .iter()
            .position(KmerEntry::is_sentinel)
            .unwrap_or(entries.len());
        if let Some(i) = (1..input)
            .find(|&i| alphabet.sort_key(entries[i].key) < alphabet.sort_key(entries[i - 1].key))
        {
            return Err(IndexError::Format(format!(
                "entries are not sorted at position {i}"
            )));
        }

        let kept = pick_center_kmers(&mut entries, alphabet, self.pick_offset);
        info!("Write ENTRIES ({kept} of {input} after center k-mer picking)");

        write_preamble(meta, sink)?;
        let mut table = KmerIndexTable::new(alphabet, self.k, self.grid_bits, self.segment_bytes);
        table.begin(sink)?;
        for e in &entries {
            let kmer = alphabet.unpack(e.key);
            if table.needs_flush(kmer.value) {
                table.flush(sink)?;
            }
            table.add_element_sorted(kmer, e.seq_id, e.pos, e.seq_len);
        }
        table.finish(sink)?;

        Ok(MergeStats {
            runs: 1,
            input_entries: input as u64,
            written_entries: kept as u64,
            distinct_kmers: kept as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::STRAND_BIT;
    use crate::index::{ENTRY_BYTES, IndexEntry};
    use crate::io::{MemorySink, SectionKey};

    fn ids(v: &[KmerEntry]) -> Vec<u32> {
        v.iter().map(|e| e.seq_id).collect()
    }

    #[test]
    fn first_entry_of_each_group_survives() {
        let mut v = vec![
            KmerEntry::new(1, 0, 0, 9),
            KmerEntry::new(1, 1, 0, 9),
            KmerEntry::new(2, 2, 0, 9),
            KmerEntry::new(5, 3, 0, 9),
            KmerEntry::new(5, 4, 0, 9),
            KmerEntry::new(5, 5, 0, 9),
            KmerEntry::sentinel(),
            KmerEntry::new(1, 6, 0, 9),
        ];
        assert_eq!(pick_center_kmers(&mut v, Alphabet::Protein, 0), 3);
        assert_eq!(ids(&v), vec![0, 2, 3]);
    }

    #[test]
    fn leading_sentinel_leaves_nothing() {
        let mut v = vec![KmerEntry::sentinel(), KmerEntry::new(1, 0, 0, 9)];
        assert_eq!(pick_center_kmers(&mut v, Alphabet::Nucleotide, 3), 0);
        assert!(v.is_empty());
    }

    #[test]
    fn pick_offset_is_clamped_to_the_group() {
        let mut v = vec![
            KmerEntry::new(1, 0, 0, 9),
            KmerEntry::new(1, 1, 0, 9),
            KmerEntry::new(1, 2, 0, 9),
            KmerEntry::new(4, 3, 0, 9),
        ];
        pick_center_kmers(&mut v, Alphabet::Protein, 1);
        assert_eq!(ids(&v), vec![1, 3]);

        let mut big: Vec<KmerEntry> = (0..20).map(|i| KmerEntry::new(8, i, 0, 9)).collect();
        pick_center_kmers(&mut big, Alphabet::Protein, 15);
        assert_eq!(ids(&big), vec![PICK_WINDOW as u32 - 1]);
    }

    #[test]
    fn strands_of_one_kmer_form_one_group() {
        let mut v = vec![
            KmerEntry::new(7, 0, 0, 9),
            KmerEntry::new(7 | STRAND_BIT, 1, 0, 9),
            KmerEntry::new(8 | STRAND_BIT, 2, 0, 9),
        ];
        pick_center_kmers(&mut v, Alphabet::Nucleotide, 0);
        assert_eq!(ids(&v), vec![0, 2]);
    }

    #[test]
    fn picking_is_idempotent() {
        let mut v: Vec<KmerEntry> = [3u64, 3, 3, 4, 9, 9]
            .iter()
            .enumerate()
            .map(|(i, &k)| KmerEntry::new(k, i as u32, 0, 9))
            .collect();
        pick_center_kmers(&mut v, Alphabet::Protein, 2);
        let once = v.clone();
        pick_center_kmers(&mut v, Alphabet::Protein, 2);
        assert_eq!(v, once);
    }

    #[test]
    fn single_split_writes_reduced_entries() {
        let cfg = BuildConfig::new(Alphabet::Nucleotide, 4);
        let entries = vec![
            KmerEntry::new(2 | STRAND_BIT, 0, 3, 20),
            KmerEntry::new(2, 1, 5, 21),
            KmerEntry::new(6, 1, 0, 21),
            KmerEntry::sentinel(),
        ];
        let mut sink = MemorySink::default();
        let stats = SingleSplitIndexWriter::new(&cfg)
            .write(entries, &IndexMetadata::new(Alphabet::Nucleotide, 4), &mut sink)
            .unwrap();
        assert_eq!(stats.input_entries, 3);
        assert_eq!(stats.written_entries, 2);

        let bytes = sink.section(SectionKey::Entries).unwrap();
        let written: Vec<IndexEntry> = bytes
            .chunks_exact(ENTRY_BYTES)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!((written[0].kmer, written[0].seq_id, written[0].pos), (2, 0, 3));
        assert!(!written[0].strand().is_reverse());
        assert!(written[1].strand().is_reverse());
    }

    #[test]
    fn unsorted_input_is_rejected() {
        let cfg = BuildConfig::new(Alphabet::Protein, 3);
        let entries = vec![KmerEntry::new(5, 0, 0, 9), KmerEntry::new(1, 0, 1, 9)];
        let mut sink = MemorySink::default();
        assert!(
            SingleSplitIndexWriter::new(&cfg)
                .write(entries, &IndexMetadata::new(Alphabet::Protein, 3), &mut sink)
                .is_err()
        );
    }
}
