//! In-place LSD radix sort of k-mer entries by their alphabet sort key.
//! 8-bit passes, only as many as the largest key needs. Stable via counting +
//! prefix sums, so entries sharing a k-mer keep their extraction order.

use crate::encode::Alphabet;
use crate::index::KmerEntry;

/// Sort `entries` ascending by `alphabet.sort_key(entry.key)`.
/// The scratch buffer is allocated once and reused across passes.
pub fn radix_sort_entries(entries: &mut [KmerEntry], alphabet: Alphabet) {
    let n = entries.len();
    if n <= 1 {
        return;
    }

    let max_key = entries
        .iter()
        .map(|e| alphabet.sort_key(e.key))
        .max()
        .unwrap_or(0);
    let passes = (64 - max_key.leading_zeros()).div_ceil(8);

    let mut tmp = vec![KmerEntry::default(); n];

    for pass in 0..passes {
        let shift = pass * 8;
        let mut counts = [0usize; 256];

        for e in entries.iter() {
            let byte = ((alphabet.sort_key(e.key) >> shift) & 0xFF) as usize;
            counts[byte] += 1;
        }

        let mut sum = 0usize;
        for c in counts.iter_mut() {
            let tmp = *c;
            *c = sum;
            sum += tmp;
        }

        for e in entries.iter() {
            let b = ((alphabet.sort_key(e.key) >> shift) & 0xFF) as usize;
            tmp[counts[b]] = *e;
            counts[b] += 1;
        }

        entries.copy_from_slice(&tmp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::STRAND_BIT;

    #[test]
    fn sorts_by_key_and_keeps_ties_stable() {
        let mut v = vec![
            KmerEntry::new(300, 0, 0, 9),
            KmerEntry::new(5, 1, 0, 9),
            KmerEntry::new(300, 2, 0, 9),
            KmerEntry::new(70_000, 3, 0, 9),
            KmerEntry::new(5, 4, 0, 9),
        ];
        radix_sort_entries(&mut v, Alphabet::Protein);
        let ids: Vec<u32> = v.iter().map(|e| e.seq_id).collect();
        assert_eq!(ids, vec![1, 4, 0, 2, 3]);
    }

    #[test]
    fn nucleotide_sort_ignores_strand_bit() {
        let mut v = vec![
            KmerEntry::new(9 | STRAND_BIT, 0, 0, 9),
            KmerEntry::new(3, 1, 0, 9),
            KmerEntry::new(9, 2, 0, 9),
            KmerEntry::new(1 | STRAND_BIT, 3, 0, 9),
        ];
        radix_sort_entries(&mut v, Alphabet::Nucleotide);
        let ids: Vec<u32> = v.iter().map(|e| e.seq_id).collect();
        assert_eq!(ids, vec![3, 1, 0, 2]);
    }
}
