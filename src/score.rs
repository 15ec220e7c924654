//! Per-query score accumulation and hit extraction.
//!
//! Each database sequence owns one 16-bit slot: raw score in the high byte,
//! latest diagonal hint in the low byte. Extraction scans the slots in
//! fixed-width lane chunks, zeroing each chunk as it goes, so a finished query
//! leaves nothing behind for the next one.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::index::{IndexError, KmerIndexReader};
use crate::stats::{LogFactorialTable, SCORE_RANGE, ScoreHistogram, SignificanceModel};

/// Slots processed per vector step (128-bit register of u16).
pub const LANES: usize = 8;

pub const DEFAULT_KMER_MATCH_PROB: f64 = 1e-4;
pub const DEFAULT_MAX_HITS: usize = 150_000;

/// One prefilter candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub seq_id: u32,
    pub raw_score: u16,
    /// Negated log-probability: larger is more significant.
    pub z_score: f64,
}

/// Descending significance, then descending raw score, then ascending id.
fn compare_hits(a: &Hit, b: &Hit) -> Ordering {
    b.z_score
        .total_cmp(&a.z_score)
        .then(b.raw_score.cmp(&a.raw_score))
        .then(a.seq_id.cmp(&b.seq_id))
}

/// Scoring configuration.
#[derive(Clone, Debug)]
pub struct ScoreConfig {
    kmer_match_prob: f64,
    max_hits: usize,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            kmer_match_prob: DEFAULT_KMER_MATCH_PROB,
            max_hits: DEFAULT_MAX_HITS,
        }
    }
}

impl ScoreConfig {
    /// Per-position probability of a chance k-mer match.
    pub fn kmer_match_prob(mut self, p: f64) -> Self {
        self.kmer_match_prob = p;
        self
    }
    /// Hard cap on the hit list length (forced id included).
    pub fn max_hits(mut self, n: usize) -> Self {
        self.max_hits = n;
        self
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if !(self.kmer_match_prob > 0.0 && self.kmer_match_prob < 1.0) {
            return Err(IndexError::Config(format!(
                "k-mer match probability must be in (0, 1), got {}",
                self.kmer_match_prob
            )));
        }
        if self.max_hits == 0 {
            return Err(IndexError::Config("max hits must be at least 1".into()));
        }
        Ok(())
    }
}

/// Raw score accumulator for one query at a time.
pub struct QueryScoreAccumulator {
    slots: Vec<u16>,
    seq_lens: Arc<[u32]>,
    model: SignificanceModel,
    histogram: ScoreHistogram,
    hits: Vec<Hit>,
    max_hits: usize,
    num_matches: u64,
}

impl QueryScoreAccumulator {
    /// One slot per entry of `seq_lens`. The sequence lengths and the
    /// log-factorial table are shared read-only between accumulators.
    pub fn new(
        seq_lens: Arc<[u32]>,
        log_factorial: Arc<LogFactorialTable>,
        cfg: &ScoreConfig,
    ) -> Result<Self, IndexError> {
        cfg.validate()?;
        let padded = seq_lens.len().div_ceil(LANES) * LANES;
        Ok(QueryScoreAccumulator {
            slots: vec![0u16; padded],
            model: SignificanceModel::new(cfg.kmer_match_prob, log_factorial),
            seq_lens,
            histogram: ScoreHistogram::new(),
            hits: Vec::with_capacity(cfg.max_hits.min(1 << 16)),
            max_hits: cfg.max_hits,
            num_matches: 0,
        })
    }

    pub fn db_size(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn num_matches(&self) -> u64 {
        self.num_matches
    }

    pub fn model(&self) -> &SignificanceModel {
        &self.model
    }

    /// Record a match event. The score saturates at 255.
    ///
    /// # Panics
    ///
    /// If `seq_id` is not below [`db_size`](Self::db_size). Lane padding
    /// past the database is not addressable.
    #[inline]
    pub fn add_match(&mut self, seq_id: u32, diagonal: u8, increment: u8) {
        assert!(
            (seq_id as usize) < self.db_size(),
            "sequence id {seq_id} outside database of {}",
            self.db_size()
        );
        let slot = &mut self.slots[seq_id as usize];
        let score = ((*slot >> 8) as u8).saturating_add(increment);
        *slot = (u16::from(score) << 8) | u16::from(diagonal);
        self.num_matches += 1;
    }

    #[inline]
    pub fn raw_score(&self, seq_id: u32) -> u8 {
        (self.slots[seq_id as usize] >> 8) as u8
    }

    #[inline]
    pub fn diagonal_hint(&self, seq_id: u32) -> u8 {
        self.slots[seq_id as usize] as u8
    }

    /// Zero every slot, the histogram and the match counter.
    pub fn reset(&mut self) {
        self.slots.fill(0);
        self.histogram.clear();
        self.num_matches = 0;
    }

    /// Add the current raw score of every sequence to the histogram. Call
    /// before [`get_result`](Self::get_result), which clears the slots.
    pub fn update_score_bins(&mut self) {
        let db_size = self.db_size();
        for &slot in &self.slots[..db_size] {
            self.histogram.add((slot >> 8) as u8);
        }
    }

    /// Minimum score that keeps roughly `max_hits_per_query` candidates.
    pub fn compute_score_threshold(&self, max_hits_per_query: usize) -> u32 {
        self.histogram.compute_score_threshold(max_hits_per_query)
    }

    pub fn histogram(&self) -> &ScoreHistogram {
        &self.histogram
    }

    /// Extract all sequences scoring at least `score_threshold`, ranked by
    /// significance, and clear every slot.
    ///
    /// A valid `forced_seq_id` always occupies slot 0 of the result whatever
    /// its score. The list is cut at the configured capacity without error.
    pub fn get_result(
        &mut self,
        query_len: u32,
        score_threshold: u32,
        forced_seq_id: Option<u32>,
    ) -> &[Hit] {
        // comparisons below are strict
        let thr = if score_threshold == 0 {
            0
        } else {
            score_threshold - 1
        };
        let thr = thr.min(SCORE_RANGE as u32 - 1) as u16;

        let db_size = self.db_size();
        let forced = forced_seq_id.filter(|&id| {
            let ok = (id as usize) < db_size;
            if !ok {
                warn!("forced sequence id {id} outside database of {db_size}; ignored");
            }
            ok
        });
        let forced_raw = forced.map(|id| self.raw_score(id));

        self.hits.clear();
        if forced.is_some() {
            // placeholder, filled after the scan
            self.hits.push(Hit {
                seq_id: 0,
                raw_score: 0,
                z_score: 0.0,
            });
        }

        let num_chunks = self.slots.len() / LANES;
        let mut full = self.hits.len() >= self.max_hits;
        let mut cleared_to = 0;
        if !full {
            'scan: for c in 0..num_chunks {
                let base = c * LANES;
                let (scores, mut mask) = lanes::scan_chunk(&mut self.slots[base..base + LANES], thr);
                cleared_to = base + LANES;
                while mask != 0 {
                    let lane = mask.trailing_zeros() as usize;
                    mask &= mask - 1;
                    let seq_id = (base + lane) as u32;
                    if Some(seq_id) == forced || base + lane >= db_size {
                        continue;
                    }
                    let raw_score = scores[lane];
                    self.hits.push(Hit {
                        seq_id,
                        raw_score,
                        z_score: -self
                            .model
                            .log_probability(raw_score, self.seq_lens[seq_id as usize]),
                    });
                    if self.hits.len() >= self.max_hits {
                        full = true;
                        break 'scan;
                    }
                }
            }
        }
        if full {
            // no residue for the next query
            self.slots[cleared_to..].fill(0);
        }

        match (forced, forced_raw) {
            (Some(id), Some(raw)) => {
                let raw_score = u16::from(raw.max(1));
                self.hits[0] = Hit {
                    seq_id: id,
                    raw_score,
                    z_score: -self
                        .model
                        .log_probability(raw_score, self.seq_lens[id as usize]),
                };
                self.hits[1..].sort_unstable_by(compare_hits);
            }
            _ => self.hits.sort_unstable_by(compare_hits),
        }
        debug!(
            query_len,
            threshold = score_threshold,
            hits = self.hits.len(),
            truncated = full,
            "prefilter result"
        );
        &self.hits
    }
}

/// Feed index matches for the `(query_pos, kmer)` pairs of one query into
/// `acc`. Each matching entry adds 1 to its sequence, with the diagonal
/// `query_pos - target_pos` kept as hint. Returns the number of events.
pub fn accumulate_query(
    reader: &KmerIndexReader,
    query_kmers: &[(u32, u64)],
    acc: &mut QueryScoreAccumulator,
) -> Result<u64, IndexError> {
    let mut events = 0u64;
    for &(query_pos, kmer) in query_kmers {
        for e in reader.lookup(kmer)? {
            if (e.seq_id as usize) < acc.db_size() {
                acc.add_match(e.seq_id, query_pos.wrapping_sub(e.pos) as u8, 1);
                events += 1;
            }
        }
    }
    Ok(events)
}

mod lanes {
    use super::LANES;

    /// Shift the score byte down, compare with `thr`, zero the storage.
    /// Returns the scores and a bitmask of lanes with score > `thr`.
    #[cfg(not(all(feature = "simd_x86", target_arch = "x86_64")))]
    #[inline]
    pub(super) fn scan_chunk(chunk: &mut [u16], thr: u16) -> ([u16; LANES], u32) {
        let mut scores = [0u16; LANES];
        let mut mask = 0u32;
        for (i, slot) in chunk.iter_mut().enumerate() {
            let s = *slot >> 8;
            scores[i] = s;
            mask |= u32::from(s > thr) << i;
            *slot = 0;
        }
        (scores, mask)
    }

    #[cfg(all(feature = "simd_x86", target_arch = "x86_64"))]
    #[inline]
    pub(super) fn scan_chunk(chunk: &mut [u16], thr: u16) -> ([u16; LANES], u32) {
        use std::arch::x86_64::*;

        assert_eq!(chunk.len(), LANES);
        let mut scores = [0u16; LANES];
        // SAFETY: SSE2 is part of the x86_64 baseline and `chunk` holds
        // exactly one 128-bit register of u16.
        let byte_mask = unsafe {
            let p = chunk.as_mut_ptr() as *mut __m128i;
            let v = _mm_srli_epi16::<8>(_mm_loadu_si128(p));
            let gt = _mm_cmpgt_epi16(v, _mm_set1_epi16(thr as i16));
            _mm_storeu_si128(scores.as_mut_ptr() as *mut __m128i, v);
            _mm_storeu_si128(p, _mm_setzero_si128());
            _mm_movemask_epi8(gt) as u32
        };
        // movemask yields two bits per 16-bit lane
        let mut mask = 0u32;
        for i in 0..LANES {
            mask |= ((byte_mask >> (2 * i)) & 1) << i;
        }
        (scores, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator(db_size: usize, max_hits: usize) -> QueryScoreAccumulator {
        let lens: Arc<[u32]> = (0..db_size).map(|i| 100 + i as u32).collect();
        QueryScoreAccumulator::new(
            lens,
            Arc::new(LogFactorialTable::new()),
            &ScoreConfig::default().kmer_match_prob(1e-3).max_hits(max_hits),
        )
        .unwrap()
    }

    #[test]
    fn slots_pack_score_and_diagonal() {
        let mut acc = accumulator(3, 10);
        acc.add_match(1, 17, 2);
        acc.add_match(1, 42, 3);
        assert_eq!(acc.raw_score(1), 5);
        assert_eq!(acc.diagonal_hint(1), 42);
        acc.add_match(2, 0, 250);
        acc.add_match(2, 0, 250);
        assert_eq!(acc.raw_score(2), 255);
        assert_eq!(acc.num_matches(), 4);
    }

    #[test]
    #[should_panic(expected = "outside database")]
    fn match_in_lane_padding_panics() {
        // 9 sequences pad to 16 slots
        let mut acc = accumulator(9, 10);
        acc.add_match(12, 0, 1);
    }

    #[test]
    #[should_panic(expected = "outside database")]
    fn match_past_the_slots_panics() {
        let mut acc = accumulator(9, 10);
        acc.add_match(400, 0, 1);
    }

    #[test]
    fn empty_query_yields_no_hits() {
        let mut acc = accumulator(20, 10);
        acc.reset();
        assert!(acc.get_result(50, 1, None).is_empty());
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut acc = accumulator(20, 10);
        acc.add_match(3, 0, 2);
        acc.add_match(4, 0, 3);
        acc.add_match(5, 0, 1);
        let ids: Vec<u32> = acc.get_result(50, 2, None).iter().map(|h| h.seq_id).collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[test]
    fn zero_threshold_still_skips_unscored() {
        let mut acc = accumulator(9, 100);
        acc.add_match(8, 0, 1);
        let hits = acc.get_result(10, 0, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq_id, 8);
    }

    #[test]
    fn hits_are_ranked_by_significance() {
        let mut acc = accumulator(16, 10);
        for (id, score) in [(0u32, 3u8), (9, 10), (15, 6)] {
            acc.add_match(id, 0, score);
        }
        let hits = acc.get_result(50, 1, None).to_vec();
        let ids: Vec<u32> = hits.iter().map(|h| h.seq_id).collect();
        assert_eq!(ids, vec![9, 15, 0]);
        assert!(hits.windows(2).all(|w| w[0].z_score >= w[1].z_score));
    }

    #[test]
    fn forced_id_takes_slot_zero_with_coerced_score() {
        let mut acc = accumulator(16, 10);
        acc.add_match(2, 0, 9);
        acc.add_match(11, 0, 4);
        let hits = acc.get_result(50, 3, Some(7)).to_vec();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].seq_id, 7);
        assert_eq!(hits[0].raw_score, 1);
        assert!(hits[0].z_score.is_finite());
        assert_eq!(hits[1].seq_id, 2);
        assert_eq!(hits[2].seq_id, 11);
    }

    #[test]
    fn forced_id_is_not_listed_twice() {
        let mut acc = accumulator(16, 10);
        acc.add_match(7, 0, 12);
        acc.add_match(1, 0, 30);
        let hits = acc.get_result(50, 1, Some(7)).to_vec();
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].seq_id, hits[0].raw_score), (7, 12));
        assert_eq!(hits[1].seq_id, 1);
    }

    #[test]
    fn out_of_range_forced_id_is_ignored() {
        let mut acc = accumulator(4, 10);
        acc.add_match(1, 0, 2);
        let hits = acc.get_result(50, 1, Some(99));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq_id, 1);
    }

    #[test]
    fn capacity_truncates_and_still_clears() {
        let mut acc = accumulator(100, 10);
        for id in 0..100 {
            acc.add_match(id, 0, 5);
        }
        assert_eq!(acc.get_result(50, 1, None).len(), 10);
        assert!((0..100).all(|id| acc.raw_score(id) == 0));
        // no reset in between
        assert!(acc.get_result(50, 1, None).is_empty());
    }

    #[test]
    fn capacity_counts_the_forced_slot() {
        let mut acc = accumulator(32, 1);
        for id in 0..32 {
            acc.add_match(id, 0, 5);
        }
        let hits = acc.get_result(50, 1, Some(3)).to_vec();
        assert_eq!(hits.len(), 1);
        assert_eq!((hits[0].seq_id, hits[0].raw_score), (3, 5));
        assert!((0..32).all(|id| acc.raw_score(id) == 0));
    }

    #[test]
    fn score_bins_feed_the_threshold() {
        let mut acc = accumulator(16, 10);
        for (id, score) in [(0u32, 1u8), (1, 1), (2, 2), (3, 4)] {
            acc.add_match(id, 0, score);
        }
        acc.update_score_bins();
        assert_eq!(acc.histogram().count(0), 12);
        assert_eq!(acc.compute_score_threshold(2), 2);
        acc.reset();
        assert_eq!(acc.histogram().count(1), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let lens: Arc<[u32]> = Arc::from(vec![10u32; 4]);
        let table = Arc::new(LogFactorialTable::new());
        assert!(
            QueryScoreAccumulator::new(
                lens.clone(),
                table.clone(),
                &ScoreConfig::default().kmer_match_prob(0.0)
            )
            .is_err()
        );
        assert!(
            QueryScoreAccumulator::new(lens, table, &ScoreConfig::default().max_hits(0)).is_err()
        );
    }
}
