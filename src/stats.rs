//! Poisson-tail significance of raw k-mer match counts, and the score
//! histogram used to adapt the per-query threshold.

use std::sync::Arc;

/// Number of representable raw scores (one byte per lane).
pub const SCORE_RANGE: usize = 256;

/// `ln(s!)` for every representable raw score, by Stirling's approximation
/// `sqrt(2πs)·(s/e)^s·e^(1/12s)`. Evaluated in log space so large scores stay
/// finite.
#[derive(Clone, Debug)]
pub struct LogFactorialTable {
    values: Box<[f64]>,
}

impl LogFactorialTable {
    pub fn new() -> Self {
        let values = (0..SCORE_RANGE)
            .map(|s| {
                if s == 0 {
                    0.0
                } else {
                    let s = s as f64;
                    0.5 * (2.0 * std::f64::consts::PI * s).ln() + s * (s.ln() - 1.0)
                        + 1.0 / (12.0 * s)
                }
            })
            .collect();
        LogFactorialTable { values }
    }

    /// Scores above the table range read the last entry.
    #[inline]
    pub fn get(&self, score: u16) -> f64 {
        self.values[(score as usize).min(SCORE_RANGE - 1)]
    }
}

impl Default for LogFactorialTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Null model: independent k-mer matches with per-position probability `p`.
#[derive(Clone, Debug)]
pub struct SignificanceModel {
    match_prob: f64,
    log_match_prob: f64,
    log_factorial: Arc<LogFactorialTable>,
}

impl SignificanceModel {
    pub fn new(match_prob: f64, log_factorial: Arc<LogFactorialTable>) -> Self {
        SignificanceModel {
            match_prob,
            log_match_prob: match_prob.ln(),
            log_factorial,
        }
    }

    pub fn match_prob(&self) -> f64 {
        self.match_prob
    }

    /// Approximate log-probability of observing `raw_score` or more matches
    /// against a sequence of `db_seq_len` residues. More negative is more
    /// significant.
    #[inline]
    pub fn log_probability(&self, raw_score: u16, db_seq_len: u32) -> f64 {
        let score = f64::from(raw_score);
        let len = f64::from(db_seq_len.max(1));
        let mu = self.match_prob * len;
        let mid_term = score * (self.log_match_prob + len.ln());
        // smoothed -mu, finite at score 0
        let first_term = -(mu * score / (score + 1.0));
        first_term + mid_term - self.log_factorial.get(raw_score)
    }
}

/// Frequency of each exact raw score over all database sequences.
#[derive(Clone, Debug)]
pub struct ScoreHistogram {
    bins: Box<[u64]>,
}

impl ScoreHistogram {
    pub fn new() -> Self {
        ScoreHistogram {
            bins: vec![0u64; SCORE_RANGE].into_boxed_slice(),
        }
    }

    pub fn clear(&mut self) {
        self.bins.fill(0);
    }

    #[inline]
    pub fn add(&mut self, score: u8) {
        self.bins[score as usize] += 1;
    }

    pub fn count(&self, score: u8) -> u64 {
        self.bins[score as usize]
    }

    /// Walk from the highest score down, accumulating counts, and return the
    /// first score at which the total reaches `max_hits_per_query`. Returns 0
    /// when the whole histogram holds fewer hits.
    pub fn compute_score_threshold(&self, max_hits_per_query: usize) -> u32 {
        let mut found = 0u64;
        let mut thr = SCORE_RANGE - 1;
        while thr > 0 {
            found += self.bins[thr];
            if found >= max_hits_per_query as u64 {
                break;
            }
            thr -= 1;
        }
        thr as u32
    }
}

impl Default for ScoreHistogram {
    fn default() -> Self {
        Self::new()
    }
}
