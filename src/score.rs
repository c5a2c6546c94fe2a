//! Bayesian scoring
//!
//! Computes the probability that a message is spam from its token stream
//! and a read-only store snapshot: collapse duplicates, estimate a per-term
//! probability from the class counts, select the strongest discriminators,
//! and combine them Robinson-style in log space. For the same store state,
//! configuration, and message bytes the score is bit-identical across
//! platforms: IEEE-754 doubles, a total sort order, and a fixed traversal
//! order for the log-space accumulation.

use std::collections::{BTreeSet, HashMap};

use crate::config::ProbeConfig;
use crate::errors::ProbeResult;
use crate::store::{CorpusCounters, TermRecord, TermStore};
use crate::tokenize::Term;

/// One selected discriminator and its contribution
#[derive(Debug, Clone, PartialEq)]
pub struct TermScore {
    /// The full `prefix/lexeme` term
    pub term: String,
    /// Per-term spam probability after weighting and clamping
    pub probability: f64,
    /// Stored good count at scoring time
    pub good_count: u32,
    /// Stored spam count at scoring time
    pub spam_count: u32,
}

impl TermScore {
    fn deviation(&self) -> f64 {
        (self.probability - 0.5).abs()
    }

    fn total(&self) -> u64 {
        u64::from(self.good_count) + u64::from(self.spam_count)
    }
}

/// Scoring result
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    /// Combined spam probability in [0, 1]
    pub score: f64,
    /// Distinct terms seen in the message
    pub distinct_terms: usize,
    /// Selected discriminators, strongest first
    pub terms_considered: Vec<TermScore>,
}

/// Score a token stream against a store snapshot
///
/// Duplicate terms collapse to one vote; all record lookups for the message
/// go through one batched [`TermStore::get_many`] call.
pub fn score_stream<I>(
    stream: I,
    store: &TermStore,
    config: &ProbeConfig,
) -> ProbeResult<ScoreOutcome>
where
    I: IntoIterator<Item = Term>,
{
    let distinct: BTreeSet<String> = stream.into_iter().map(Term::into_string).collect();
    let records = store.get_many(distinct.iter().map(String::as_str))?;
    let counters = store.counters()?;
    Ok(score_terms(&distinct, &records, counters, config))
}

/// Pure scoring core over already-fetched records
pub(crate) fn score_terms(
    distinct: &BTreeSet<String>,
    records: &HashMap<String, TermRecord>,
    counters: CorpusCounters,
    config: &ProbeConfig,
) -> ScoreOutcome {
    let mut candidates: Vec<TermScore> = distinct
        .iter()
        .map(|term| {
            let record = records.get(term).copied().unwrap_or_default();
            TermScore {
                term: term.clone(),
                probability: term_probability(record, counters, config),
                good_count: record.good_count,
                spam_count: record.spam_count,
            }
        })
        .collect();

    // Selection: strongest deviation wins; ties fall to the better-attested
    // term, then to the term string for a total order.
    candidates.retain(|candidate| candidate.deviation() >= config.min_deviation);
    candidates.sort_by(|a, b| {
        b.deviation()
            .total_cmp(&a.deviation())
            .then_with(|| b.total().cmp(&a.total()))
            .then_with(|| a.term.cmp(&b.term))
    });
    candidates.truncate(config.max_discriminators);

    let score = if candidates.is_empty() {
        config.default_prob
    } else {
        combine(candidates.iter().map(|candidate| candidate.probability))
    };
    ScoreOutcome {
        score: score.clamp(0.0, 1.0),
        distinct_terms: distinct.len(),
        terms_considered: candidates,
    }
}

/// Per-term spam probability
///
/// Weighted class frequencies are normalized by the corpus counters and
/// clamped into `[min_prob, max_prob]`. Terms with fewer than
/// `min_token_count` total sightings get `default_prob`.
pub(crate) fn term_probability(
    record: TermRecord,
    counters: CorpusCounters,
    config: &ProbeConfig,
) -> f64 {
    if record.total() < u64::from(config.min_token_count) {
        return config.default_prob;
    }
    let weighted_spam = f64::from(record.spam_count) * f64::from(config.terms_for_spam);
    let weighted_good = f64::from(record.good_count) * f64::from(config.terms_for_good);
    let spam_ratio = (weighted_spam / counters.spam.max(1) as f64).min(1.0);
    let good_ratio = (weighted_good / counters.good.max(1) as f64).min(1.0);
    if spam_ratio + good_ratio == 0.0 {
        return config.default_prob;
    }
    (spam_ratio / (spam_ratio + good_ratio)).clamp(config.min_prob, config.max_prob)
}

/// Robinson combination in log space
///
/// `score = P / (P + Q)` with `P = prod(p)` and `Q = prod(1 - p)`, computed
/// as `1 / (1 + exp(ln Q - ln P))` so long streaks of extreme tokens cannot
/// underflow.
fn combine<I: Iterator<Item = f64>>(probabilities: I) -> f64 {
    let mut ln_p = 0.0_f64;
    let mut ln_q = 0.0_f64;
    for p in probabilities {
        let p = p.clamp(f64::EPSILON, 1.0 - f64::EPSILON);
        ln_p += p.ln();
        ln_q += (1.0 - p).ln();
    }
    1.0 / (1.0 + (ln_q - ln_p).exp())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use super::{combine, score_terms, term_probability};
    use crate::config::ProbeConfig;
    use crate::store::{CorpusCounters, TermRecord};

    fn record(good: u32, spam: u32) -> TermRecord {
        TermRecord {
            good_count: good,
            spam_count: spam,
            last_seen_days: 0,
        }
    }

    fn corpus(good: u64, spam: u64) -> CorpusCounters {
        CorpusCounters { good, spam }
    }

    fn terms(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[test]
    fn spam_only_terms_score_near_max() {
        let config = ProbeConfig::default();
        let p = term_probability(record(0, 50), corpus(100, 100), &config);
        assert_eq!(p, config.max_prob);
    }

    #[test]
    fn good_weighting_biases_against_false_positives() {
        let config = ProbeConfig::default();
        // Equal raw counts, but good counts are doubled by terms_for_good.
        let p = term_probability(record(10, 10), corpus(100, 100), &config);
        assert!(p < 0.5, "good weighting should pull {p} below 0.5");
    }

    #[test]
    fn low_count_terms_fall_back_to_default_prob() {
        let config = ProbeConfig::default();
        let p = term_probability(record(1, 2), corpus(100, 100), &config);
        assert_eq!(p, config.default_prob);
    }

    #[test]
    fn default_prob_terms_miss_the_deviation_cut() {
        let config = ProbeConfig::default();
        // All terms unknown: nothing survives selection, so the score is
        // exactly default_prob rather than a combination of 0.4s.
        let outcome = score_terms(
            &terms(&["body/alpha", "body/beta"]),
            &HashMap::new(),
            corpus(0, 0),
            &config,
        );
        assert!(outcome.terms_considered.is_empty());
        assert_eq!(outcome.score, config.default_prob);
    }

    #[test]
    fn strong_spam_vocabulary_dominates_the_score() {
        let config = ProbeConfig::default();
        let mut records = HashMap::new();
        for name in ["body/pills", "body/cheap", "body/winner"] {
            records.insert(name.to_owned(), record(0, 40));
        }
        let outcome = score_terms(
            &terms(&["body/pills", "body/cheap", "body/winner"]),
            &records,
            corpus(100, 100),
            &config,
        );
        assert!(outcome.score > 0.99, "score was {}", outcome.score);

        let mut records = HashMap::new();
        for name in ["body/meeting", "body/agenda", "body/thanks"] {
            records.insert(name.to_owned(), record(40, 0));
        }
        let outcome = score_terms(
            &terms(&["body/meeting", "body/agenda", "body/thanks"]),
            &records,
            corpus(100, 100),
            &config,
        );
        assert!(outcome.score < 0.01, "score was {}", outcome.score);
    }

    #[test]
    fn duplicate_terms_collapse_to_one_vote() {
        // BTreeSet input models the collapse; a term listed once scores the
        // same as the message repeating it a hundred times.
        let config = ProbeConfig::default();
        let mut records = HashMap::new();
        records.insert("body/offer".to_owned(), record(0, 20));
        let outcome = score_terms(&terms(&["body/offer"]), &records, corpus(50, 50), &config);
        assert_eq!(outcome.terms_considered.len(), 1);
        assert_eq!(outcome.distinct_terms, 1);
    }

    #[test]
    fn selection_caps_at_max_discriminators_with_total_order() {
        let mut config = ProbeConfig::default();
        config.max_discriminators = 3;
        let mut records = HashMap::new();
        let names: Vec<String> = (0..10).map(|i| format!("body/term{i:02}")).collect();
        for name in &names {
            records.insert(name.clone(), record(0, 30));
        }
        let distinct: BTreeSet<String> = names.iter().cloned().collect();
        let outcome = score_terms(&distinct, &records, corpus(100, 100), &config);
        assert_eq!(outcome.terms_considered.len(), 3);
        // Identical strength everywhere, so the lexicographic tiebreak picks
        // the first three terms deterministically.
        let picked: Vec<&str> = outcome
            .terms_considered
            .iter()
            .map(|t| t.term.as_str())
            .collect();
        assert_eq!(picked, vec!["body/term00", "body/term01", "body/term02"]);
    }

    #[test]
    fn scores_stay_in_bounds_under_extreme_streaks() {
        assert_eq!(combine(std::iter::repeat_n(0.9999, 500)), 1.0);
        assert_eq!(combine(std::iter::repeat_n(0.0001, 500)), 0.0);
        let mixed = combine([0.9, 0.2, 0.7, 0.4].into_iter());
        assert!((0.0..=1.0).contains(&mixed));
    }

    #[test]
    fn scoring_is_deterministic_bit_for_bit() {
        let config = ProbeConfig::default();
        let mut records = HashMap::new();
        records.insert("body/one".to_owned(), record(3, 9));
        records.insert("body/two".to_owned(), record(7, 2));
        records.insert("h.subj/three".to_owned(), record(0, 12));
        let distinct = terms(&["body/one", "body/two", "h.subj/three"]);
        let a = score_terms(&distinct, &records, corpus(40, 40), &config);
        let b = score_terms(&distinct, &records, corpus(40, 40), &config);
        assert_eq!(a.score.to_bits(), b.score.to_bits());
    }

    #[test]
    fn more_spam_evidence_never_lowers_the_score() {
        let config = ProbeConfig::default();
        let distinct = terms(&["body/offer", "body/click"]);
        let mut records = HashMap::new();
        records.insert("body/offer".to_owned(), record(2, 30));
        records.insert("body/click".to_owned(), record(2, 30));
        let before = score_terms(&distinct, &records, corpus(100, 100), &config);

        // One more spam training example containing exactly these terms.
        for rec in records.values_mut() {
            rec.spam_count += 1;
        }
        let after = score_terms(&distinct, &records, corpus(100, 101), &config);
        assert!(after.score >= before.score);
    }
}
