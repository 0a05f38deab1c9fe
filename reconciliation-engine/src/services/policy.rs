//! Rule-based classification policy and the deterministic classifier used
//! whenever the oracle is disabled, unreachable or silent about a record.

use crate::config::MatchingConfig;
use crate::models::{
    Bucket, CandidatePair, RecordRef, Side, TransactionRecord, Verdict, VerdictSource,
};
use crate::services::candidates::CandidateSet;
use crate::services::chunking::Chunk;
use std::cmp::Ordering;
use std::collections::HashSet;

pub const REASON_NO_CANDIDATE: &str = "No counterpart within date and amount tolerance";
pub const REASON_PARTNER_TAKEN: &str =
    "Every counterpart within tolerance was matched to another record";

#[derive(Debug, Clone)]
pub struct MatchPolicy {
    narration_threshold: f64,
}

impl MatchPolicy {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            narration_threshold: config.narration_threshold,
        }
    }

    pub fn narration_threshold(&self) -> f64 {
        self.narration_threshold
    }

    /// Green when the narrations agree, Yellow otherwise. The pair is
    /// already known to sit inside the date and amount tolerances.
    pub fn grade(&self, pair: &CandidatePair) -> Bucket {
        if pair.narration_similarity >= self.narration_threshold {
            Bucket::Green
        } else {
            Bucket::Yellow
        }
    }

    /// Human-readable description of what differs between a matched pair.
    pub fn adjustment_note(
        &self,
        pair: &CandidatePair,
        bank: &TransactionRecord,
        book: &TransactionRecord,
    ) -> String {
        let mut parts = Vec::new();

        let diff = bank.amount.checked_sub(book.amount);
        if let Some(diff) = diff.filter(|d| !d.is_zero()) {
            parts.push(format!(
                "Adjust book amount by {} to {} to agree with the bank",
                diff, bank.amount
            ));
        }
        if pair.narration_similarity < self.narration_threshold {
            parts.push(format!(
                "Narrations differ (similarity {:.2}): bank \"{}\" vs book \"{}\"",
                pair.narration_similarity, bank.narration, book.narration
            ));
        }
        if pair.date_delta_days != 0 {
            parts.push(format!(
                "Book dated {} vs bank {} ({:+} days)",
                book.date, bank.date, pair.date_delta_days
            ));
        }

        if parts.is_empty() {
            "Confirm match manually".to_string()
        } else {
            parts.join("; ")
        }
    }

    /// Build the verdict for a pair graded by rules alone.
    pub fn verdict_for(
        &self,
        pair: &CandidatePair,
        bank: &TransactionRecord,
        book: &TransactionRecord,
    ) -> Verdict {
        match self.grade(pair) {
            Bucket::Green => {
                let diff = bank.amount.checked_sub(book.amount);
                Verdict::Green {
                    pair: pair.clone(),
                    source: VerdictSource::Deterministic,
                    note: diff
                        .filter(|d| !d.is_zero())
                        .map(|d| format!("Rounding difference of {}", d)),
                }
            }
            _ => Verdict::Yellow {
                pair: pair.clone(),
                adjustment: self.adjustment_note(pair, bank, book),
                source: VerdictSource::Deterministic,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeterministicClassifier {
    policy: MatchPolicy,
}

impl DeterministicClassifier {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Classify every record of `chunk` that is not in `claimed`.
    ///
    /// Pairs are chosen greedily, one-to-one, best first: Green before
    /// Yellow, then higher narration similarity, smaller date gap, smaller
    /// amount gap, and finally input order. Leftovers become Red.
    pub fn classify(
        &self,
        chunk: &Chunk,
        candidates: &CandidateSet,
        claimed: &HashSet<RecordRef>,
    ) -> Vec<Verdict> {
        self.classify_records(&chunk.bank, &chunk.book, candidates, claimed)
    }

    pub fn classify_records(
        &self,
        bank: &[TransactionRecord],
        book: &[TransactionRecord],
        candidates: &CandidateSet,
        claimed: &HashSet<RecordRef>,
    ) -> Vec<Verdict> {
        let mut ranked: Vec<(usize, &CandidatePair)> = candidates
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| !claimed.contains(&p.bank_ref()) && !claimed.contains(&p.book_ref()))
            .collect();
        ranked.sort_by(|(ia, a), (ib, b)| self.compare(a, b).then(ia.cmp(ib)));

        let mut used: HashSet<RecordRef> = HashSet::new();
        let mut verdicts = Vec::new();

        for (_, pair) in ranked {
            let bank_ref = pair.bank_ref();
            let book_ref = pair.book_ref();
            if used.contains(&bank_ref) || used.contains(&book_ref) {
                continue;
            }
            let (Some(b), Some(k)) = (
                bank.iter().find(|r| r.id == pair.bank_record_id),
                book.iter().find(|r| r.id == pair.book_record_id),
            ) else {
                continue;
            };
            verdicts.push(self.policy.verdict_for(pair, b, k));
            used.insert(bank_ref);
            used.insert(book_ref);
        }

        let had_candidate: HashSet<RecordRef> = candidates
            .pairs
            .iter()
            .flat_map(|p| [p.bank_ref(), p.book_ref()])
            .collect();

        let leftovers = bank
            .iter()
            .map(|r| (Side::Bank, r))
            .chain(book.iter().map(|r| (Side::Book, r)));
        for (side, record) in leftovers {
            let key = RecordRef {
                side,
                id: record.id.clone(),
            };
            if used.contains(&key) || claimed.contains(&key) {
                continue;
            }
            let reason = if had_candidate.contains(&key) {
                REASON_PARTNER_TAKEN
            } else {
                REASON_NO_CANDIDATE
            };
            verdicts.push(Verdict::red(side, record, reason, VerdictSource::Deterministic));
        }

        verdicts
    }

    fn compare(&self, a: &CandidatePair, b: &CandidatePair) -> Ordering {
        self.policy
            .grade(b)
            .rank()
            .cmp(&self.policy.grade(a).rank())
            .then(b.narration_similarity.total_cmp(&a.narration_similarity))
            .then(a.date_delta_days.abs().cmp(&b.date_delta_days.abs()))
            .then(a.amount_delta_pct.cmp(&b.amount_delta_pct))
    }
}
