//! Tolerance-based candidate generation.

use crate::config::MatchingConfig;
use crate::models::{CandidatePair, TransactionRecord};
use crate::services::chunking::Chunk;
use crate::services::similarity::narration_similarity;
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Candidate pairs for one chunk plus the records that have none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateSet {
    /// Ordered by bank record, then book record, in chunk order.
    pub pairs: Vec<CandidatePair>,
    pub unmatched_bank: Vec<String>,
    pub unmatched_book: Vec<String>,
}

impl CandidateSet {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Look up the candidate for a specific (bank, book) combination.
    pub fn find(&self, bank_id: &str, book_id: &str) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| p.bank_record_id == bank_id && p.book_record_id == book_id)
    }
}

#[derive(Debug, Clone)]
pub struct CandidateGenerator {
    date_tolerance_days: i64,
    amount_tolerance_pct: Decimal,
}

impl CandidateGenerator {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            date_tolerance_days: config.date_tolerance_days,
            amount_tolerance_pct: config.amount_tolerance_pct,
        }
    }

    /// Score a single combination, or `None` when it falls outside either
    /// tolerance. References are never looked at.
    pub fn evaluate(
        &self,
        bank: &TransactionRecord,
        book: &TransactionRecord,
    ) -> Option<CandidatePair> {
        let date_delta_days = (book.date - bank.date).num_days();
        if date_delta_days.abs() > self.date_tolerance_days {
            return None;
        }

        let pct = amount_delta_pct(bank.amount, book.amount)?;
        if pct > self.amount_tolerance_pct {
            return None;
        }

        Some(CandidatePair {
            bank_record_id: bank.id.clone(),
            book_record_id: book.id.clone(),
            date_delta_days,
            amount_delta_pct: pct.round_dp(6),
            narration_similarity: narration_similarity(&bank.narration, &book.narration),
        })
    }

    pub fn generate(&self, chunk: &Chunk) -> CandidateSet {
        self.generate_between(&chunk.bank, &chunk.book)
    }

    pub fn generate_between(
        &self,
        bank: &[TransactionRecord],
        book: &[TransactionRecord],
    ) -> CandidateSet {
        let mut pairs = Vec::new();
        let mut paired_book: HashSet<&str> = HashSet::new();
        let mut unmatched_bank = Vec::new();

        for b in bank {
            let before = pairs.len();
            for k in book {
                if let Some(pair) = self.evaluate(b, k) {
                    paired_book.insert(k.id.as_str());
                    pairs.push(pair);
                }
            }
            if pairs.len() == before {
                unmatched_bank.push(b.id.clone());
            }
        }

        let unmatched_book = book
            .iter()
            .filter(|k| !paired_book.contains(k.id.as_str()))
            .map(|k| k.id.clone())
            .collect();

        CandidateSet {
            pairs,
            unmatched_bank,
            unmatched_book,
        }
    }
}

/// `|a - b| / max(|a|, |b|)` in percent. Two zero amounts differ by 0%.
/// `None` when the difference does not fit in a `Decimal`.
pub fn amount_delta_pct(a: Decimal, b: Decimal) -> Option<Decimal> {
    let base = a.abs().max(b.abs());
    if base.is_zero() {
        return Some(Decimal::ZERO);
    }
    a.checked_sub(b)?
        .abs()
        .checked_div(base)?
        .checked_mul(Decimal::ONE_HUNDRED)
}
