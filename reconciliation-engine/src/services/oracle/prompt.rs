//! Prompt construction for the classification oracle.

use crate::config::MatchingConfig;
use crate::models::{CandidatePair, TransactionRecord};
use crate::services::candidates::CandidateSet;
use crate::services::chunking::Chunk;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

/// A fully rendered oracle request for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct OraclePrompt {
    pub chunk_id: usize,
    pub system: String,
    pub user: String,
}

#[derive(Serialize)]
struct PromptRecord<'a> {
    id: &'a str,
    date: NaiveDate,
    amount: Decimal,
    narration: &'a str,
}

impl<'a> From<&'a TransactionRecord> for PromptRecord<'a> {
    fn from(r: &'a TransactionRecord) -> Self {
        // Reference numbers are deliberately left out of the payload.
        Self {
            id: &r.id,
            date: r.date,
            amount: r.amount,
            narration: &r.narration,
        }
    }
}

#[derive(Serialize)]
struct ChunkPayload<'a> {
    chunk_id: usize,
    bank_transactions: Vec<PromptRecord<'a>>,
    book_transactions: Vec<PromptRecord<'a>>,
    candidate_pairs: &'a [CandidatePair],
    unmatched_bank_ids: &'a [String],
    unmatched_book_ids: &'a [String],
}

fn system_prompt(config: &MatchingConfig) -> String {
    format!(
        r#"You are an expert in financial reconciliation.
Match bank transactions against book records using these rules:
- Date: a pair may differ by at most {days} days.
- Amount: a pair may differ by at most {pct}% of the larger amount (rounding).
- Narration: at least {threshold:.0}% textual similarity indicates the same transaction.
- Reference numbers are never used for matching.

Classification:
- green: same transaction (date within range, amount, narration agree, or the
  narrations clearly describe the same payment despite different wording).
- yellow: probably the same transaction with a caveat (partial narration overlap,
  rounding); always include an "adjustment" describing what to correct in the books.
- red: no suitable counterpart; give a short "reason".

Only pair records listed in candidate_pairs. Each record may appear at most once.
Account for every bank and book record.
Respond with JSON only, exactly in this shape:
{{"green": [{{"bank_id": "...", "book_id": "...", "note": "..."}}],
 "yellow": [{{"bank_id": "...", "book_id": "...", "adjustment": "..."}}],
 "red": [{{"side": "bank|book", "id": "...", "reason": "..."}}]}}"#,
        days = config.date_tolerance_days,
        pct = config.amount_tolerance_pct,
        threshold = config.narration_threshold * 100.0,
    )
}

/// Render the prompt for one chunk: its records, the candidate pairs the
/// rules found, and the records that have no candidate at all.
pub fn build_prompt(
    chunk: &Chunk,
    candidates: &CandidateSet,
    config: &MatchingConfig,
) -> Result<OraclePrompt, serde_json::Error> {
    let payload = ChunkPayload {
        chunk_id: chunk.id,
        bank_transactions: chunk.bank.iter().map(PromptRecord::from).collect(),
        book_transactions: chunk.book.iter().map(PromptRecord::from).collect(),
        candidate_pairs: &candidates.pairs,
        unmatched_bank_ids: &candidates.unmatched_bank,
        unmatched_book_ids: &candidates.unmatched_book,
    };

    let user = format!(
        "Here are the transactions to reconcile:\n\n{}\n\nClassify every record. Ensure no transactions are skipped.",
        serde_json::to_string_pretty(&payload)?
    );

    Ok(OraclePrompt {
        chunk_id: chunk.id,
        system: system_prompt(config),
        user,
    })
}
