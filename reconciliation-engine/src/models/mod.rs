//! Domain models for the reconciliation engine.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Transaction Models
// ============================================================================

/// Which ledger a record was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bank,
    Book,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bank => "bank",
            Self::Book => "book",
        }
    }

    /// Lenient parse used for oracle output; accepts a few synonyms.
    pub fn parse_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bank" | "bank_statement" | "statement" => Some(Self::Bank),
            "book" | "books" | "ledger" | "company_book" => Some(Self::Book),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single normalized bank or book entry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub narration: String,
    /// Carried through for the report; never used for matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl TransactionRecord {
    pub fn new(
        id: impl Into<String>,
        date: NaiveDate,
        amount: Decimal,
        narration: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            date,
            amount,
            narration: narration.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Identity of a record across both sides. Ids are only unique per side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub side: Side,
    pub id: String,
}

impl RecordRef {
    pub fn bank(id: impl Into<String>) -> Self {
        Self {
            side: Side::Bank,
            id: id.into(),
        }
    }

    pub fn book(id: impl Into<String>) -> Self {
        Self {
            side: Side::Book,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.side, self.id)
    }
}

// ============================================================================
// Candidate Models
// ============================================================================

/// A (bank, book) combination inside the date and amount tolerances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub bank_record_id: String,
    pub book_record_id: String,
    /// Book date minus bank date.
    pub date_delta_days: i64,
    /// Absolute difference relative to the larger absolute amount, in percent.
    pub amount_delta_pct: Decimal,
    pub narration_similarity: f64,
}

impl CandidatePair {
    pub fn bank_ref(&self) -> RecordRef {
        RecordRef::bank(self.bank_record_id.clone())
    }

    pub fn book_ref(&self) -> RecordRef {
        RecordRef::book(self.book_record_id.clone())
    }
}

// ============================================================================
// Verdict Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Oracle,
    Deterministic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Green,
    Yellow,
    Red,
}

impl Bucket {
    /// Higher is more confident: Green > Yellow > Red.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Green => 2,
            Self::Yellow => 1,
            Self::Red => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Verdict {
    Green {
        pair: CandidatePair,
        source: VerdictSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Yellow {
        pair: CandidatePair,
        adjustment: String,
        source: VerdictSource,
    },
    Red {
        side: Side,
        record: TransactionRecord,
        reason: String,
        source: VerdictSource,
    },
}

impl Verdict {
    pub fn bucket(&self) -> Bucket {
        match self {
            Self::Green { .. } => Bucket::Green,
            Self::Yellow { .. } => Bucket::Yellow,
            Self::Red { .. } => Bucket::Red,
        }
    }

    pub fn source(&self) -> VerdictSource {
        match self {
            Self::Green { source, .. } | Self::Yellow { source, .. } | Self::Red { source, .. } => {
                *source
            }
        }
    }

    pub fn pair(&self) -> Option<&CandidatePair> {
        match self {
            Self::Green { pair, .. } | Self::Yellow { pair, .. } => Some(pair),
            Self::Red { .. } => None,
        }
    }

    /// Every record this verdict accounts for.
    pub fn records(&self) -> Vec<RecordRef> {
        match self {
            Self::Green { pair, .. } | Self::Yellow { pair, .. } => {
                vec![pair.bank_ref(), pair.book_ref()]
            }
            Self::Red { side, record, .. } => vec![RecordRef {
                side: *side,
                id: record.id.clone(),
            }],
        }
    }

    pub fn red(
        side: Side,
        record: &TransactionRecord,
        reason: impl Into<String>,
        source: VerdictSource,
    ) -> Self {
        Self::Red {
            side,
            record: record.clone(),
            reason: reason.into(),
            source,
        }
    }
}

// ============================================================================
// Report Models
// ============================================================================

/// How a chunk's verdicts were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// The oracle answered and its verdicts were applied.
    OracleAssisted,
    /// The oracle failed or answered garbage; rules were used instead.
    DeterministicFallback,
    /// The oracle was not consulted (disabled, or nothing ambiguous to ask).
    Deterministic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk_id: usize,
    pub mode: ChunkMode,
    pub bank_records: usize,
    pub book_records: usize,
    pub candidate_pairs: usize,
    pub oracle_attempts: u32,
    /// Oracle entries dropped during validation.
    pub discarded_entries: usize,
    /// Records the oracle left out that were classified by rules.
    pub fallback_records: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    /// Matched pair whose amounts differ; book should be corrected to the bank figure.
    AmountDifference,
    /// Present on the bank statement but not in the books.
    MissingInBook,
    /// Present in the books but never cleared the bank.
    MissingInBank,
}

/// A suggested correction to the books.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookAdjustment {
    pub kind: AdjustmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_record_id: Option<String>,
    /// Signed amount to post to the books.
    pub amount: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub bank_records: usize,
    pub book_records: usize,
    pub green: usize,
    pub yellow: usize,
    pub red: usize,
    pub unprocessed: usize,
}

/// Final ternary report. Every input record appears in exactly one verdict,
/// or in `unprocessed` when the run was cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub green: Vec<Verdict>,
    pub yellow: Vec<Verdict>,
    pub red: Vec<Verdict>,
    pub adjustments: Vec<BookAdjustment>,
    pub net_adjustment: Decimal,
    pub summary: ReportSummary,
    /// At least one chunk fell back to rules because the oracle was unusable.
    pub degraded: bool,
    /// The run was cancelled before every chunk finished.
    pub partial: bool,
    pub chunks: Vec<ChunkSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unprocessed: Vec<RecordRef>,
}

impl ReconciliationReport {
    pub fn verdicts(&self) -> impl Iterator<Item = &Verdict> {
        self.green.iter().chain(self.yellow.iter()).chain(self.red.iter())
    }
}
