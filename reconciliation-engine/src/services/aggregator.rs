//! Merging per-chunk verdicts into the final report.

use crate::error::ReconError;
use crate::models::{
    AdjustmentKind, BookAdjustment, Bucket, ChunkMode, RecordRef, ReconciliationReport,
    ReportSummary, Side, TransactionRecord, Verdict, VerdictSource,
};
use crate::services::candidates::{CandidateGenerator, CandidateSet};
use crate::services::metrics;
use crate::services::orchestrator::ChunkOutcome;
use crate::services::policy::DeterministicClassifier;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

pub const REASON_PARTNER_SUPERSEDED: &str =
    "Matched partner was given a stronger verdict in another chunk";

/// Everything the aggregator needs besides the records themselves.
#[derive(Debug, Default)]
pub struct AggregationInput {
    pub outcomes: Vec<ChunkOutcome>,
    /// Records of chunks that never finished.
    pub unprocessed: Vec<RecordRef>,
    pub partial: bool,
    /// Re-pair red records across chunks (set when clusters were split).
    pub rescue_boundaries: bool,
}

pub struct ResultAggregator {
    generator: CandidateGenerator,
    classifier: DeterministicClassifier,
}

struct Indexed<'a> {
    bank: HashMap<&'a str, (usize, &'a TransactionRecord)>,
    book: HashMap<&'a str, (usize, &'a TransactionRecord)>,
}

impl<'a> Indexed<'a> {
    fn new(bank: &'a [TransactionRecord], book: &'a [TransactionRecord]) -> Self {
        Self {
            bank: bank.iter().enumerate().map(|(i, r)| (r.id.as_str(), (i, r))).collect(),
            book: book.iter().enumerate().map(|(i, r)| (r.id.as_str(), (i, r))).collect(),
        }
    }

    fn get(&self, key: &RecordRef) -> Option<(usize, &'a TransactionRecord)> {
        let map = match key.side {
            Side::Bank => &self.bank,
            Side::Book => &self.book,
        };
        map.get(key.id.as_str()).copied()
    }

    /// Sort key: pairs and bank reds by bank position, then book reds.
    fn order_key(&self, verdict: &Verdict) -> (Side, usize) {
        let anchor = verdict
            .records()
            .into_iter()
            .next()
            .and_then(|r| self.get(&r).map(|(i, _)| (r.side, i)));
        anchor.unwrap_or((Side::Book, usize::MAX))
    }
}

impl ResultAggregator {
    pub fn new(generator: CandidateGenerator, classifier: DeterministicClassifier) -> Self {
        Self {
            generator,
            classifier,
        }
    }

    pub fn aggregate(
        &self,
        bank: &[TransactionRecord],
        book: &[TransactionRecord],
        input: AggregationInput,
    ) -> Result<ReconciliationReport, ReconError> {
        let index = Indexed::new(bank, book);
        let AggregationInput {
            mut outcomes,
            unprocessed,
            partial,
            rescue_boundaries,
        } = input;
        outcomes.sort_by_key(|o| o.chunk_id);

        let mut chunks = Vec::with_capacity(outcomes.len());
        let mut candidates: Vec<(usize, usize, Verdict)> = Vec::new();
        for outcome in outcomes {
            chunks.push(outcome.summary);
            for (seq, verdict) in outcome.verdicts.into_iter().enumerate() {
                if verdict.records().iter().any(|r| index.get(r).is_none()) {
                    tracing::warn!(
                        chunk_id = outcome.chunk_id,
                        records = ?verdict.records(),
                        "Dropping verdict for unknown record"
                    );
                    continue;
                }
                candidates.push((outcome.chunk_id, seq, verdict));
            }
        }

        // Strongest verdict wins; ties go to the earlier chunk.
        candidates.sort_by(|(ca, sa, va), (cb, sb, vb)| {
            vb.bucket()
                .rank()
                .cmp(&va.bucket().rank())
                .then(ca.cmp(cb))
                .then(sa.cmp(sb))
        });

        let mut assigned: HashSet<RecordRef> = HashSet::new();
        let mut accepted: Vec<(usize, Verdict)> = Vec::new();
        let mut orphans: Vec<RecordRef> = Vec::new();
        let mut duplicates = 0usize;

        for (chunk_id, _, verdict) in candidates {
            let records = verdict.records();
            if records.iter().any(|r| assigned.contains(r)) {
                duplicates += 1;
                orphans.extend(records.into_iter().filter(|r| !assigned.contains(r)));
                continue;
            }
            assigned.extend(records);
            accepted.push((chunk_id, verdict));
        }

        for orphan in orphans {
            if assigned.contains(&orphan) {
                continue;
            }
            if let Some((_, record)) = index.get(&orphan) {
                accepted.push((
                    usize::MAX,
                    Verdict::red(
                        orphan.side,
                        record,
                        REASON_PARTNER_SUPERSEDED,
                        VerdictSource::Deterministic,
                    ),
                ));
                assigned.insert(orphan);
            }
        }

        if duplicates > 0 {
            tracing::warn!(duplicates, "Resolved records classified in more than one chunk");
        }

        let unprocessed: Vec<RecordRef> = unprocessed
            .into_iter()
            .filter(|r| !assigned.contains(r))
            .collect();
        let unprocessed_set: HashSet<&RecordRef> = unprocessed.iter().collect();

        let missing: Vec<RecordRef> = bank
            .iter()
            .map(|r| RecordRef::bank(r.id.clone()))
            .chain(book.iter().map(|r| RecordRef::book(r.id.clone())))
            .filter(|r| !assigned.contains(r) && !unprocessed_set.contains(r))
            .collect();
        if !missing.is_empty() {
            metrics::record_error("aggregation_invariant");
            return Err(ReconError::AggregationInvariantError { missing });
        }

        if rescue_boundaries {
            accepted = self.rescue_boundaries(&index, accepted);
        }

        let mut verdicts: Vec<Verdict> = accepted.into_iter().map(|(_, v)| v).collect();
        verdicts.sort_by_key(|v| index.order_key(v));

        let mut green = Vec::new();
        let mut yellow = Vec::new();
        let mut red = Vec::new();
        for verdict in verdicts {
            metrics::record_verdict(
                verdict.bucket().as_str(),
                match verdict.source() {
                    VerdictSource::Oracle => "oracle",
                    VerdictSource::Deterministic => "deterministic",
                },
            );
            match verdict.bucket() {
                Bucket::Green => green.push(verdict),
                Bucket::Yellow => yellow.push(verdict),
                Bucket::Red => red.push(verdict),
            }
        }

        let adjustments: Vec<BookAdjustment> = green
            .iter()
            .chain(yellow.iter())
            .chain(red.iter())
            .filter_map(|v| adjustment_for(&index, v))
            .collect();
        let net_adjustment = adjustments
            .iter()
            .try_fold(Decimal::ZERO, |acc, a| acc.checked_add(a.amount))
            .ok_or_else(|| {
                ReconError::InvalidInput("net adjustment exceeds the decimal range".to_string())
            })?;

        let summary = ReportSummary {
            bank_records: bank.len(),
            book_records: book.len(),
            green: green.len(),
            yellow: yellow.len(),
            red: red.len(),
            unprocessed: unprocessed.len(),
        };
        let degraded = chunks
            .iter()
            .any(|c| c.mode == ChunkMode::DeterministicFallback);

        tracing::info!(
            green = summary.green,
            yellow = summary.yellow,
            red = summary.red,
            unprocessed = summary.unprocessed,
            degraded,
            partial,
            "Reconciliation report assembled"
        );

        Ok(ReconciliationReport {
            green,
            yellow,
            red,
            adjustments,
            net_adjustment,
            summary,
            degraded,
            partial,
            chunks,
            unprocessed,
        })
    }

    /// Pair red records that ended up in different chunks after a cluster
    /// split. Only pairs spanning two chunks are considered; each chunk has
    /// already judged its own records.
    fn rescue_boundaries(
        &self,
        index: &Indexed<'_>,
        accepted: Vec<(usize, Verdict)>,
    ) -> Vec<(usize, Verdict)> {
        let mut origin: HashMap<RecordRef, usize> = HashMap::new();
        let mut bank_reds = Vec::new();
        let mut book_reds = Vec::new();
        for (chunk_id, verdict) in &accepted {
            if let Verdict::Red { side, record, .. } = verdict {
                origin.insert(
                    RecordRef {
                        side: *side,
                        id: record.id.clone(),
                    },
                    *chunk_id,
                );
                match side {
                    Side::Bank => bank_reds.push(record.clone()),
                    Side::Book => book_reds.push(record.clone()),
                }
            }
        }
        if bank_reds.is_empty() || book_reds.is_empty() {
            return accepted;
        }
        bank_reds.sort_by_key(|r| index.get(&RecordRef::bank(r.id.clone())).map(|(i, _)| i));
        book_reds.sort_by_key(|r| index.get(&RecordRef::book(r.id.clone())).map(|(i, _)| i));

        let mut set = self.generator.generate_between(&bank_reds, &book_reds);
        set.pairs
            .retain(|p| origin.get(&p.bank_ref()) != origin.get(&p.book_ref()));
        if set.pairs.is_empty() {
            return accepted;
        }
        let set = CandidateSet {
            pairs: set.pairs,
            ..Default::default()
        };

        let rescued: Vec<Verdict> = self
            .classifier
            .classify_records(&bank_reds, &book_reds, &set, &HashSet::new())
            .into_iter()
            .filter(|v| v.pair().is_some())
            .collect();
        if rescued.is_empty() {
            return accepted;
        }

        let replaced: HashSet<RecordRef> = rescued.iter().flat_map(Verdict::records).collect();
        tracing::info!(
            pairs = rescued.len(),
            "Re-paired records split across chunk boundaries"
        );

        accepted
            .into_iter()
            .filter(|(_, v)| !v.records().iter().any(|r| replaced.contains(r)))
            .chain(rescued.into_iter().map(|v| (usize::MAX, v)))
            .collect()
    }
}

fn adjustment_for(index: &Indexed<'_>, verdict: &Verdict) -> Option<BookAdjustment> {
    match verdict {
        Verdict::Green { pair, .. } | Verdict::Yellow { pair, .. } => {
            let (_, bank) = index.get(&pair.bank_ref())?;
            let (_, book) = index.get(&pair.book_ref())?;
            let diff = bank.amount.checked_sub(book.amount)?;
            (!diff.is_zero()).then(|| BookAdjustment {
                kind: AdjustmentKind::AmountDifference,
                bank_record_id: Some(bank.id.clone()),
                book_record_id: Some(book.id.clone()),
                amount: diff,
                description: format!(
                    "Adjust book entry {} from {} to {} to agree with bank entry {}",
                    book.id, book.amount, bank.amount, bank.id
                ),
            })
        }
        Verdict::Red { side, record, .. } => Some(match side {
            Side::Bank => BookAdjustment {
                kind: AdjustmentKind::MissingInBook,
                bank_record_id: Some(record.id.clone()),
                book_record_id: None,
                amount: record.amount,
                description: format!(
                    "Record bank entry {} ({}, {}) in the books",
                    record.id, record.date, record.narration
                ),
            },
            Side::Book => BookAdjustment {
                kind: AdjustmentKind::MissingInBank,
                bank_record_id: None,
                book_record_id: Some(record.id.clone()),
                amount: -record.amount,
                description: format!(
                    "Investigate or reverse book entry {} ({}, {}) not seen on the bank statement",
                    record.id, record.date, record.narration
                ),
            },
        }),
    }
}
