//! Per-chunk classification.
//!
//! For each chunk: generate candidates, ask the oracle (if any) under the
//! shared concurrency cap, validate what it says against the chunk, and let
//! the deterministic classifier cover everything else. The oracle is
//! advisory; a chunk always comes back fully classified.

use crate::config::{MatchingConfig, OracleConfig};
use crate::error::ReconError;
use crate::models::{ChunkMode, ChunkSummary, RecordRef, Side, Verdict, VerdictSource};
use crate::services::candidates::{CandidateGenerator, CandidateSet};
use crate::services::chunking::Chunk;
use crate::services::metrics;
use crate::services::oracle::{
    build_prompt, parse_oracle_response, ClassificationOracle, OracleError, OracleVerdicts,
};
use crate::services::policy::{DeterministicClassifier, MatchPolicy};
use crate::services::recorder::{RecordedResponse, ResponseOutcome, ResponseRecorder};
use service_core::retry::{retry_call, RetryConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::Instrument;

const REASON_ORACLE_RED: &str = "Oracle found no matching counterpart";

/// Verdicts for one chunk plus its provenance.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub chunk_id: usize,
    pub verdicts: Vec<Verdict>,
    pub summary: ChunkSummary,
    /// Raw oracle text, when the oracle answered.
    pub raw_response: Option<String>,
}

pub struct ClassificationOrchestrator {
    matching: MatchingConfig,
    generator: CandidateGenerator,
    classifier: DeterministicClassifier,
    oracle: Option<Arc<dyn ClassificationOracle>>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
    request_timeout: Duration,
    recorder: Arc<dyn ResponseRecorder>,
}

enum OracleFailure {
    Invocation { attempts: u32, error: ReconError },
    Response { attempts: u32, raw: String, error: ReconError },
}

impl ClassificationOrchestrator {
    pub fn new(
        matching: &MatchingConfig,
        oracle_config: &OracleConfig,
        oracle: Option<Arc<dyn ClassificationOracle>>,
        recorder: Arc<dyn ResponseRecorder>,
    ) -> Self {
        Self {
            matching: matching.clone(),
            generator: CandidateGenerator::new(matching),
            classifier: DeterministicClassifier::new(MatchPolicy::new(matching)),
            oracle,
            permits: Arc::new(Semaphore::new(oracle_config.max_concurrent_calls.max(1))),
            retry: oracle_config.retry.clone(),
            request_timeout: oracle_config.request_timeout,
            recorder,
        }
    }

    pub fn classifier(&self) -> &DeterministicClassifier {
        &self.classifier
    }

    pub fn generator(&self) -> &CandidateGenerator {
        &self.generator
    }

    pub fn oracle_enabled(&self) -> bool {
        self.oracle.is_some()
    }

    /// Classify every record of `chunk`. Oracle failures are absorbed here.
    pub async fn classify(&self, chunk: &Chunk) -> ChunkOutcome {
        let span = tracing::info_span!(
            "chunk",
            chunk_id = chunk.id,
            bank_records = chunk.bank.len(),
            book_records = chunk.book.len()
        );
        self.classify_inner(chunk).instrument(span).await
    }

    async fn classify_inner(&self, chunk: &Chunk) -> ChunkOutcome {
        let candidates = self.generator.generate(chunk);
        let mut summary = ChunkSummary {
            chunk_id: chunk.id,
            mode: ChunkMode::Deterministic,
            bank_records: chunk.bank.len(),
            book_records: chunk.book.len(),
            candidate_pairs: candidates.pairs.len(),
            oracle_attempts: 0,
            discarded_entries: 0,
            fallback_records: 0,
            error: None,
        };

        let oracle = match &self.oracle {
            Some(oracle) if !candidates.is_empty() => oracle,
            _ => {
                let verdicts = self.classifier.classify(chunk, &candidates, &HashSet::new());
                tracing::debug!(
                    candidates = candidates.pairs.len(),
                    "Chunk classified by rules only"
                );
                metrics::record_chunk("deterministic");
                return ChunkOutcome {
                    chunk_id: chunk.id,
                    verdicts,
                    summary,
                    raw_response: None,
                };
            }
        };

        match self.consult(oracle.as_ref(), chunk, &candidates).await {
            Ok((attempts, raw, parsed)) => {
                summary.mode = ChunkMode::OracleAssisted;
                summary.oracle_attempts = attempts;

                let (mut verdicts, claimed, discarded) =
                    self.apply_oracle(chunk, &candidates, &parsed);
                summary.discarded_entries = parsed.discarded_entries + discarded;

                let fallback = self.classifier.classify(chunk, &candidates, &claimed);
                summary.fallback_records = fallback.iter().map(|v| v.records().len()).sum();
                verdicts.extend(fallback);

                if summary.discarded_entries > 0 || summary.fallback_records > 0 {
                    tracing::info!(
                        discarded = summary.discarded_entries,
                        fallback_records = summary.fallback_records,
                        "Oracle answer incomplete, rules filled the gaps"
                    );
                }
                metrics::record_chunk("oracle_assisted");

                ChunkOutcome {
                    chunk_id: chunk.id,
                    verdicts,
                    summary,
                    raw_response: Some(raw),
                }
            }
            Err(failure) => {
                let (attempts, raw, error) = match failure {
                    OracleFailure::Invocation { attempts, error } => (attempts, None, error),
                    OracleFailure::Response {
                        attempts,
                        raw,
                        error,
                    } => (attempts, Some(raw), error),
                };
                tracing::warn!(
                    error = %error,
                    "Falling back to deterministic classification"
                );
                metrics::record_error(error.kind());
                metrics::record_chunk("deterministic_fallback");

                let verdicts = self.classifier.classify(chunk, &candidates, &HashSet::new());
                summary.mode = ChunkMode::DeterministicFallback;
                summary.oracle_attempts = attempts;
                summary.fallback_records = chunk.len();
                summary.error = Some(error.to_string());

                ChunkOutcome {
                    chunk_id: chunk.id,
                    verdicts,
                    summary,
                    raw_response: raw,
                }
            }
        }
    }

    /// Invoke the oracle with retries and parse its answer. Parse failures
    /// are not retried.
    async fn consult(
        &self,
        oracle: &dyn ClassificationOracle,
        chunk: &Chunk,
        candidates: &CandidateSet,
    ) -> Result<(u32, String, OracleVerdicts), OracleFailure> {
        let prompt = build_prompt(chunk, candidates, &self.matching).map_err(|e| {
            OracleFailure::Invocation {
                attempts: 0,
                error: ReconError::OracleInvocationError {
                    chunk_id: chunk.id,
                    attempts: 0,
                    message: format!("failed to build prompt: {}", e),
                },
            }
        })?;

        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        let (permits, prompt, counter) = (&self.permits, &prompt, &attempts);
        let request_timeout = self.request_timeout;
        let result = retry_call(&self.retry, "oracle_invoke", || async move {
            // The permit is held for a single attempt, never across a backoff.
            let _permit = permits
                .acquire()
                .await
                .map_err(|_| OracleError::NotConfigured("oracle call pool closed".to_string()))?;
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(attempt, provider = oracle.name(), "Invoking oracle");

            match tokio::time::timeout(request_timeout, oracle.invoke(prompt)).await {
                Ok(result) => result,
                Err(_) => Err(OracleError::Timeout(request_timeout.as_secs())),
            }
        })
        .await;
        let attempts = attempts.load(Ordering::SeqCst);
        let elapsed = started.elapsed().as_secs_f64();

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                metrics::record_oracle_call(oracle.name(), "failed", elapsed);
                self.recorder.record(&RecordedResponse {
                    chunk_id: chunk.id,
                    provider: oracle.name().to_string(),
                    raw_response: None,
                    outcome: ResponseOutcome::InvocationFailed {
                        attempts,
                        message: e.to_string(),
                    },
                });
                return Err(OracleFailure::Invocation {
                    attempts,
                    error: ReconError::OracleInvocationError {
                        chunk_id: chunk.id,
                        attempts,
                        message: e.to_string(),
                    },
                });
            }
        };

        match parse_oracle_response(chunk.id, &raw) {
            Ok(parsed) => {
                metrics::record_oracle_call(oracle.name(), "success", elapsed);
                self.recorder.record(&RecordedResponse {
                    chunk_id: chunk.id,
                    provider: oracle.name().to_string(),
                    raw_response: Some(raw.clone()),
                    outcome: ResponseOutcome::Parsed {
                        entries: parsed.green.len() + parsed.yellow.len() + parsed.red.len(),
                        discarded: parsed.discarded_entries,
                    },
                });
                Ok((attempts, raw, parsed))
            }
            Err(error) => {
                metrics::record_oracle_call(oracle.name(), "unparseable", elapsed);
                self.recorder.record(&RecordedResponse {
                    chunk_id: chunk.id,
                    provider: oracle.name().to_string(),
                    raw_response: Some(raw.clone()),
                    outcome: ResponseOutcome::Unparseable {
                        message: error.to_string(),
                    },
                });
                Err(OracleFailure::Response {
                    attempts,
                    raw,
                    error,
                })
            }
        }
    }

    /// Turn validated oracle entries into verdicts.
    ///
    /// Entries are applied Green, then Yellow, then Red; an entry naming a
    /// record that is unknown, not a candidate pairing, or already claimed is
    /// discarded. Returns the verdicts, the claimed records and the discard
    /// count.
    fn apply_oracle(
        &self,
        chunk: &Chunk,
        candidates: &CandidateSet,
        parsed: &OracleVerdicts,
    ) -> (Vec<Verdict>, HashSet<RecordRef>, usize) {
        let mut verdicts = Vec::new();
        let mut claimed: HashSet<RecordRef> = HashSet::new();
        let mut discarded = 0;

        for entry in &parsed.green {
            match candidates.find(&entry.bank_id, &entry.book_id) {
                Some(pair)
                    if !claimed.contains(&pair.bank_ref()) && !claimed.contains(&pair.book_ref()) =>
                {
                    claimed.insert(pair.bank_ref());
                    claimed.insert(pair.book_ref());
                    verdicts.push(Verdict::Green {
                        pair: pair.clone(),
                        source: VerdictSource::Oracle,
                        note: entry.text.clone(),
                    });
                }
                _ => {
                    tracing::debug!(
                        bank_id = %entry.bank_id,
                        book_id = %entry.book_id,
                        "Discarding oracle green entry"
                    );
                    discarded += 1;
                }
            }
        }

        for entry in &parsed.yellow {
            let pair = candidates
                .find(&entry.bank_id, &entry.book_id)
                .filter(|p| !claimed.contains(&p.bank_ref()) && !claimed.contains(&p.book_ref()));
            let records = pair.and_then(|p| {
                Some((
                    p,
                    chunk.record(Side::Bank, &p.bank_record_id)?,
                    chunk.record(Side::Book, &p.book_record_id)?,
                ))
            });
            match records {
                Some((pair, bank, book)) => {
                    claimed.insert(pair.bank_ref());
                    claimed.insert(pair.book_ref());
                    let adjustment = entry.text.clone().unwrap_or_else(|| {
                        self.classifier.policy().adjustment_note(pair, bank, book)
                    });
                    verdicts.push(Verdict::Yellow {
                        pair: pair.clone(),
                        adjustment,
                        source: VerdictSource::Oracle,
                    });
                }
                None => {
                    tracing::debug!(
                        bank_id = %entry.bank_id,
                        book_id = %entry.book_id,
                        "Discarding oracle yellow entry"
                    );
                    discarded += 1;
                }
            }
        }

        for entry in &parsed.red {
            let side = match entry.side {
                Some(side) => chunk.record(side, &entry.id).map(|_| side),
                // Without a side the id must be unambiguous.
                None => match (
                    chunk.record(Side::Bank, &entry.id),
                    chunk.record(Side::Book, &entry.id),
                ) {
                    (Some(_), None) => Some(Side::Bank),
                    (None, Some(_)) => Some(Side::Book),
                    _ => None,
                },
            };
            let resolved = side.and_then(|side| {
                let key = RecordRef {
                    side,
                    id: entry.id.clone(),
                };
                if claimed.contains(&key) {
                    return None;
                }
                chunk.record(side, &entry.id).map(|record| (key, side, record))
            });

            match resolved {
                Some((key, side, record)) => {
                    claimed.insert(key);
                    verdicts.push(Verdict::red(
                        side,
                        record,
                        entry.reason.as_deref().unwrap_or(REASON_ORACLE_RED),
                        VerdictSource::Oracle,
                    ));
                }
                None => {
                    tracing::debug!(id = %entry.id, "Discarding oracle red entry");
                    discarded += 1;
                }
            }
        }

        (verdicts, claimed, discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bucket, TransactionRecord};
    use crate::services::oracle::MockOracle;
    use crate::services::recorder::MemoryRecorder;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn rec(id: &str, date: &str, amount: &str, narration: &str) -> TransactionRecord {
        TransactionRecord::new(
            id,
            NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            Decimal::from_str(amount).unwrap(),
            narration,
        )
    }

    fn chunk() -> Chunk {
        Chunk {
            id: 0,
            bank: vec![
                rec("b1", "2024-01-10", "100.00", "Invoice 123 Payment"),
                rec("b2", "2024-01-11", "250.00", "POS 4411 ACME"),
            ],
            book: vec![
                rec("k1", "2024-01-12", "100.05", "Payment for Invoice 123"),
                rec("k2", "2024-01-11", "250.00", "Office chairs"),
                rec("k3", "2024-01-20", "500.00", "Unrelated"),
            ],
        }
    }

    fn oracle_config() -> OracleConfig {
        let mut config = OracleConfig::default();
        config.retry = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            add_jitter: false,
        };
        config
    }

    fn orchestrator(
        oracle: Option<Arc<dyn ClassificationOracle>>,
        recorder: Arc<MemoryRecorder>,
    ) -> ClassificationOrchestrator {
        ClassificationOrchestrator::new(
            &MatchingConfig::default(),
            &oracle_config(),
            oracle,
            recorder,
        )
    }

    fn refs(verdicts: &[Verdict]) -> Vec<RecordRef> {
        let mut all: Vec<RecordRef> = verdicts.iter().flat_map(Verdict::records).collect();
        all.sort();
        all
    }

    #[tokio::test]
    async fn without_oracle_rules_cover_everything() {
        let outcome = orchestrator(None, Arc::new(MemoryRecorder::new()))
            .classify(&chunk())
            .await;
        assert_eq!(outcome.summary.mode, ChunkMode::Deterministic);
        let mut expected = chunk().record_refs();
        expected.sort();
        assert_eq!(refs(&outcome.verdicts), expected);
    }

    #[tokio::test]
    async fn oracle_verdicts_are_validated_and_gaps_filled() {
        let raw = r#"{"green":[{"bank_id":"b2","book_id":"k2","note":"same POS purchase"},
                              {"bank_id":"b1","book_id":"k3"},
                              {"bank_id":"ghost","book_id":"k1"}],
                      "yellow":[{"bank_id":"b2","book_id":"k2","adjustment":"dup"}],
                      "red":[{"side":"book","id":"k99"}]}"#;
        let oracle = Arc::new(MockOracle::fixed(raw));
        let recorder = Arc::new(MemoryRecorder::new());
        let outcome = orchestrator(Some(oracle.clone()), recorder.clone())
            .classify(&chunk())
            .await;

        assert_eq!(outcome.summary.mode, ChunkMode::OracleAssisted);
        assert_eq!(outcome.summary.discarded_entries, 4);
        assert_eq!(outcome.raw_response.as_deref(), Some(raw));

        let oracle_green = &outcome.verdicts[0];
        assert_eq!(oracle_green.bucket(), Bucket::Green);
        assert_eq!(oracle_green.source(), VerdictSource::Oracle);
        assert_eq!(oracle_green.pair().unwrap().bank_record_id, "b2");

        // b1/k1 and k3 left out by the oracle are covered by rules.
        assert_eq!(outcome.summary.fallback_records, 3);
        assert_eq!(refs(&outcome.verdicts).len(), 5);
        assert_eq!(oracle.calls(), 1);
        assert!(matches!(
            recorder.entries()[0].outcome,
            ResponseOutcome::Parsed { .. }
        ));
    }

    #[tokio::test]
    async fn invocation_failure_falls_back_after_retries() {
        let oracle = Arc::new(MockOracle::failing(OracleError::Timeout(1)));
        let recorder = Arc::new(MemoryRecorder::new());
        let outcome = orchestrator(Some(oracle.clone()), recorder.clone())
            .classify(&chunk())
            .await;

        assert_eq!(outcome.summary.mode, ChunkMode::DeterministicFallback);
        assert_eq!(outcome.summary.oracle_attempts, 3);
        assert_eq!(oracle.calls(), 3);
        assert_eq!(refs(&outcome.verdicts).len(), 5);
        assert!(outcome.verdicts.iter().all(|v| v.source() == VerdictSource::Deterministic));
        assert!(matches!(
            recorder.entries()[0].outcome,
            ResponseOutcome::InvocationFailed { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn unparseable_response_is_not_retried() {
        let oracle = Arc::new(MockOracle::fixed("I am unable to help with that."));
        let recorder = Arc::new(MemoryRecorder::new());
        let outcome = orchestrator(Some(oracle.clone()), recorder.clone())
            .classify(&chunk())
            .await;

        assert_eq!(outcome.summary.mode, ChunkMode::DeterministicFallback);
        assert_eq!(oracle.calls(), 1);
        assert!(outcome.summary.error.is_some());
        assert_eq!(
            recorder.entries()[0].raw_response.as_deref(),
            Some("I am unable to help with that.")
        );
    }

    #[tokio::test]
    async fn chunk_without_candidates_skips_oracle() {
        let c = Chunk {
            id: 1,
            bank: vec![rec("b1", "2024-01-10", "100.00", "Fee")],
            book: vec![rec("k1", "2024-03-10", "900.00", "Rent")],
        };
        let oracle = Arc::new(MockOracle::silent());
        let outcome = orchestrator(Some(oracle.clone()), Arc::new(MemoryRecorder::new()))
            .classify(&c)
            .await;
        assert_eq!(oracle.calls(), 0);
        assert_eq!(outcome.summary.mode, ChunkMode::Deterministic);
        assert!(outcome.verdicts.iter().all(|v| v.bucket() == Bucket::Red));
    }
}
