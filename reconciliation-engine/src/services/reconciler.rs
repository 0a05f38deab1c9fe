//! Reconciliation run: plan, classify chunks concurrently, aggregate.

use crate::config::ReconciliationConfig;
use crate::error::ReconError;
use crate::models::{ChunkMode, ChunkSummary, ReconciliationReport, TransactionRecord};
use crate::services::aggregator::{AggregationInput, ResultAggregator};
use crate::services::chunking::{Chunk, ChunkPlanner};
use crate::services::metrics;
use crate::services::oracle::ClassificationOracle;
use crate::services::orchestrator::{ChunkOutcome, ClassificationOrchestrator};
use crate::services::recorder::{ResponseRecorder, TracingRecorder};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Reconciler {
    planner: ChunkPlanner,
    orchestrator: Arc<ClassificationOrchestrator>,
    aggregator: ResultAggregator,
}

impl Reconciler {
    /// Validates `config` before anything else.
    pub fn new(
        config: &ReconciliationConfig,
        oracle: Option<Arc<dyn ClassificationOracle>>,
        recorder: Arc<dyn ResponseRecorder>,
    ) -> Result<Self, ReconError> {
        config.validate()?;

        let planner = ChunkPlanner::new(
            config.chunking.chunk_size,
            config.matching.date_tolerance_days,
        )?;
        let orchestrator = Arc::new(ClassificationOrchestrator::new(
            &config.matching,
            &config.oracle,
            oracle,
            recorder,
        ));
        let aggregator = ResultAggregator::new(
            orchestrator.generator().clone(),
            orchestrator.classifier().clone(),
        );

        Ok(Self {
            planner,
            orchestrator,
            aggregator,
        })
    }

    /// Rules only, responses logged through tracing.
    pub fn deterministic(config: &ReconciliationConfig) -> Result<Self, ReconError> {
        Self::new(config, None, Arc::new(TracingRecorder))
    }

    pub async fn reconcile(
        &self,
        bank: &[TransactionRecord],
        book: &[TransactionRecord],
    ) -> Result<ReconciliationReport, ReconError> {
        self.reconcile_until_cancelled(bank, book, CancellationToken::new())
            .await
    }

    /// Like [`reconcile`](Self::reconcile), but stops when `cancel` fires.
    /// Chunks finished by then are kept; the rest are listed as unprocessed
    /// and the report is marked partial.
    pub async fn reconcile_until_cancelled(
        &self,
        bank: &[TransactionRecord],
        book: &[TransactionRecord],
        cancel: CancellationToken,
    ) -> Result<ReconciliationReport, ReconError> {
        validate_records("bank", bank)?;
        validate_records("book", book)?;

        let started = Instant::now();
        let plan = self.planner.plan(bank, book);
        tracing::info!(
            bank_records = bank.len(),
            book_records = book.len(),
            chunks = plan.chunks.len(),
            split_clusters = plan.split_clusters,
            oracle = self.orchestrator.oracle_enabled(),
            "Starting reconciliation"
        );

        let mut tasks = JoinSet::new();
        for chunk in plan.chunks.iter().cloned() {
            let orchestrator = Arc::clone(&self.orchestrator);
            tasks.spawn(async move { orchestrator.classify(&chunk).await });
        }

        let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(plan.chunks.len());
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    tracing::warn!(
                        finished = outcomes.len(),
                        total = plan.chunks.len(),
                        "Reconciliation cancelled, abandoning in-flight chunks"
                    );
                    cancelled = true;
                    tasks.abort_all();
                }
                next = tasks.join_next() => match next {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => {
                        metrics::record_error("chunk_task");
                        tracing::error!(error = %e, "Chunk task failed");
                    }
                    None => break,
                }
            }
        }

        let finished: HashSet<usize> = outcomes.iter().map(|o| o.chunk_id).collect();
        let mut unprocessed = Vec::new();
        for chunk in plan.chunks.iter().filter(|c| !finished.contains(&c.id)) {
            if cancelled {
                unprocessed.extend(chunk.record_refs());
            } else {
                outcomes.push(self.recover(chunk));
            }
        }
        let partial = cancelled && !unprocessed.is_empty();

        let result = self.aggregator.aggregate(
            bank,
            book,
            AggregationInput {
                outcomes,
                unprocessed,
                partial,
                rescue_boundaries: plan.split_clusters > 0,
            },
        );

        match &result {
            Ok(report) => {
                metrics::record_run(if report.partial { "partial" } else { "complete" });
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    green = report.summary.green,
                    yellow = report.summary.yellow,
                    red = report.summary.red,
                    "Reconciliation finished"
                );
            }
            Err(e) => {
                metrics::record_run("failed");
                tracing::error!(error = %e, "Reconciliation failed");
            }
        }

        result
    }

    /// Rules-only classification for a chunk whose task died.
    fn recover(&self, chunk: &Chunk) -> ChunkOutcome {
        let candidates = self.orchestrator.generator().generate(chunk);
        let verdicts = self
            .orchestrator
            .classifier()
            .classify(chunk, &candidates, &HashSet::new());
        ChunkOutcome {
            chunk_id: chunk.id,
            verdicts,
            summary: ChunkSummary {
                chunk_id: chunk.id,
                mode: ChunkMode::DeterministicFallback,
                bank_records: chunk.bank.len(),
                book_records: chunk.book.len(),
                candidate_pairs: candidates.pairs.len(),
                oracle_attempts: 0,
                discarded_entries: 0,
                fallback_records: chunk.len(),
                error: Some("chunk task failed".to_string()),
            },
            raw_response: None,
        }
    }
}

fn validate_records(side: &str, records: &[TransactionRecord]) -> Result<(), ReconError> {
    let mut seen = HashSet::with_capacity(records.len());
    for (row, record) in records.iter().enumerate() {
        if record.id.trim().is_empty() {
            return Err(ReconError::InvalidInput(format!(
                "{} record at position {} has an empty id",
                side, row
            )));
        }
        if !seen.insert(record.id.as_str()) {
            return Err(ReconError::InvalidInput(format!(
                "duplicate {} record id '{}'",
                side, record.id
            )));
        }
    }
    Ok(())
}
