//! Oracle-assisted runs: fallback, validation, retries, concurrency cap and
//! cancellation.

mod common;

use async_trait::async_trait;
use common::{assert_coverage, rec, reconciler, sample_ledgers, test_config};
use reconciliation_engine::models::{Bucket, ChunkMode, TransactionRecord, VerdictSource};
use reconciliation_engine::services::oracle::OraclePrompt;
use reconciliation_engine::services::{
    ClassificationOracle, MockOracle, OracleError, ResponseOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Three well separated date groups so that each lands in its own chunk
/// with a chunk size of 2.
fn grouped_ledgers() -> (Vec<TransactionRecord>, Vec<TransactionRecord>) {
    let bank = vec![
        rec("b1", "2024-01-10", "100.00", "Invoice 123 Payment"),
        rec("b2", "2024-01-11", "250.00", "POS 4411 ACME"),
        rec("b3", "2024-02-10", "75.00", "Electricity bill"),
        rec("b4", "2024-02-11", "12.00", "Bank fee"),
        rec("b5", "2024-03-10", "900.00", "Rent March"),
    ];
    let book = vec![
        rec("k1", "2024-01-12", "100.05", "Payment for Invoice 123"),
        rec("k2", "2024-01-11", "250.00", "Office chairs"),
        rec("k3", "2024-02-11", "75.00", "Electric bill"),
        rec("k5", "2024-03-10", "900.00", "Rent for March"),
        rec("k6", "2024-03-12", "64.00", "Stationery"),
    ];
    (bank, book)
}

fn small_chunks() -> reconciliation_engine::config::ReconciliationConfig {
    let mut config = test_config();
    config.chunking.chunk_size = 2;
    config
}

#[tokio::test]
async fn failing_oracle_degrades_but_covers_everything() {
    let oracle = Arc::new(MockOracle::failing(OracleError::NetworkError(
        "connection reset".into(),
    )));
    let (reconciler, recorder) = reconciler(&small_chunks(), Some(oracle.clone()));
    let (bank, book) = grouped_ledgers();

    let report = reconciler.reconcile(&bank, &book).await.unwrap();

    assert_coverage(&report, &bank, &book);
    assert!(report.degraded);
    assert!(report
        .verdicts()
        .all(|v| v.source() == VerdictSource::Deterministic));
    assert!(report
        .chunks
        .iter()
        .all(|c| c.mode == ChunkMode::DeterministicFallback && c.oracle_attempts == 3));
    assert_eq!(oracle.calls() as usize, report.chunks.len() * 3);
    assert!(recorder
        .entries()
        .iter()
        .all(|e| matches!(e.outcome, ResponseOutcome::InvocationFailed { .. })));
}

#[tokio::test]
async fn failure_in_one_chunk_is_isolated() {
    let oracle = Arc::new(MockOracle::new(|prompt: &OraclePrompt, _| {
        if prompt.user.contains("\"b3\"") {
            Err(OracleError::ContentFiltered)
        } else {
            Ok(r#"{"green": [], "yellow": [], "red": []}"#.to_string())
        }
    }));
    let (reconciler, _) = reconciler(&small_chunks(), Some(oracle));
    let (bank, book) = grouped_ledgers();

    let report = reconciler.reconcile(&bank, &book).await.unwrap();

    assert_coverage(&report, &bank, &book);
    assert!(report.degraded);
    let fallback: Vec<_> = report
        .chunks
        .iter()
        .filter(|c| c.mode == ChunkMode::DeterministicFallback)
        .collect();
    assert_eq!(fallback.len(), 1);
    // Content filtering is permanent: a single attempt.
    assert_eq!(fallback[0].oracle_attempts, 1);
    assert!(report
        .chunks
        .iter()
        .any(|c| c.mode == ChunkMode::OracleAssisted));
}

#[tokio::test]
async fn hallucinated_and_non_candidate_entries_are_discarded() {
    let raw = r#"Here you go:
        {"green": [{"bank_id": "b1", "book_id": "k1"},
                   {"bank_id": "b1", "book_id": "k6"},
                   {"bank_id": "zz", "book_id": "k2"}],
         "red": [{"side": "bank", "id": "nobody"}]}"#;
    let oracle = Arc::new(MockOracle::fixed(raw));
    let (reconciler, _) = reconciler(&test_config(), Some(oracle));
    let (bank, book) = grouped_ledgers();

    let report = reconciler.reconcile(&bank, &book).await.unwrap();

    assert_coverage(&report, &bank, &book);
    assert!(!report.degraded);
    let discarded: usize = report.chunks.iter().map(|c| c.discarded_entries).sum();
    assert_eq!(discarded, 3);
    let oracle_verdicts: Vec<_> = report
        .verdicts()
        .filter(|v| v.source() == VerdictSource::Oracle)
        .collect();
    assert_eq!(oracle_verdicts.len(), 1);
    assert_eq!(oracle_verdicts[0].pair().unwrap().book_record_id, "k1");
}

#[tokio::test]
async fn oracle_can_confirm_reworded_match() {
    // Rules alone would call this Yellow.
    let bank = vec![rec("b1", "2024-04-02", "250.00", "POS 4411 ACME")];
    let book = vec![rec("k1", "2024-04-02", "250.00", "Office chairs")];

    let (rules_only, _) = reconciler(&test_config(), None);
    let baseline = rules_only.reconcile(&bank, &book).await.unwrap();
    assert_eq!(baseline.yellow.len(), 1);

    let oracle = Arc::new(MockOracle::fixed(
        "{'green': [{'bank_id': 'b1', 'book_id': 'k1', 'note': 'ACME sells office chairs'}]}",
    ));
    let (assisted, _) = reconciler(&test_config(), Some(oracle));
    let report = assisted.reconcile(&bank, &book).await.unwrap();

    assert_eq!(report.green.len(), 1);
    assert_eq!(report.green[0].source(), VerdictSource::Oracle);
    assert_eq!(report.green[0].bucket(), Bucket::Green);
}

#[tokio::test]
async fn echoed_format_example_does_not_hide_the_answer() {
    let raw = r#"Use this format: {"green": [{"bank_id": "...", "book_id": "..."}]}
        Answer:
        {"green": [{"bank_id": "b1", "book_id": "k1", "note": "same invoice"}],
         "yellow": [{"bank_id": "b2", "book_id": "k2", "adjustment": "Rename narration"}],
         "red": [{"side": "bank", "id": "b4"}]}"#;
    let oracle = Arc::new(MockOracle::fixed(raw));
    let (reconciler, _) = reconciler(&test_config(), Some(oracle));
    let (bank, book) = grouped_ledgers();

    let report = reconciler.reconcile(&bank, &book).await.unwrap();

    assert_coverage(&report, &bank, &book);
    assert_eq!(report.chunks[0].discarded_entries, 0);
    let from_oracle = report
        .verdicts()
        .filter(|v| v.source() == VerdictSource::Oracle)
        .count();
    assert_eq!(from_oracle, 3);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let raw = r#"{"green": [{"bank_id": "b1", "book_id": "k1"}], "yellow": [], "red": []}"#;
    let oracle = Arc::new(MockOracle::flaky(2, raw));
    let (reconciler, _) = reconciler(&test_config(), Some(oracle.clone()));
    let bank = vec![rec("b1", "2024-01-10", "100.00", "Invoice 123 Payment")];
    let book = vec![rec("k1", "2024-01-12", "100.05", "Payment for Invoice 123")];

    let report = reconciler.reconcile(&bank, &book).await.unwrap();

    assert!(!report.degraded);
    assert_eq!(report.chunks[0].mode, ChunkMode::OracleAssisted);
    assert_eq!(report.chunks[0].oracle_attempts, 3);
    assert_eq!(oracle.calls(), 3);
}

#[tokio::test]
async fn unparseable_output_keeps_raw_response_for_inspection() {
    let oracle = Arc::new(MockOracle::fixed("Sorry, I cannot produce JSON today."));
    let (reconciler, recorder) = reconciler(&test_config(), Some(oracle.clone()));
    let (bank, book) = grouped_ledgers();

    let report = reconciler.reconcile(&bank, &book).await.unwrap();

    assert_coverage(&report, &bank, &book);
    assert!(report.degraded);
    assert_eq!(oracle.calls(), 1);
    let entries = recorder.entries();
    assert_eq!(entries.len(), 1);
    assert!(matches!(entries[0].outcome, ResponseOutcome::Unparseable { .. }));
    assert_eq!(
        entries[0].raw_response.as_deref(),
        Some("Sorry, I cannot produce JSON today.")
    );
}

/// Tracks how many invocations overlap.
struct GaugedOracle {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ClassificationOracle for GaugedOracle {
    fn name(&self) -> &str {
        "gauged"
    }

    async fn invoke(&self, _prompt: &OraclePrompt) -> Result<String, OracleError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(r#"{"green": [], "yellow": [], "red": []}"#.to_string())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_oracle_calls_are_capped() {
    let mut config = test_config();
    config.chunking.chunk_size = 5;
    config.oracle.max_concurrent_calls = 2;
    let oracle = Arc::new(GaugedOracle {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let (reconciler, _) = reconciler(&config, Some(oracle.clone()));
    let (bank, book) = sample_ledgers(60);

    let report = reconciler.reconcile(&bank, &book).await.unwrap();

    assert_coverage(&report, &bank, &book);
    assert!(report.chunks.len() > 2);
    assert!(oracle.peak.load(Ordering::SeqCst) <= 2);
    assert!(oracle.peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn cancellation_yields_partial_report() {
    let oracle = Arc::new(MockOracle::silent().with_delay(Duration::from_secs(30)));
    let (reconciler, _) = reconciler(&small_chunks(), Some(oracle));
    let (bank, book) = grouped_ledgers();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        reconciler.reconcile_until_cancelled(&bank, &book, cancel),
    )
    .await
    .expect("cancelled run should finish promptly")
    .unwrap();

    assert!(report.partial);
    assert!(!report.unprocessed.is_empty());
    assert_eq!(report.summary.unprocessed, report.unprocessed.len());
    assert_coverage(&report, &bank, &book);
}
