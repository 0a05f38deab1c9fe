//! Common test utilities for reconciliation-engine integration tests.

use chrono::NaiveDate;
use reconciliation_engine::config::ReconciliationConfig;
use reconciliation_engine::models::{RecordRef, ReconciliationReport, TransactionRecord};
use reconciliation_engine::services::{ClassificationOracle, MemoryRecorder, Reconciler};
use rust_decimal::Decimal;
use service_core::retry::RetryConfig;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_engine=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Default tunables with millisecond backoffs.
pub fn test_config() -> ReconciliationConfig {
    let mut config = ReconciliationConfig::default();
    config.service_name = "reconciliation-engine-test".to_string();
    config.oracle.retry = RetryConfig {
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        add_jitter: false,
    };
    config
}

pub fn rec(id: &str, date: &str, amount: &str, narration: &str) -> TransactionRecord {
    TransactionRecord::new(
        id,
        NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("valid test date"),
        Decimal::from_str(amount).expect("valid test amount"),
        narration,
    )
}

#[allow(dead_code)]
pub fn reconciler(
    config: &ReconciliationConfig,
    oracle: Option<Arc<dyn ClassificationOracle>>,
) -> (Reconciler, Arc<MemoryRecorder>) {
    init_tracing();
    let recorder = Arc::new(MemoryRecorder::new());
    let reconciler =
        Reconciler::new(config, oracle, recorder.clone()).expect("Failed to build reconciler");
    (reconciler, recorder)
}

/// Every input record appears in exactly one verdict, or is listed as
/// unprocessed.
#[allow(dead_code)]
pub fn assert_coverage(
    report: &ReconciliationReport,
    bank: &[TransactionRecord],
    book: &[TransactionRecord],
) {
    let mut seen: HashMap<RecordRef, usize> = HashMap::new();
    for record in report
        .verdicts()
        .flat_map(|v| v.records())
        .chain(report.unprocessed.iter().cloned())
    {
        *seen.entry(record).or_default() += 1;
    }

    for r in bank {
        assert_eq!(
            seen.remove(&RecordRef::bank(r.id.clone())),
            Some(1),
            "bank record {} not covered exactly once",
            r.id
        );
    }
    for r in book {
        assert_eq!(
            seen.remove(&RecordRef::book(r.id.clone())),
            Some(1),
            "book record {} not covered exactly once",
            r.id
        );
    }
    assert!(seen.is_empty(), "report mentions unknown records: {:?}", seen);
}

/// A month of bank activity with matching book entries, a few mismatches
/// and some one-sided records.
#[allow(dead_code)]
pub fn sample_ledgers(count: usize) -> (Vec<TransactionRecord>, Vec<TransactionRecord>) {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date");
    let mut bank = Vec::new();
    let mut book = Vec::new();

    for i in 0..count {
        let date = base + chrono::Duration::days((i * 3 % 90) as i64);
        let amount = Decimal::new(10_000 + (i as i64) * 137, 2);
        bank.push(TransactionRecord::new(
            format!("B{:04}", i),
            date,
            amount,
            format!("Invoice {} payment from customer {}", 1000 + i, i % 7),
        ));

        match i % 5 {
            // Missing in the books.
            4 => {}
            // Reworded narration, booked a day later.
            3 => book.push(TransactionRecord::new(
                format!("K{:04}", i),
                date + chrono::Duration::days(1),
                amount,
                format!("Office supplies order {}", i),
            )),
            _ => book.push(TransactionRecord::new(
                format!("K{:04}", i),
                date + chrono::Duration::days((i % 3) as i64),
                amount,
                format!("Payment customer {} invoice {}", i % 7, 1000 + i),
            )),
        }
    }

    // Book-only entries.
    for j in 0..count / 10 {
        book.push(TransactionRecord::new(
            format!("KX{:03}", j),
            base + chrono::Duration::days((j * 11) as i64),
            Decimal::new(99_999 + j as i64, 2),
            "Accrual reversal",
        ));
    }

    (bank, book)
}
