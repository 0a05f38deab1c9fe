//! Chunk planning.
//!
//! Records from both sides are sorted by date and cut into date clusters:
//! a new cluster starts wherever two consecutive dates are further apart
//! than the date tolerance. Any two records that could form a candidate
//! pair therefore always share a cluster. Whole clusters are then packed
//! into chunks of at most `chunk_size` records per side; only a cluster
//! that is larger than a chunk on its own gets split.

use crate::error::ReconError;
use crate::models::{RecordRef, Side, TransactionRecord};
use chrono::NaiveDate;

/// A bounded batch of records processed by one oracle call.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: usize,
    /// Bank records in input order.
    pub bank: Vec<TransactionRecord>,
    /// Book records in input order.
    pub book: Vec<TransactionRecord>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.bank.len() + self.book.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bank.is_empty() && self.book.is_empty()
    }

    pub fn record(&self, side: Side, id: &str) -> Option<&TransactionRecord> {
        let records = match side {
            Side::Bank => &self.bank,
            Side::Book => &self.book,
        };
        records.iter().find(|r| r.id == id)
    }

    pub fn record_refs(&self) -> Vec<RecordRef> {
        self.bank
            .iter()
            .map(|r| RecordRef::bank(r.id.clone()))
            .chain(self.book.iter().map(|r| RecordRef::book(r.id.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    /// Date clusters that exceeded the chunk size and had to be cut.
    pub split_clusters: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    chunk_size: usize,
    date_window_days: i64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    date: NaiveDate,
    side: Side,
    index: usize,
}

#[derive(Default)]
struct PendingChunk {
    bank: Vec<usize>,
    book: Vec<usize>,
}

impl PendingChunk {
    fn count(&self, side: Side) -> usize {
        match side {
            Side::Bank => self.bank.len(),
            Side::Book => self.book.len(),
        }
    }

    fn push(&mut self, entry: Entry) {
        match entry.side {
            Side::Bank => self.bank.push(entry.index),
            Side::Book => self.book.push(entry.index),
        }
    }

    fn is_empty(&self) -> bool {
        self.bank.is_empty() && self.book.is_empty()
    }
}

impl ChunkPlanner {
    /// `chunk_size` is the per-side bound; `date_window_days` should be the
    /// candidate date tolerance so that clusters stay closed under pairing.
    pub fn new(chunk_size: i64, date_window_days: i64) -> Result<Self, ReconError> {
        if chunk_size <= 0 {
            return Err(ReconError::ConfigError(format!(
                "chunk size must be positive, got {}",
                chunk_size
            )));
        }
        Ok(Self {
            chunk_size: chunk_size as usize,
            date_window_days: date_window_days.max(0),
        })
    }

    pub fn plan(&self, bank: &[TransactionRecord], book: &[TransactionRecord]) -> ChunkPlan {
        let mut entries: Vec<Entry> = bank
            .iter()
            .enumerate()
            .map(|(index, r)| Entry {
                date: r.date,
                side: Side::Bank,
                index,
            })
            .chain(book.iter().enumerate().map(|(index, r)| Entry {
                date: r.date,
                side: Side::Book,
                index,
            }))
            .collect();
        entries.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then(a.side.cmp(&b.side))
                .then(a.index.cmp(&b.index))
        });

        let mut clusters: Vec<Vec<Entry>> = Vec::new();
        for entry in entries {
            let within_window = |prev: &Entry| {
                (entry.date - prev.date).num_days() <= self.date_window_days
            };
            match clusters.last_mut() {
                Some(cluster) if cluster.last().is_some_and(|p| within_window(p)) => {
                    cluster.push(entry)
                }
                _ => clusters.push(vec![entry]),
            }
        }

        let mut plan = ChunkPlan::default();
        let mut pending = PendingChunk::default();

        for cluster in clusters {
            let bank_count = cluster.iter().filter(|e| e.side == Side::Bank).count();
            let book_count = cluster.len() - bank_count;

            if pending.bank.len() + bank_count <= self.chunk_size
                && pending.book.len() + book_count <= self.chunk_size
            {
                cluster.into_iter().for_each(|e| pending.push(e));
                continue;
            }

            self.flush(&mut plan, &mut pending, bank, book);

            if bank_count <= self.chunk_size && book_count <= self.chunk_size {
                cluster.into_iter().for_each(|e| pending.push(e));
                continue;
            }

            plan.split_clusters += 1;
            tracing::warn!(
                bank_records = bank_count,
                book_records = book_count,
                chunk_size = self.chunk_size,
                first_date = %cluster[0].date,
                "Date cluster exceeds chunk size, splitting in date order"
            );
            for entry in cluster {
                if pending.count(entry.side) == self.chunk_size {
                    self.flush(&mut plan, &mut pending, bank, book);
                }
                pending.push(entry);
            }
        }
        self.flush(&mut plan, &mut pending, bank, book);

        tracing::debug!(
            chunks = plan.chunks.len(),
            split_clusters = plan.split_clusters,
            "Chunk plan built"
        );

        plan
    }

    fn flush(
        &self,
        plan: &mut ChunkPlan,
        pending: &mut PendingChunk,
        bank: &[TransactionRecord],
        book: &[TransactionRecord],
    ) {
        if pending.is_empty() {
            return;
        }
        let mut taken = std::mem::take(pending);
        taken.bank.sort_unstable();
        taken.book.sort_unstable();

        plan.chunks.push(Chunk {
            id: plan.chunks.len(),
            bank: taken.bank.iter().map(|&i| bank[i].clone()).collect(),
            book: taken.book.iter().map(|&i| book[i].clone()).collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn rec(id: &str, day: u32) -> TransactionRecord {
        TransactionRecord::new(
            id,
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            Decimal::new(1000, 2),
            "payment",
        )
    }

    #[test]
    fn non_positive_chunk_size_is_config_error() {
        assert!(matches!(
            ChunkPlanner::new(0, 5),
            Err(ReconError::ConfigError(_))
        ));
        assert!(matches!(
            ChunkPlanner::new(-1, 5),
            Err(ReconError::ConfigError(_))
        ));
    }

    #[test]
    fn small_input_is_a_single_chunk() {
        let bank = vec![rec("b1", 1), rec("b2", 28)];
        let book = vec![rec("k1", 2)];
        let plan = ChunkPlanner::new(50, 5).unwrap().plan(&bank, &book);
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].bank.len(), 2);
        assert_eq!(plan.chunks[0].book.len(), 1);
        assert_eq!(plan.split_clusters, 0);
    }

    #[test]
    fn empty_input_has_no_chunks() {
        let plan = ChunkPlanner::new(10, 5).unwrap().plan(&[], &[]);
        assert!(plan.chunks.is_empty());
    }

    #[test]
    fn date_neighbours_stay_together() {
        // Input order interleaves two far-apart date groups.
        let bank = vec![rec("b-early", 1), rec("b-late", 25), rec("b-early2", 2)];
        let book = vec![rec("k-late", 27), rec("k-early", 3), rec("k-early2", 1)];
        let plan = ChunkPlanner::new(2, 5).unwrap().plan(&bank, &book);

        assert_eq!(plan.chunks.len(), 2);
        let first: Vec<&str> = plan.chunks[0].bank.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(first, vec!["b-early", "b-early2"]);
        let first_book: Vec<&str> = plan.chunks[0].book.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(first_book, vec!["k-early", "k-early2"]);
        assert_eq!(plan.chunks[1].bank[0].id, "b-late");
        assert_eq!(plan.chunks[1].book[0].id, "k-late");
    }

    #[test]
    fn oversized_cluster_is_split_and_bounded() {
        let bank: Vec<_> = (1..=5).map(|d| rec(&format!("b{}", d), d)).collect();
        let book: Vec<_> = (1..=5).map(|d| rec(&format!("k{}", d), d)).collect();
        let plan = ChunkPlanner::new(2, 5).unwrap().plan(&bank, &book);

        assert_eq!(plan.split_clusters, 1);
        assert_eq!(plan.chunks.len(), 3);
        for chunk in &plan.chunks {
            assert!(chunk.bank.len() <= 2 && chunk.book.len() <= 2);
        }
        let total: usize = plan.chunks.iter().map(Chunk::len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn planning_is_deterministic() {
        let bank: Vec<_> = (1..=20).map(|d| rec(&format!("b{}", d), d)).collect();
        let book: Vec<_> = (1..=20).rev().map(|d| rec(&format!("k{}", d), d)).collect();
        let planner = ChunkPlanner::new(3, 1).unwrap();
        assert_eq!(planner.plan(&bank, &book).chunks, planner.plan(&bank, &book).chunks);
    }
}
