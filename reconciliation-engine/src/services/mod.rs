//! Services module for reconciliation-engine.

pub mod aggregator;
pub mod candidates;
pub mod chunking;
pub mod ingest;
pub mod metrics;
pub mod oracle;
pub mod orchestrator;
pub mod policy;
pub mod reconciler;
pub mod recorder;
pub mod similarity;

pub use aggregator::{AggregationInput, ResultAggregator};
pub use candidates::{CandidateGenerator, CandidateSet};
pub use chunking::{Chunk, ChunkPlan, ChunkPlanner};
pub use ingest::load_records;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use oracle::{ClassificationOracle, MockOracle, OpenAiConfig, OpenAiOracle, OracleError};
pub use orchestrator::{ChunkOutcome, ClassificationOrchestrator};
pub use policy::{DeterministicClassifier, MatchPolicy};
pub use reconciler::Reconciler;
pub use recorder::{
    FileRecorder, MemoryRecorder, RecordedResponse, ResponseOutcome, ResponseRecorder,
    TracingRecorder,
};
pub use similarity::narration_similarity;
