//! # papersim Storage
//!
//! Persistence and lifecycle for the papersim index:
//!
//! - [`IndexCache`] - versioned, checksummed on-disk artifact generations
//! - [`JsonlCorpus`] - corpus collaborator backed by a JSON-lines file
//! - [`RecommendationEngine`] - owns the published artifact, rebuilds, ingestion and queries

pub mod cache;
pub mod corpus;
pub mod engine;

pub use cache::{CacheMetadata, IndexCache, FORMAT_VERSION};
pub use corpus::{read_jsonl, JsonlCorpus};
pub use engine::{EngineState, EngineStats, IngestReport, RebuildOutcome, RecommendationEngine};
