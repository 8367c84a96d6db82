//! # papersim
//!
//! Semantic recommendation index for scientific papers.
//!
//! papersim embeds paper titles and abstracts, indexes the vectors for
//! nearest-neighbor search, groups them into topic clusters scored by
//! recency and size, and fuses both signals into ranked recommendations.
//! The whole state is persisted as a versioned, checksummed on-disk cache
//! that is rebuilt atomically.
//!
//! ## Quick Start
//!
//! ### As a CLI
//!
//! ```bash
//! papersim build --corpus papers.jsonl
//! papersim recommend --corpus papers.jsonl 2401.00001 --method hybrid -k 10
//! papersim search --corpus papers.jsonl quantum error correction
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use papersim::prelude::*;
//! use std::sync::Arc;
//!
//! let config = EngineConfig::default();
//! let provider = EmbeddingProvider::from_config(&config.embedding).unwrap();
//! let corpus = Arc::new(JsonlCorpus::new("papers.jsonl"));
//! let engine = RecommendationEngine::new(config, provider, corpus)
//!     .unwrap()
//!     .with_cache(IndexCache::new("./data/cache"));
//! engine.initialize().unwrap();
//!
//! let recs = engine.recommend("2401.00001", Method::Hybrid, 10);
//! if let Some(reason) = recs.reason() {
//!     eprintln!("no recommendations: {}", reason);
//! }
//! ```
//!
//! ## Crate Structure
//!
//! - `papersim-core` - embeddings, indexes, clustering, fusion, artifacts
//! - `papersim-storage` - on-disk cache, JSONL corpus, engine lifecycle

// Re-export core types
pub use papersim_core::{
    Artifact, ClusterModel, ClusterSummary, EmbeddingMatrix, EmbeddingProvider, EngineConfig, Error, FlatIndex,
    HnswIndex, InMemoryCorpus, IndexKind, Method, NearestNeighbors, Paper, PaperFilter, PaperSource, QueryStatus,
    RecommendationResult, Recommendations, Recommender, Result, Vector, VectorIndex,
};

// Re-export storage
pub use papersim_storage::{
    EngineState, EngineStats, IndexCache, IngestReport, JsonlCorpus, RebuildOutcome, RecommendationEngine,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Artifact, EmbeddingProvider, EngineConfig, EngineState, Error, IndexCache, InMemoryCorpus, JsonlCorpus,
        Method, Paper, PaperSource, QueryStatus, RecommendationEngine, Recommendations, Result,
    };
}

/// SIMD-optimized vector operations
pub mod simd {
    pub use papersim_core::simd::{dot_product_simd, norm_simd, squared_l2};
}
