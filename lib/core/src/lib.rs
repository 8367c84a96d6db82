//! # papersim Core
//!
//! Core library for the papersim recommendation index.
//!
//! - [`EmbeddingProvider`] - turns paper text into normalized vectors, with model fallback
//! - [`VectorIndex`] - exact or HNSW nearest-neighbor search with an explicit slot table
//! - [`ClusterModel`] - seeded k-means topics with per-cluster popularity
//! - [`Recommender`] - content, cluster and hybrid recommendation strategies
//! - [`Artifact`] - one immutable, servable bundle of all of the above
//!
//! ## Example
//!
//! ```rust
//! use papersim_core::{Artifact, EmbeddingProvider, EngineConfig, Method, Paper, Recommender};
//!
//! let config = EngineConfig::default();
//! let provider = EmbeddingProvider::from_config(&config.embedding).unwrap();
//! let papers = vec![
//!     Paper::new("a", "Quantum error correction", "Surface codes"),
//!     Paper::new("b", "Quantum computing", "Superconducting qubits"),
//!     Paper::new("c", "Protein folding", "Structure prediction"),
//! ];
//! let artifact = Artifact::build(papers, &provider, &config, chrono::Utc::now()).unwrap();
//!
//! let recs = Recommender::new(&artifact, &config.fusion).recommend("a", Method::Content, 2);
//! assert!(recs.results.iter().all(|r| r.paper_id != "a"));
//! ```

pub mod artifact;
pub mod background;
pub mod cluster;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod hnsw;
pub mod index;
pub mod paper;
pub mod recency;
pub mod vector;

/// SIMD-optimized vector operations
///
/// Provides hardware-accelerated kernels:
/// - AVX2/FMA on x86_64
/// - NEON on ARM64/Apple Silicon
pub mod simd;

pub use artifact::{Artifact, ArtifactParts, BuildSettings, ClusterSummary, PaperMeta};
pub use background::{BackgroundJob, BackgroundWorker, JobHandle};
pub use cluster::{effective_k, ClusterModel, KMeans};
pub use config::{
    ClusterConfig, EmbeddingConfig, EngineConfig, FusionConfig, HnswConfig, IndexConfig, IndexKind,
    PopularityConfig, RecencyConfig,
};
pub use embedding::{EmbeddingModel, EmbeddingProvider, HashingModel, IdfHashingModel, ModelLoader, ModelSpec};
pub use error::{Error, Result};
pub use fusion::{Method, QueryStatus, RecommendationResult, Recommendations, Recommender, ScoreBreakdown};
pub use hnsw::HnswIndex;
pub use index::{FlatIndex, NearestNeighbors, Neighbor, VectorIndex};
pub use paper::{InMemoryCorpus, Paper, PaperFilter, PaperSource};
pub use vector::{EmbeddingMatrix, Vector};
