//! Engine configuration.
//!
//! Every weight and horizon below is a default, not a tuned constant. A
//! JSON file may override any subset of fields.

use crate::embedding::ModelSpec;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub clustering: ClusterConfig,
    pub recency: RecencyConfig,
    pub popularity: PopularityConfig,
    pub fusion: FusionConfig,
}

impl EngineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.models.is_empty() {
            return Err(Error::InvalidConfig("embedding.models must not be empty".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::InvalidConfig("embedding.batch_size must be > 0".into()));
        }
        for spec in &self.embedding.models {
            if spec.dimension() == 0 {
                return Err(Error::InvalidConfig(format!(
                    "model {} has zero dimension",
                    spec.spec_name()
                )));
            }
        }
        if self.index.hnsw.max_connections == 0 || self.index.hnsw.max_layers == 0 {
            return Err(Error::InvalidConfig(
                "index.hnsw.max_connections and max_layers must be > 0".into(),
            ));
        }
        if self.clustering.max_iterations == 0 || self.clustering.n_init == 0 {
            return Err(Error::InvalidConfig(
                "clustering.max_iterations and n_init must be > 0".into(),
            ));
        }
        if !(self.recency.horizon_days > 0.0) {
            return Err(Error::InvalidConfig("recency.horizon_days must be > 0".into()));
        }
        for (name, value) in [
            ("recency.floor", self.recency.floor),
            ("recency.missing_score", self.recency.missing_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!("{} must be within [0, 1]", name)));
            }
        }
        if self.popularity.size_saturation == 0 {
            return Err(Error::InvalidConfig("popularity.size_saturation must be > 0".into()));
        }
        let weights = [
            ("popularity.recency_weight", self.popularity.recency_weight),
            ("popularity.size_weight", self.popularity.size_weight),
            ("fusion.cluster_time_weight", self.fusion.cluster_time_weight),
            ("fusion.cluster_popularity_weight", self.fusion.cluster_popularity_weight),
            ("fusion.hybrid_content_weight", self.fusion.hybrid_content_weight),
            ("fusion.hybrid_cluster_weight", self.fusion.hybrid_cluster_weight),
        ];
        for (name, value) in weights {
            if !(value >= 0.0) {
                return Err(Error::InvalidConfig(format!("{} must be >= 0", name)));
            }
        }
        if self.fusion.hybrid_candidate_factor == 0 {
            return Err(Error::InvalidConfig("fusion.hybrid_candidate_factor must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Fallback chain, most preferred first
    pub models: Vec<ModelSpec>,
    /// Texts per embedding chunk
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            models: vec![
                ModelSpec::IdfHashing {
                    name: "scivocab-idf-768".to_string(),
                    vocabulary_path: PathBuf::from("./data/vocabulary.json"),
                    dimension: 768,
                },
                ModelSpec::Hashing {
                    name: "scientific-hash-512".to_string(),
                    dimension: 512,
                    bigrams: true,
                    trigrams: true,
                },
                ModelSpec::Hashing {
                    name: "general-hash-256".to_string(),
                    dimension: 256,
                    bigrams: false,
                    trigrams: true,
                },
            ],
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Brute-force inner product, exact
    #[default]
    Flat,
    /// Hierarchical navigable small world graph, approximate
    Hnsw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    pub kind: IndexKind,
    pub hnsw: HnswConfig,
    /// Seed for HNSW level assignment
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::Flat,
            hnsw: HnswConfig::default(),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HnswConfig {
    pub max_connections: usize,
    pub max_layers: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            max_layers: 4,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Requested cluster count, capped at half the corpus
    pub k: usize,
    pub seed: u64,
    pub max_iterations: usize,
    /// Stop once no centroid moves more than this (squared L2)
    pub tolerance: f32,
    /// Independent k-means++ restarts; lowest inertia wins
    pub n_init: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            k: 20,
            seed: 42,
            max_iterations: 100,
            tolerance: 1e-4,
            n_init: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecencyConfig {
    /// Age at which the linear decay reaches zero (before flooring)
    pub horizon_days: f64,
    pub floor: f32,
    /// Score for papers without a usable publication date
    pub missing_score: f32,
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self {
            horizon_days: 365.0,
            floor: 0.1,
            missing_score: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PopularityConfig {
    pub recency_weight: f32,
    pub size_weight: f32,
    /// Member count at which the size component saturates
    pub size_saturation: usize,
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            recency_weight: 0.7,
            size_weight: 0.3,
            size_saturation: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub cluster_time_weight: f32,
    pub cluster_popularity_weight: f32,
    pub hybrid_content_weight: f32,
    pub hybrid_cluster_weight: f32,
    /// Each strategy fetches `k * factor` candidates before hybrid merging
    pub hybrid_candidate_factor: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cluster_time_weight: 0.6,
            cluster_popularity_weight: 0.4,
            hybrid_content_weight: 0.7,
            hybrid_cluster_weight: 0.3,
            hybrid_candidate_factor: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.embedding.models.len(), 3);
        assert_eq!(config.index.kind, IndexKind::Flat);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"clustering": {{"k": 5}}, "index": {{"kind": "hnsw"}}}}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.clustering.k, 5);
        assert_eq!(config.clustering.seed, 42);
        assert_eq!(config.index.kind, IndexKind::Hnsw);
        assert_eq!(config.fusion, FusionConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = EngineConfig::default();
        config.recency.floor = 1.5;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = EngineConfig::default();
        config.embedding.models.clear();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fusion.hybrid_cluster_weight = -0.1;
        assert!(config.validate().is_err());
    }
}
