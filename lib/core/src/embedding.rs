//! Text embedding with an ordered model fallback chain.
//!
//! An [`EmbeddingProvider`] owns exactly one active model for its whole
//! lifetime. Vectors from different models are never mixed: the model name
//! travels with every artifact, and a mismatch forces a full rebuild.
//!
//! The built-in models are feature-hashing embedders. They need no network
//! and are deterministic, which keeps rebuilds reproducible:
//!
//! - [`IdfHashingModel`] hashes words and bigrams weighted by an IDF table
//!   learned from a scientific vocabulary. It is the preferred model and
//!   fails to load when its table is missing.
//! - [`HashingModel`] hashes words, optional bigrams and character trigrams
//!   with fixed weights and always loads.

use crate::config::EmbeddingConfig;
use crate::paper::Paper;
use crate::vector::{normalize_in_place, EmbeddingMatrix, Vector};
use crate::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A loaded embedding model.
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Raw (not yet normalized) embedding of pre-normalized text.
    fn embed_one(&self, text: &str) -> Vec<f32>;
}

/// Something that can produce an [`EmbeddingModel`], or fail trying.
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> Result<Box<dyn EmbeddingModel>>;
}

/// Configuration entry for one model in the fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSpec {
    IdfHashing {
        name: String,
        vocabulary_path: PathBuf,
        dimension: usize,
    },
    Hashing {
        name: String,
        dimension: usize,
        #[serde(default)]
        bigrams: bool,
        #[serde(default = "default_true")]
        trigrams: bool,
    },
}

fn default_true() -> bool {
    true
}

impl ModelSpec {
    pub fn dimension(&self) -> usize {
        match self {
            ModelSpec::IdfHashing { dimension, .. } | ModelSpec::Hashing { dimension, .. } => *dimension,
        }
    }

    pub fn spec_name(&self) -> &str {
        match self {
            ModelSpec::IdfHashing { name, .. } | ModelSpec::Hashing { name, .. } => name,
        }
    }
}

impl ModelLoader for ModelSpec {
    fn name(&self) -> &str {
        self.spec_name()
    }

    fn load(&self) -> Result<Box<dyn EmbeddingModel>> {
        match self {
            ModelSpec::IdfHashing {
                name,
                vocabulary_path,
                dimension,
            } => Ok(Box::new(IdfHashingModel::load(name, vocabulary_path, *dimension)?)),
            ModelSpec::Hashing {
                name,
                dimension,
                bigrams,
                trigrams,
            } => Ok(Box::new(HashingModel::new(name, *dimension, *bigrams, *trigrams)?)),
        }
    }
}

/// Embeds text with the first model of a fallback chain that loads.
pub struct EmbeddingProvider {
    model: Box<dyn EmbeddingModel>,
    batch_size: usize,
}

impl EmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let loaders: Vec<&dyn ModelLoader> = config.models.iter().map(|m| m as &dyn ModelLoader).collect();
        Self::from_loaders(&loaders, config.batch_size)
    }

    /// Try `loaders` in order and keep the first model that loads.
    pub fn from_loaders(loaders: &[&dyn ModelLoader], batch_size: usize) -> Result<Self> {
        let mut attempted = Vec::with_capacity(loaders.len());
        for loader in loaders {
            attempted.push(loader.name().to_string());
            match loader.load() {
                Ok(model) if model.dimension() > 0 => {
                    if attempted.len() > 1 {
                        warn!(
                            "Using fallback embedding model {} (dim {})",
                            model.name(),
                            model.dimension()
                        );
                    } else {
                        info!("Using embedding model {} (dim {})", model.name(), model.dimension());
                    }
                    return Ok(Self::with_model(model, batch_size));
                }
                Ok(model) => {
                    warn!("Embedding model {} reports zero dimension, skipping", model.name());
                }
                Err(e) => {
                    warn!("Embedding model {} unavailable: {}", loader.name(), e);
                }
            }
        }
        Err(Error::ModelUnavailable { attempted })
    }

    pub fn with_model(model: Box<dyn EmbeddingModel>, batch_size: usize) -> Self {
        Self {
            model,
            batch_size: batch_size.max(1),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    /// L2-normalized embedding of `text`. Empty text gives the zero vector.
    pub fn embed(&self, text: &str) -> Result<Vector> {
        let normalized = crate::paper::normalize_text(text);
        self.embed_normalized(&normalized).map(Vector::new)
    }

    fn embed_normalized(&self, text: &str) -> Result<Vec<f32>> {
        let mut raw = self.model.embed_one(text);
        if raw.len() != self.dimension() {
            return Err(Error::InvalidDimension {
                expected: self.dimension(),
                actual: raw.len(),
            });
        }
        normalize_in_place(&mut raw);
        Ok(raw)
    }

    /// Embed many texts; row `i` of the result belongs to `texts[i]`.
    ///
    /// Texts are processed in chunks of `batch_size`, chunks in parallel.
    pub fn embed_batch(&self, texts: &[&str]) -> Result<EmbeddingMatrix> {
        let chunks: Vec<Vec<Vec<f32>>> = texts
            .par_chunks(self.batch_size)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|text| self.embed_normalized(&crate::paper::normalize_text(text)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let mut matrix = EmbeddingMatrix::with_capacity(self.dimension(), texts.len());
        for row in chunks.iter().flatten() {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    pub fn embed_papers(&self, papers: &[Paper]) -> Result<EmbeddingMatrix> {
        let texts: Vec<String> = papers.iter().map(Paper::embedding_text).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        self.embed_batch(&refs)
    }
}

impl std::fmt::Debug for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingProvider")
            .field("model", &self.model.name())
            .field("dimension", &self.model.dimension())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is", "it",
    "its", "of", "on", "or", "that", "the", "their", "this", "to", "was", "we", "were", "which",
    "with", "our", "these", "can", "using", "also", "than", "such",
];

fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(t))
        .collect()
}

fn feature_hash(feature: &str, salt: u8) -> u64 {
    let mut hasher = DefaultHasher::new();
    salt.hash(&mut hasher);
    feature.hash(&mut hasher);
    hasher.finish()
}

/// Signed feature hashing: bucket from the low bits, sign from the top bit.
#[inline]
fn accumulate(vector: &mut [f32], feature: &str, salt: u8, weight: f32) {
    let hash = feature_hash(feature, salt);
    let pos = (hash % vector.len() as u64) as usize;
    let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
    vector[pos] += sign * weight;
}

const WORD_SALT: u8 = 1;
const BIGRAM_SALT: u8 = 2;
const TRIGRAM_SALT: u8 = 3;

/// Fixed-weight feature hashing over words, bigrams and character trigrams.
#[derive(Debug, Clone)]
pub struct HashingModel {
    name: String,
    dimension: usize,
    bigrams: bool,
    trigrams: bool,
}

impl HashingModel {
    pub fn new(name: &str, dimension: usize, bigrams: bool, trigrams: bool) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidConfig(format!("model {} has zero dimension", name)));
        }
        Ok(Self {
            name: name.to_string(),
            dimension,
            bigrams,
            trigrams,
        })
    }
}

impl EmbeddingModel for HashingModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens = tokenize(text);

        for token in &tokens {
            accumulate(&mut vector, token, WORD_SALT, 2.0);
        }
        if self.bigrams {
            for pair in tokens.windows(2) {
                accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), BIGRAM_SALT, 1.5);
            }
        }
        if self.trigrams {
            for token in &tokens {
                let padded: Vec<char> = format!(" {} ", token).chars().collect();
                for window in padded.windows(3) {
                    let trigram: String = window.iter().collect();
                    accumulate(&mut vector, &trigram, TRIGRAM_SALT, 0.5);
                }
            }
        }
        vector
    }
}

/// Feature hashing weighted by inverse document frequency.
///
/// The vocabulary file is a JSON object mapping tokens to IDF weights.
/// Tokens missing from it get the largest known weight.
#[derive(Debug, Clone)]
pub struct IdfHashingModel {
    name: String,
    dimension: usize,
    idf: HashMap<String, f32>,
    unknown_idf: f32,
}

impl IdfHashingModel {
    pub fn load(name: &str, vocabulary_path: &Path, dimension: usize) -> Result<Self> {
        let raw = std::fs::read_to_string(vocabulary_path)?;
        let idf: HashMap<String, f32> = serde_json::from_str(&raw)
            .map_err(|e| Error::Serialization(format!("{}: {}", vocabulary_path.display(), e)))?;
        Self::from_table(name, idf, dimension)
    }

    pub fn from_table(name: &str, idf: HashMap<String, f32>, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidConfig(format!("model {} has zero dimension", name)));
        }
        if idf.is_empty() {
            return Err(Error::InvalidConfig(format!("model {} has an empty vocabulary", name)));
        }
        let unknown_idf = idf.values().copied().fold(0.0f32, f32::max).max(1.0);
        Ok(Self {
            name: name.to_string(),
            dimension,
            idf,
            unknown_idf,
        })
    }

    fn weight(&self, token: &str) -> f32 {
        self.idf.get(token).copied().unwrap_or(self.unknown_idf)
    }
}

impl EmbeddingModel for IdfHashingModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens = tokenize(text);
        for token in &tokens {
            accumulate(&mut vector, token, WORD_SALT, self.weight(token));
        }
        for pair in tokens.windows(2) {
            let weight = 0.5 * (self.weight(pair[0]) + self.weight(pair[1]));
            accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), BIGRAM_SALT, weight);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Broken(&'static str);

    impl ModelLoader for Broken {
        fn name(&self) -> &str {
            self.0
        }

        fn load(&self) -> Result<Box<dyn EmbeddingModel>> {
            Err(Error::Source("weights not found".into()))
        }
    }

    fn hashing(name: &str, dim: usize) -> ModelSpec {
        ModelSpec::Hashing {
            name: name.to_string(),
            dimension: dim,
            bigrams: true,
            trigrams: true,
        }
    }

    #[test]
    fn test_fallback_picks_first_loadable_model() {
        let broken = Broken("domain-model");
        let first = hashing("second", 64);
        let second = hashing("third", 32);
        let provider = EmbeddingProvider::from_loaders(&[&broken, &first, &second], 8).unwrap();
        assert_eq!(provider.model_name(), "second");
        assert_eq!(provider.dimension(), 64);
    }

    #[test]
    fn test_all_fallbacks_failing_is_model_unavailable() {
        let a = Broken("a");
        let b = Broken("b");
        match EmbeddingProvider::from_loaders(&[&a, &b], 8) {
            Err(Error::ModelUnavailable { attempted }) => assert_eq!(attempted, vec!["a", "b"]),
            other => panic!("unexpected: {:?}", other.map(|p| p.model_name().to_string())),
        }
    }

    #[test]
    fn test_default_chain_falls_back_without_vocabulary() {
        let mut config = EmbeddingConfig::default();
        if let ModelSpec::IdfHashing { vocabulary_path, .. } = &mut config.models[0] {
            *vocabulary_path = PathBuf::from("/nonexistent/papersim/vocabulary.json");
        }
        let provider = EmbeddingProvider::from_config(&config).unwrap();
        assert_eq!(provider.model_name(), "scientific-hash-512");
    }

    #[test]
    fn test_idf_model_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"quantum": 3.2, "learning": 1.1}}"#).unwrap();
        let spec = ModelSpec::IdfHashing {
            name: "idf".into(),
            vocabulary_path: file.path().to_path_buf(),
            dimension: 128,
        };
        let provider = EmbeddingProvider::from_loaders(&[&spec], 4).unwrap();
        assert_eq!(provider.model_name(), "idf");

        let empty = IdfHashingModel::from_table("empty", HashMap::new(), 16);
        assert!(empty.is_err());
    }

    #[test]
    fn test_embeddings_are_normalized_and_deterministic() {
        let provider = EmbeddingProvider::from_loaders(&[&hashing("h", 128)], 2).unwrap();
        let a = provider.embed("Quantum error correction with surface codes").unwrap();
        let b = provider.embed("  quantum ERROR correction with   surface codes ").unwrap();
        assert_eq!(a, b);
        assert!((crate::simd::norm_simd(a.as_slice()) - 1.0).abs() < 1e-5);

        let empty = provider.embed("").unwrap();
        assert!(empty.as_slice().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_related_texts_score_higher() {
        let provider = EmbeddingProvider::from_loaders(&[&hashing("h", 512)], 2).unwrap();
        let q = provider.embed("graph neural networks for molecules").unwrap();
        let near = provider.embed("neural networks on molecular graphs").unwrap();
        let far = provider.embed("supernova light curves in galaxy surveys").unwrap();
        assert!(q.dot(&near) > q.dot(&far));
    }

    #[test]
    fn test_batch_preserves_order_across_chunks() {
        let provider = EmbeddingProvider::from_loaders(&[&hashing("h", 64)], 2).unwrap();
        let texts = ["alpha particles", "beta decay", "gamma rays", "delta functions", "epsilon"];
        let matrix = provider.embed_batch(&texts).unwrap();
        assert_eq!(matrix.rows(), texts.len());
        for (i, text) in texts.iter().enumerate() {
            assert_eq!(matrix.row(i), provider.embed(text).unwrap().as_slice());
        }
    }
}
