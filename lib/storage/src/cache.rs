//! Versioned on-disk cache of the published artifact.
//!
//! Layout:
//!
//! ```text
//! <dir>/CURRENT                 name of the published generation
//! <dir>/gen-<millis>-<seq>/
//!     embeddings.bin            bincode EmbeddingMatrix
//!     index.bin                 bincode VectorIndex (with its slot table)
//!     clusters.bin              bincode assignments, centroids, popularity
//!     metadata.json             paper ids, build time, model, checksums
//! ```
//!
//! A save writes a complete new generation and only then repoints
//! `CURRENT`, so a failed save leaves the previous generation published.

use atomicwrites::{AtomicFile, OverwriteBehavior};
use chrono::{DateTime, Utc};
use papersim_core::artifact::{ArtifactParts, BuildSettings, PaperMeta};
use papersim_core::index::NearestNeighbors;
use papersim_core::{Artifact, EmbeddingMatrix, Error, RecencyConfig, Result, VectorIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub const FORMAT_VERSION: u32 = 2;

const CURRENT_FILE: &str = "CURRENT";
const EMBEDDINGS_FILE: &str = "embeddings.bin";
const INDEX_FILE: &str = "index.bin";
const CLUSTERS_FILE: &str = "clusters.bin";
const METADATA_FILE: &str = "metadata.json";
const GENERATION_PREFIX: &str = "gen-";

/// Small JSON record describing one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub format_version: u32,
    pub paper_ids: Vec<String>,
    pub papers: Vec<PaperMeta>,
    pub built_at: DateTime<Utc>,
    pub model_name: String,
    pub dimension: usize,
    pub cluster_count: usize,
    pub settings: BuildSettings,
    /// SHA-256 (hex) per binary file
    pub checksums: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ClusterFileRef<'a> {
    assignments: &'a [u32],
    centroids: &'a EmbeddingMatrix,
    popularity: &'a [f32],
}

#[derive(Deserialize)]
struct ClusterFile {
    assignments: Vec<u32>,
    centroids: EmbeddingMatrix,
    popularity: Vec<f32>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
        .write(|f| f.write_all(bytes))
        .map_err(|e| match e {
            atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => Error::Io(e),
        })
}

fn corrupt(context: impl std::fmt::Display) -> Error {
    Error::CacheCorrupt(context.to_string())
}

/// `gen-<millis>-<seq>` → `(millis, seq)`.
fn parse_generation(name: &str) -> Option<(i64, u64)> {
    let rest = name.strip_prefix(GENERATION_PREFIX)?;
    let (millis, seq) = rest.split_once('-')?;
    Some((millis.parse().ok()?, seq.parse().ok()?))
}

pub struct IndexCache {
    dir: PathBuf,
    /// Generations kept on disk, the published one included
    retention: usize,
    seq: AtomicU64,
}

impl IndexCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            retention: 2,
            seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_retention(mut self, generations: usize) -> Self {
        self.retention = generations.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Name of the published generation, if any.
    pub fn current_generation(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(self.dir.join(CURRENT_FILE)) {
            Ok(raw) => Ok(Some(raw.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All generation directories, oldest first.
    pub fn generations(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut generations: Vec<((i64, u64), String)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(key) = parse_generation(&name) {
                generations.push((key, name));
            }
        }
        generations.sort();
        Ok(generations.into_iter().map(|(_, name)| name).collect())
    }

    /// Persist `artifact` as a new generation and publish it.
    pub fn save(&self, artifact: &Artifact) -> Result<PathBuf> {
        self.save_with(artifact, |path, artifact| self.write_generation(path, artifact))
    }

    fn save_with<F>(&self, artifact: &Artifact, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path, &Artifact) -> Result<()>,
    {
        std::fs::create_dir_all(&self.dir)?;
        let (name, path) = self.fresh_generation()?;

        if let Err(e) = write(&path, artifact) {
            if let Err(cleanup) = std::fs::remove_dir_all(&path) {
                warn!("Failed to remove partial generation {:?}: {}", path, cleanup);
            }
            return Err(e);
        }

        write_atomic(&self.dir.join(CURRENT_FILE), name.as_bytes())?;
        info!("Saved index cache generation {} ({} papers)", name, artifact.len());

        if let Err(e) = self.prune(&name) {
            warn!("Failed to prune old cache generations: {}", e);
        }
        Ok(path)
    }

    fn fresh_generation(&self) -> Result<(String, PathBuf)> {
        loop {
            let name = format!(
                "{}{}-{}",
                GENERATION_PREFIX,
                Utc::now().timestamp_millis(),
                self.seq.fetch_add(1, Ordering::Relaxed)
            );
            let path = self.dir.join(&name);
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok((name, path)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_generation(&self, path: &Path, artifact: &Artifact) -> Result<()> {
        let clusters = artifact.clusters();
        let files: [(&str, Vec<u8>); 3] = [
            (
                EMBEDDINGS_FILE,
                bincode::serialize(artifact.embeddings()).map_err(|e| Error::Serialization(e.to_string()))?,
            ),
            (
                INDEX_FILE,
                bincode::serialize(artifact.index()).map_err(|e| Error::Serialization(e.to_string()))?,
            ),
            (
                CLUSTERS_FILE,
                bincode::serialize(&ClusterFileRef {
                    assignments: clusters.assignments(),
                    centroids: clusters.centroids(),
                    popularity: clusters.popularity_scores(),
                })
                .map_err(|e| Error::Serialization(e.to_string()))?,
            ),
        ];

        let mut checksums = BTreeMap::new();
        for (file, bytes) in &files {
            write_atomic(&path.join(file), bytes)?;
            checksums.insert(file.to_string(), sha256_hex(bytes));
            debug!("Wrote {} ({} bytes)", file, bytes.len());
        }

        let metadata = CacheMetadata {
            format_version: FORMAT_VERSION,
            paper_ids: artifact.paper_ids().to_vec(),
            papers: artifact.papers().to_vec(),
            built_at: artifact.built_at(),
            model_name: artifact.model_name().to_string(),
            dimension: artifact.dimension(),
            cluster_count: clusters.cluster_count(),
            settings: artifact.settings(),
            checksums,
        };
        let json = serde_json::to_vec_pretty(&metadata).map_err(|e| Error::Serialization(e.to_string()))?;
        write_atomic(&path.join(METADATA_FILE), &json)
    }

    /// Load the published generation.
    ///
    /// `Ok(None)` when nothing was ever published; `Err(CacheCorrupt)` when
    /// the published generation fails any validation.
    pub fn load(&self, recency: &RecencyConfig) -> Result<Option<Artifact>> {
        let name = match self.current_generation() {
            Ok(Some(name)) => name,
            Ok(None) => return Ok(None),
            Err(e) => return Err(corrupt(format!("unreadable {}: {}", CURRENT_FILE, e))),
        };
        if parse_generation(&name).is_none() {
            return Err(corrupt(format!("{} names invalid generation '{}'", CURRENT_FILE, name)));
        }
        let path = self.dir.join(&name);
        if !path.is_dir() {
            return Err(corrupt(format!("published generation {} is missing", name)));
        }

        let metadata: CacheMetadata = serde_json::from_slice(&read_file(&path, METADATA_FILE)?)
            .map_err(|e| corrupt(format!("{}: {}", METADATA_FILE, e)))?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "format version {} (expected {})",
                metadata.format_version, FORMAT_VERSION
            )));
        }

        let embeddings: EmbeddingMatrix = decode(&path, EMBEDDINGS_FILE, &metadata)?;
        let index: VectorIndex = decode(&path, INDEX_FILE, &metadata)?;
        let clusters: ClusterFile = decode(&path, CLUSTERS_FILE, &metadata)?;

        if embeddings.dim() != metadata.dimension || index.dimension() != metadata.dimension {
            return Err(corrupt(format!(
                "dimension mismatch: metadata {}, embeddings {}, index {}",
                metadata.dimension,
                embeddings.dim(),
                index.dimension()
            )));
        }
        if clusters.centroids.rows() != metadata.cluster_count {
            return Err(corrupt(format!(
                "cluster count mismatch: metadata {}, centroids {}",
                metadata.cluster_count,
                clusters.centroids.rows()
            )));
        }

        let artifact = Artifact::from_parts(
            ArtifactParts {
                paper_ids: metadata.paper_ids,
                papers: metadata.papers,
                embeddings,
                index,
                assignments: clusters.assignments,
                centroids: clusters.centroids,
                popularity: clusters.popularity,
                built_at: metadata.built_at,
                model_name: metadata.model_name,
                settings: metadata.settings,
            },
            recency,
        )?;
        info!("Loaded index cache generation {} ({} papers)", name, artifact.len());
        Ok(Some(artifact))
    }

    /// Remove every generation and the pointer.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(self.dir.join(CURRENT_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for name in self.generations()? {
            std::fs::remove_dir_all(self.dir.join(&name))?;
        }
        Ok(())
    }

    fn prune(&self, published: &str) -> Result<()> {
        let mut older: Vec<String> = self.generations()?.into_iter().filter(|g| g != published).collect();
        let keep = self.retention.saturating_sub(1);
        let remove = older.len().saturating_sub(keep);
        for name in older.drain(..remove) {
            debug!("Pruning cache generation {}", name);
            std::fs::remove_dir_all(self.dir.join(&name))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCache")
            .field("dir", &self.dir)
            .field("retention", &self.retention)
            .finish()
    }
}

fn read_file(dir: &Path, file: &str) -> Result<Vec<u8>> {
    std::fs::read(dir.join(file)).map_err(|e| corrupt(format!("{}: {}", file, e)))
}

fn decode<T: serde::de::DeserializeOwned>(dir: &Path, file: &str, metadata: &CacheMetadata) -> Result<T> {
    let bytes = read_file(dir, file)?;
    let expected = metadata
        .checksums
        .get(file)
        .ok_or_else(|| corrupt(format!("no checksum recorded for {}", file)))?;
    if &sha256_hex(&bytes) != expected {
        return Err(corrupt(format!("checksum mismatch for {}", file)));
    }
    bincode::deserialize(&bytes).map_err(|e| corrupt(format!("{}: {}", file, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use papersim_core::{EmbeddingProvider, EngineConfig, HashingModel, Paper};
    use tempfile::TempDir;

    fn artifact() -> Artifact {
        let provider =
            EmbeddingProvider::with_model(Box::new(HashingModel::new("cache-test", 32, true, true).unwrap()), 8);
        let papers = vec![
            Paper::new("a", "Sparse attention", "Efficient transformers").with_published("2025-01-10"),
            Paper::new("b", "Diffusion models", "Score based generative modeling"),
            Paper::new("c", "Quantum annealing", "Optimization on qubits").with_categories(["quant-ph"]),
            Paper::new("d", "Protein structure", "Folding with deep learning"),
        ];
        let now = papersim_core::paper::parse_timestamp("2025-02-01").unwrap();
        Artifact::build(papers, &provider, &EngineConfig::default(), now).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = IndexCache::new(dir.path());
        let original = artifact();
        cache.save(&original).unwrap();

        let loaded = cache.load(&RecencyConfig::default()).unwrap().unwrap();
        assert_eq!(loaded.paper_ids(), original.paper_ids());
        assert_eq!(loaded.embeddings(), original.embeddings());
        assert_eq!(loaded.clusters().assignments(), original.clusters().assignments());
        assert_eq!(loaded.built_at(), original.built_at());
        assert_eq!(loaded.model_name(), "cache-test");
    }

    #[test]
    fn test_missing_cache_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = IndexCache::new(dir.path().join("never-created"));
        assert!(cache.load(&RecencyConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_tampered_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let cache = IndexCache::new(dir.path());
        let path = cache.save(&artifact()).unwrap();

        std::fs::write(path.join(CLUSTERS_FILE), b"garbage").unwrap();
        let err = cache.load(&RecencyConfig::default()).unwrap_err();
        assert!(matches!(err, Error::CacheCorrupt(_)));
    }

    #[test]
    fn test_missing_sub_artifact_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let cache = IndexCache::new(dir.path());
        let path = cache.save(&artifact()).unwrap();

        std::fs::remove_file(path.join(INDEX_FILE)).unwrap();
        assert!(matches!(
            cache.load(&RecencyConfig::default()),
            Err(Error::CacheCorrupt(_))
        ));
    }

    #[test]
    fn test_dangling_pointer_is_corrupt() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CURRENT_FILE), "gen-1-0").unwrap();
        let cache = IndexCache::new(dir.path());
        assert!(matches!(
            cache.load(&RecencyConfig::default()),
            Err(Error::CacheCorrupt(_))
        ));
    }

    #[test]
    fn test_prune_keeps_retention() {
        let dir = TempDir::new().unwrap();
        let cache = IndexCache::new(dir.path()).with_retention(2);
        let a = artifact();
        for _ in 0..4 {
            cache.save(&a).unwrap();
        }
        let generations = cache.generations().unwrap();
        assert_eq!(generations.len(), 2);
        assert_eq!(cache.current_generation().unwrap().as_ref(), generations.last());

        cache.clear().unwrap();
        assert!(cache.generations().unwrap().is_empty());
        assert!(cache.load(&RecencyConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_failed_save_keeps_previous_generation() {
        let dir = TempDir::new().unwrap();
        let cache = IndexCache::new(dir.path());
        let a = artifact();
        cache.save(&a).unwrap();
        let published = cache.current_generation().unwrap();

        let err = cache
            .save_with(&a, |path, _| {
                write_atomic(&path.join(EMBEDDINGS_FILE), b"partial")?;
                Err(Error::Io(std::io::Error::new(ErrorKind::Other, "disk full")))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        assert_eq!(cache.current_generation().unwrap(), published);
        assert_eq!(cache.generations().unwrap().len(), 1);
        let loaded = cache.load(&RecencyConfig::default()).unwrap().unwrap();
        assert_eq!(loaded.paper_ids(), a.paper_ids());
    }

    #[test]
    fn test_save_into_unusable_dir_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let blocked = dir.path().join("cache");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let cache = IndexCache::new(&blocked);
        assert!(cache.save(&artifact()).is_err());
        assert!(blocked.is_file());
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = IndexCache::new(dir.path());
        let original = artifact();
        cache.save(&original).unwrap();
        let loaded = cache.load(&RecencyConfig::default()).unwrap().unwrap();
        assert_eq!(loaded.settings(), original.settings());
        assert_eq!(loaded.settings(), BuildSettings::from_config(&EngineConfig::default()));
    }

    #[test]
    fn test_generation_names_parse() {
        assert_eq!(parse_generation("gen-1700000000000-3"), Some((1_700_000_000_000, 3)));
        assert_eq!(parse_generation("gen-x-3"), None);
        assert_eq!(parse_generation("../etc"), None);
    }
}
