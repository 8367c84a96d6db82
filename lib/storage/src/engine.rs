//! Lifecycle owner for the published artifact.
//!
//! The engine is constructed explicitly by the caller. Queries take a
//! snapshot `Arc<Artifact>` and never block on a rebuild; rebuilds and
//! ingestion construct a complete new artifact and swap it in on success.

use crate::cache::IndexCache;
use chrono::{DateTime, Utc};
use papersim_core::{
    Artifact, BackgroundWorker, BuildSettings, ClusterSummary, EmbeddingProvider, EngineConfig, Error, IndexKind,
    JobHandle, Method, Paper, PaperSource, QueryStatus, Recommendations, Recommender, Result,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    NotInitialized,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RebuildOutcome {
    Rebuilt { corpus_size: usize },
    /// An artifact was already published and no force was requested
    AlreadyReady,
    /// Another rebuild was in progress; this request was dropped
    Coalesced,
    EmptyCorpus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub added: usize,
    pub skipped: usize,
    pub corpus_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub corpus_size: usize,
    pub embedding_dimension: usize,
    pub cluster_count: usize,
    pub last_build_time: Option<DateTime<Utc>>,
    pub model_name: String,
    pub index_kind: Option<IndexKind>,
}

pub struct RecommendationEngine {
    config: EngineConfig,
    provider: EmbeddingProvider,
    source: Arc<dyn PaperSource>,
    cache: Option<IndexCache>,
    published: RwLock<Option<Arc<Artifact>>>,
    /// Held for the whole of a rebuild or ingest
    writer: Mutex<()>,
    lazy_rebuild_attempted: AtomicBool,
    worker: Mutex<Option<Arc<BackgroundWorker>>>,
}

impl RecommendationEngine {
    pub fn new(config: EngineConfig, provider: EmbeddingProvider, source: Arc<dyn PaperSource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            source,
            cache: None,
            published: RwLock::new(None),
            writer: Mutex::new(()),
            lazy_rebuild_attempted: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// Persist every published artifact to `cache` and load from it on
    /// [`initialize`](Self::initialize).
    #[must_use]
    pub fn with_cache(mut self, cache: IndexCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &EmbeddingProvider {
        &self.provider
    }

    /// Snapshot of the published artifact.
    pub fn current(&self) -> Option<Arc<Artifact>> {
        self.published.read().clone()
    }

    pub fn state(&self) -> EngineState {
        if self.published.read().is_some() {
            EngineState::Ready
        } else {
            EngineState::NotInitialized
        }
    }

    fn publish(&self, artifact: Artifact) -> Arc<Artifact> {
        let artifact = Arc::new(artifact);
        *self.published.write() = Some(artifact.clone());
        artifact
    }

    fn persist(&self, artifact: &Artifact) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save(artifact) {
                warn!("Failed to persist index cache, serving from memory: {}", e);
            }
        }
    }

    /// Why a cached artifact cannot serve under the active model and config.
    fn staleness(&self, artifact: &Artifact) -> Option<String> {
        if artifact.model_name() != self.provider.model_name() || artifact.dimension() != self.provider.dimension() {
            return Some(format!(
                "built with {} (dim {}) but active model is {} (dim {})",
                artifact.model_name(),
                artifact.dimension(),
                self.provider.model_name(),
                self.provider.dimension()
            ));
        }
        let active = BuildSettings::from_config(&self.config);
        if artifact.settings() != active {
            return Some(format!("built with {:?} but config asks for {:?}", artifact.settings(), active));
        }
        None
    }

    /// Publish the cached artifact if it is usable, otherwise rebuild.
    pub fn initialize(&self) -> Result<EngineState> {
        if let Some(cache) = &self.cache {
            match cache.load(&self.config.recency) {
                Ok(Some(artifact)) => match self.staleness(&artifact) {
                    None => {
                        info!("Serving cached index: {} papers", artifact.len());
                        self.publish(artifact);
                        return Ok(EngineState::Ready);
                    }
                    Some(reason) => warn!("Cached index is stale, rebuilding: {}", reason),
                },
                Ok(None) => info!("No index cache found, building"),
                Err(e) => warn!("Discarding index cache: {}", e),
            }
        }

        match self.rebuild(true)? {
            RebuildOutcome::EmptyCorpus => warn!("Corpus is empty, engine not initialized"),
            RebuildOutcome::Coalesced => info!("Initialization joined a running rebuild"),
            _ => {}
        }
        Ok(self.state())
    }

    /// Full rebuild from the corpus source. At most one runs at a time;
    /// any failure leaves the previous artifact serving.
    pub fn rebuild(&self, force: bool) -> Result<RebuildOutcome> {
        if !force && self.published.read().is_some() {
            return Ok(RebuildOutcome::AlreadyReady);
        }
        let Some(_writer) = self.writer.try_lock() else {
            info!("Rebuild already in progress, request coalesced");
            return Ok(RebuildOutcome::Coalesced);
        };

        let papers = self.source.list_papers(None)?;
        match self.build_artifact(papers)? {
            Some(artifact) => {
                let corpus_size = artifact.len();
                self.persist(&artifact);
                self.publish(artifact);
                Ok(RebuildOutcome::Rebuilt { corpus_size })
            }
            None => Ok(RebuildOutcome::EmptyCorpus),
        }
    }

    fn build_artifact(&self, papers: Vec<Paper>) -> Result<Option<Artifact>> {
        match Artifact::build(papers, &self.provider, &self.config, Utc::now()) {
            Ok(artifact) => Ok(Some(artifact)),
            Err(Error::EmptyCorpus) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn worker(&self) -> Result<Arc<BackgroundWorker>> {
        let mut slot = self.worker.lock();
        if let Some(worker) = slot.as_ref() {
            return Ok(worker.clone());
        }
        let worker = Arc::new(BackgroundWorker::new("rebuild")?);
        *slot = Some(worker.clone());
        Ok(worker)
    }

    /// Run [`rebuild`](Self::rebuild) on the engine's background worker.
    pub fn rebuild_in_background(self: &Arc<Self>, force: bool) -> Result<JobHandle<Result<RebuildOutcome>>> {
        let engine = self.clone();
        Ok(self.worker()?.spawn("rebuild", move || {
            let outcome = engine.rebuild(force);
            if let Err(e) = &outcome {
                error!("Background rebuild failed, previous index keeps serving: {}", e);
            }
            outcome
        }))
    }

    fn write_through(&self, papers: &[Paper]) -> Result<()> {
        if papers.is_empty() {
            return Ok(());
        }
        self.source.add_papers(papers)?;
        debug!("Wrote {} ingested papers to the corpus source", papers.len());
        Ok(())
    }

    /// Add papers without a full rebuild when the published artifact allows
    /// it; otherwise rebuild from the source plus `papers`.
    ///
    /// Papers the source does not hold yet are written to it before the new
    /// artifact is published, so a later rebuild keeps them. A failed write
    /// publishes nothing.
    pub fn ingest(&self, papers: Vec<Paper>) -> Result<IngestReport> {
        let _writer = self.writer.lock();
        let submitted = papers.len();

        let mut corpus = self.source.list_papers(None)?;
        let mut known: HashSet<String> = corpus.iter().map(|p| p.id.clone()).collect();
        let unsourced: Vec<Paper> = papers.iter().filter(|p| known.insert(p.id.clone())).cloned().collect();

        if let Some(current) = self.current() {
            match current.extend(&papers, &self.provider, &self.config, Utc::now()) {
                Ok(Some(artifact)) => {
                    self.write_through(&unsourced)?;
                    let added = artifact.len() - current.len();
                    self.persist(&artifact);
                    let published = self.publish(artifact);
                    return Ok(IngestReport {
                        added,
                        skipped: submitted - added,
                        corpus_size: published.len(),
                    });
                }
                Ok(None) => {
                    self.write_through(&unsourced)?;
                    return Ok(IngestReport {
                        added: 0,
                        skipped: submitted,
                        corpus_size: current.len(),
                    });
                }
                Err(Error::ModelMismatch { expected, actual }) => {
                    warn!(
                        "Published index uses {} but active model is {}, rebuilding for ingest",
                        expected, actual
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.write_through(&unsourced)?;
        let added = unsourced.len();
        corpus.extend(unsourced);

        match self.build_artifact(corpus)? {
            Some(artifact) => {
                self.persist(&artifact);
                let published = self.publish(artifact);
                Ok(IngestReport {
                    added,
                    skipped: submitted - added,
                    corpus_size: published.len(),
                })
            }
            None => Ok(IngestReport {
                added: 0,
                skipped: submitted,
                corpus_size: 0,
            }),
        }
    }

    /// The published artifact, trying one lazy [`initialize`](Self::initialize)
    /// the first time the engine is queried without one.
    fn ready_artifact(&self) -> Option<Arc<Artifact>> {
        if let Some(artifact) = self.current() {
            return Some(artifact);
        }
        if !self.lazy_rebuild_attempted.swap(true, Ordering::AcqRel) {
            info!("Index not loaded, initializing on first query");
            if let Err(e) = self.initialize() {
                warn!("Lazy initialization failed: {}", e);
            }
        }
        self.current()
    }

    pub fn recommend(&self, paper_id: &str, method: Method, k: usize) -> Recommendations {
        let Some(artifact) = self.ready_artifact() else {
            return Recommendations::empty(QueryStatus::NotInitialized);
        };
        Recommender::new(&artifact, &self.config.fusion).recommend(paper_id, method, k)
    }

    pub fn search_by_text(&self, query: &str, k: usize) -> Recommendations {
        if query.trim().is_empty() {
            return Recommendations::empty(QueryStatus::EmptyQuery);
        }
        let Some(artifact) = self.ready_artifact() else {
            return Recommendations::empty(QueryStatus::NotInitialized);
        };
        match self.provider.embed(query) {
            Ok(vector) => Recommender::new(&artifact, &self.config.fusion).search_vector(vector.as_slice(), k),
            Err(e) => {
                error!("Failed to embed query: {}", e);
                Recommendations::empty(QueryStatus::EmbeddingFailed { message: e.to_string() })
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        match self.current() {
            Some(artifact) => EngineStats {
                state: EngineState::Ready,
                corpus_size: artifact.len(),
                embedding_dimension: artifact.dimension(),
                cluster_count: artifact.clusters().cluster_count(),
                last_build_time: Some(artifact.built_at()),
                model_name: artifact.model_name().to_string(),
                index_kind: Some(artifact.index().kind()),
            },
            None => EngineStats {
                state: EngineState::NotInitialized,
                corpus_size: 0,
                embedding_dimension: self.provider.dimension(),
                cluster_count: 0,
                last_build_time: None,
                model_name: self.provider.model_name().to_string(),
                index_kind: None,
            },
        }
    }

    /// Most popular clusters first.
    pub fn trending_topics(&self, limit: usize) -> Vec<ClusterSummary> {
        let Some(artifact) = self.current() else {
            return Vec::new();
        };
        let mut summaries = artifact.cluster_summaries();
        summaries.truncate(limit);
        summaries
    }
}

impl std::fmt::Debug for RecommendationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationEngine")
            .field("state", &self.state())
            .field("provider", &self.provider)
            .field("cache", &self.cache)
            .finish()
    }
}
