//! One servable recommendation state.
//!
//! An [`Artifact`] bundles the slot table, embeddings, vector index, cluster
//! model and per-paper metadata. It is immutable once built: rebuilds and
//! ingestion produce a new artifact which the owner swaps in on success.

use crate::cluster::{effective_k, ClusterModel, KMeans};
use crate::config::{EngineConfig, IndexKind, PopularityConfig, RecencyConfig};
use crate::embedding::EmbeddingProvider;
use crate::index::{NearestNeighbors, VectorIndex};
use crate::paper::{parse_timestamp, Paper};
use crate::simd::squared_l2;
use crate::vector::EmbeddingMatrix;
use crate::{Error, Result};
use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Metadata kept per slot for scoring and summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperMeta {
    pub title: String,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub published: Option<String>,
}

impl From<&Paper> for PaperMeta {
    fn from(paper: &Paper) -> Self {
        Self {
            title: paper.title.clone(),
            categories: paper.categories.clone(),
            published: paper.published.clone(),
        }
    }
}

/// A cluster described for "trending topics" listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: u32,
    pub size: usize,
    pub popularity: f32,
    pub top_categories: Vec<String>,
    /// Member closest to the centroid
    pub representative: Option<String>,
}

/// Config values that shape an artifact. A cached artifact whose settings
/// differ from the active config is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    pub index_kind: IndexKind,
    pub clustering_k: usize,
    pub clustering_seed: u64,
}

impl BuildSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            index_kind: config.index.kind,
            clustering_k: config.clustering.k,
            clustering_seed: config.clustering.seed,
        }
    }
}

/// Everything needed to reassemble an artifact read back from disk.
#[derive(Debug, Clone)]
pub struct ArtifactParts {
    pub paper_ids: Vec<String>,
    pub papers: Vec<PaperMeta>,
    pub embeddings: EmbeddingMatrix,
    pub index: VectorIndex,
    pub assignments: Vec<u32>,
    pub centroids: EmbeddingMatrix,
    pub popularity: Vec<f32>,
    pub built_at: DateTime<Utc>,
    pub model_name: String,
    pub settings: BuildSettings,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    paper_ids: Vec<String>,
    slots: AHashMap<String, usize>,
    embeddings: EmbeddingMatrix,
    index: VectorIndex,
    clusters: ClusterModel,
    papers: Vec<PaperMeta>,
    recency: Vec<f32>,
    built_at: DateTime<Utc>,
    model_name: String,
    settings: BuildSettings,
}

fn recency_scores(papers: &[PaperMeta], config: &RecencyConfig, at: DateTime<Utc>) -> Vec<f32> {
    papers
        .iter()
        .map(|p| config.score(p.published.as_deref().and_then(parse_timestamp), at))
        .collect()
}

fn slot_table(ids: &[String]) -> Result<AHashMap<String, usize>> {
    let mut slots = AHashMap::with_capacity(ids.len());
    for (slot, id) in ids.iter().enumerate() {
        if slots.insert(id.clone(), slot).is_some() {
            return Err(Error::CacheCorrupt(format!("duplicate paper id '{}'", id)));
        }
    }
    Ok(slots)
}

impl Artifact {
    /// Full build: embed, index, cluster and score `papers`.
    ///
    /// Duplicate ids keep their first occurrence.
    pub fn build(papers: Vec<Paper>, provider: &EmbeddingProvider, config: &EngineConfig, now: DateTime<Utc>) -> Result<Self> {
        let start = Instant::now();
        let mut seen = AHashSet::with_capacity(papers.len());
        let total = papers.len();
        let papers: Vec<Paper> = papers.into_iter().filter(|p| seen.insert(p.id.clone())).collect();
        if papers.len() < total {
            warn!("Skipped {} duplicate paper ids", total - papers.len());
        }
        if papers.is_empty() {
            return Err(Error::EmptyCorpus);
        }

        let embeddings = provider.embed_papers(&papers)?;
        debug!("Embedded {} papers in {:?}", papers.len(), start.elapsed());

        let paper_ids: Vec<String> = papers.iter().map(|p| p.id.clone()).collect();
        let kmeans = KMeans::new(config.clustering.clone());
        let (index, mut clusters) = rayon::join(
            || VectorIndex::build(&config.index, paper_ids.clone(), &embeddings),
            || kmeans.fit(&embeddings),
        );
        let index = index?;

        let metas: Vec<PaperMeta> = papers.iter().map(PaperMeta::from).collect();
        let recency = recency_scores(&metas, &config.recency, now);
        clusters.compute_popularity(&recency, &config.popularity);

        info!(
            "Built artifact: {} papers, dim {}, {} clusters, {:?} index in {:?}",
            paper_ids.len(),
            embeddings.dim(),
            clusters.cluster_count(),
            index.kind(),
            start.elapsed()
        );

        Ok(Self {
            slots: slot_table(&paper_ids)?,
            paper_ids,
            embeddings,
            index,
            clusters,
            papers: metas,
            recency,
            built_at: now,
            model_name: provider.model_name().to_string(),
            settings: BuildSettings::from_config(config),
        })
    }

    /// Reassemble persisted parts, rejecting anything inconsistent.
    pub fn from_parts(parts: ArtifactParts, recency_config: &RecencyConfig) -> Result<Self> {
        let n = parts.paper_ids.len();
        if n == 0 {
            return Err(Error::CacheCorrupt("artifact holds no papers".into()));
        }
        let counts = [
            ("metadata", parts.papers.len()),
            ("embeddings", parts.embeddings.rows()),
            ("index", parts.index.size()),
            ("cluster assignments", parts.assignments.len()),
        ];
        for (what, count) in counts {
            if count != n {
                return Err(Error::CacheCorrupt(format!(
                    "{} holds {} entries, expected {}",
                    what, count, n
                )));
            }
        }
        if parts.index.ids() != parts.paper_ids.as_slice() {
            return Err(Error::CacheCorrupt("index slot table disagrees with paper ids".into()));
        }
        if parts.index.dimension() != parts.embeddings.dim() {
            return Err(Error::CacheCorrupt(format!(
                "index dimension {} != embedding dimension {}",
                parts.index.dimension(),
                parts.embeddings.dim()
            )));
        }
        if parts.centroids.rows() > 0 && parts.centroids.dim() != parts.embeddings.dim() {
            return Err(Error::CacheCorrupt("centroid dimension mismatch".into()));
        }
        if parts.index.kind() != parts.settings.index_kind {
            return Err(Error::CacheCorrupt(format!(
                "index is {:?} but was recorded as {:?}",
                parts.index.kind(),
                parts.settings.index_kind
            )));
        }

        let clusters = ClusterModel::from_parts(parts.assignments, parts.centroids, parts.popularity)?;
        let recency = recency_scores(&parts.papers, recency_config, parts.built_at);
        Ok(Self {
            slots: slot_table(&parts.paper_ids)?,
            paper_ids: parts.paper_ids,
            embeddings: parts.embeddings,
            index: parts.index,
            clusters,
            papers: parts.papers,
            recency,
            built_at: parts.built_at,
            model_name: parts.model_name,
            settings: parts.settings,
        })
    }

    /// New artifact with `papers` appended. Already indexed ids are skipped;
    /// returns `None` when nothing is new.
    ///
    /// The index is rebuilt over the concatenated embeddings. New papers
    /// join their nearest existing cluster, unless the grown corpus calls
    /// for a different cluster count (or the clustering config changed), in
    /// which case k-means is refit over everything.
    pub fn extend(
        &self,
        papers: &[Paper],
        provider: &EmbeddingProvider,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        if provider.model_name() != self.model_name || provider.dimension() != self.dimension() {
            return Err(Error::ModelMismatch {
                expected: self.model_name.clone(),
                actual: provider.model_name().to_string(),
            });
        }

        let mut seen = AHashSet::new();
        let fresh: Vec<Paper> = papers
            .iter()
            .filter(|p| !self.slots.contains_key(&p.id) && seen.insert(p.id.clone()))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(None);
        }

        let added = provider.embed_papers(&fresh)?;
        let mut embeddings = self.embeddings.clone();
        embeddings.append(&added)?;

        let mut paper_ids = self.paper_ids.clone();
        paper_ids.extend(fresh.iter().map(|p| p.id.clone()));
        let index = VectorIndex::build(&config.index, paper_ids.clone(), &embeddings)?;

        let settings = BuildSettings::from_config(config);
        let k = effective_k(config.clustering.k, paper_ids.len());
        let mut clusters = if k != self.clusters.cluster_count() || settings != self.settings {
            debug!(
                "Refitting {} clusters (was {}) over {} papers",
                k,
                self.clusters.cluster_count(),
                paper_ids.len()
            );
            KMeans::new(config.clustering.clone()).fit(&embeddings)
        } else {
            let mut clusters = self.clusters.clone();
            for row in added.iter_rows() {
                clusters.assign(row)?;
            }
            clusters
        };

        let mut metas = self.papers.clone();
        metas.extend(fresh.iter().map(PaperMeta::from));
        let recency = recency_scores(&metas, &config.recency, now);
        clusters.compute_popularity(&recency, &config.popularity);

        info!("Extended artifact by {} papers to {}", fresh.len(), paper_ids.len());
        Ok(Some(Self {
            slots: slot_table(&paper_ids)?,
            paper_ids,
            embeddings,
            index,
            clusters,
            papers: metas,
            recency,
            built_at: now,
            model_name: self.model_name.clone(),
            settings,
        }))
    }

    /// Same artifact with a different partition; popularity is recomputed.
    pub fn with_clusters(mut self, mut clusters: ClusterModel, config: &PopularityConfig) -> Result<Self> {
        if clusters.assignments().len() != self.len() {
            return Err(Error::InvalidDimension {
                expected: self.len(),
                actual: clusters.assignments().len(),
            });
        }
        clusters.compute_popularity(&self.recency, config);
        self.clusters = clusters;
        Ok(self)
    }

    /// Clusters ordered by popularity (descending), then id.
    pub fn cluster_summaries(&self) -> Vec<ClusterSummary> {
        let mut summaries: Vec<ClusterSummary> = (0..self.clusters.cluster_count() as u32)
            .map(|cluster| {
                let members = self.clusters.members(cluster);

                let mut counts: AHashMap<&str, usize> = AHashMap::new();
                for &slot in members {
                    for category in &self.papers[slot].categories {
                        *counts.entry(category.as_str()).or_default() += 1;
                    }
                }
                let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

                let centroid = self.clusters.centroids().row(cluster as usize);
                let representative = members
                    .iter()
                    .min_by_key(|&&slot| (OrderedFloat(squared_l2(self.embeddings.row(slot), centroid)), slot))
                    .map(|&slot| self.paper_ids[slot].clone());

                ClusterSummary {
                    cluster_id: cluster,
                    size: members.len(),
                    popularity: self.clusters.popularity(cluster).unwrap_or(0.0),
                    top_categories: ranked.into_iter().take(3).map(|(c, _)| c.to_string()).collect(),
                    representative,
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            OrderedFloat(b.popularity)
                .cmp(&OrderedFloat(a.popularity))
                .then_with(|| a.cluster_id.cmp(&b.cluster_id))
        });
        summaries
    }

    pub fn len(&self) -> usize {
        self.paper_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paper_ids.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.embeddings.dim()
    }

    pub fn paper_ids(&self) -> &[String] {
        &self.paper_ids
    }

    pub fn slot_of(&self, paper_id: &str) -> Option<usize> {
        self.slots.get(paper_id).copied()
    }

    pub fn contains(&self, paper_id: &str) -> bool {
        self.slots.contains_key(paper_id)
    }

    pub fn embeddings(&self) -> &EmbeddingMatrix {
        &self.embeddings
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn clusters(&self) -> &ClusterModel {
        &self.clusters
    }

    pub fn papers(&self) -> &[PaperMeta] {
        &self.papers
    }

    /// Recency of the paper in `slot`, evaluated at build time.
    pub fn recency(&self, slot: usize) -> f32 {
        self.recency.get(slot).copied().unwrap_or(0.0)
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn settings(&self) -> BuildSettings {
        self.settings
    }
}
