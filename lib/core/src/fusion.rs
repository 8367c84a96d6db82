//! Recommendation strategies over a published [`Artifact`].
//!
//! Every strategy excludes the query paper from its own results and orders
//! by score descending, then paper id ascending. "No recommendation" cases
//! are reported through [`QueryStatus`] rather than as errors.

use crate::artifact::Artifact;
use crate::config::FusionConfig;
use crate::index::{by_score_then_id, NearestNeighbors};
use crate::Error;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Content,
    Cluster,
    #[default]
    Hybrid,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Content => "content",
            Method::Cluster => "cluster",
            Method::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "content" => Ok(Method::Content),
            "cluster" => Ok(Method::Cluster),
            "hybrid" => Ok(Method::Hybrid),
            other => Err(Error::InvalidConfig(format!(
                "unknown method '{}' (expected content, cluster or hybrid)",
                other
            ))),
        }
    }
}

/// Per-strategy components of a hybrid score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub content: Option<f32>,
    /// Normalized by the best cluster score in the batch
    pub cluster: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub paper_id: String,
    pub score: f32,
    /// 1-based
    pub rank: usize,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryStatus {
    Ok,
    NotFound { paper_id: String },
    NotInitialized,
    EmptyQuery,
    /// The query text could not be embedded by the active model
    EmbeddingFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub results: Vec<RecommendationResult>,
    #[serde(flatten)]
    pub status: QueryStatus,
}

impl Recommendations {
    pub fn ok(results: Vec<RecommendationResult>) -> Self {
        Self {
            results,
            status: QueryStatus::Ok,
        }
    }

    pub fn empty(status: QueryStatus) -> Self {
        Self {
            results: Vec::new(),
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == QueryStatus::Ok
    }

    /// Human-readable explanation for an empty or failed query.
    pub fn reason(&self) -> Option<String> {
        match &self.status {
            QueryStatus::Ok => None,
            QueryStatus::NotFound { paper_id } => Some(format!("paper '{}' not found in index", paper_id)),
            QueryStatus::NotInitialized => Some("not initialized".to_string()),
            QueryStatus::EmptyQuery => Some("empty query".to_string()),
            QueryStatus::EmbeddingFailed { message } => Some(format!("failed to embed query: {}", message)),
        }
    }
}

/// A scored candidate before ranking.
#[derive(Debug, Clone)]
struct Candidate {
    paper_id: String,
    score: f32,
    method: Method,
    breakdown: Option<ScoreBreakdown>,
}

fn rank(mut candidates: Vec<Candidate>, k: usize) -> Vec<RecommendationResult> {
    candidates.sort_by(|a, b| by_score_then_id(a.score, &a.paper_id, b.score, &b.paper_id));
    candidates.truncate(k);
    candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| RecommendationResult {
            paper_id: c.paper_id,
            score: c.score,
            rank: i + 1,
            method: c.method,
            breakdown: c.breakdown,
        })
        .collect()
}

/// Read-only view that answers queries against one artifact.
pub struct Recommender<'a> {
    artifact: &'a Artifact,
    config: &'a FusionConfig,
}

impl<'a> Recommender<'a> {
    pub fn new(artifact: &'a Artifact, config: &'a FusionConfig) -> Self {
        Self { artifact, config }
    }

    pub fn recommend(&self, paper_id: &str, method: Method, k: usize) -> Recommendations {
        let Some(slot) = self.artifact.slot_of(paper_id) else {
            return Recommendations::empty(QueryStatus::NotFound {
                paper_id: paper_id.to_string(),
            });
        };
        if k == 0 {
            return Recommendations::ok(Vec::new());
        }
        let candidates = match method {
            Method::Content => self.content_candidates(slot, k),
            Method::Cluster => self.cluster_candidates(slot, k),
            Method::Hybrid => self.hybrid_candidates(slot, k),
        };
        Recommendations::ok(rank(candidates, k))
    }

    pub fn content(&self, paper_id: &str, k: usize) -> Recommendations {
        self.recommend(paper_id, Method::Content, k)
    }

    pub fn cluster(&self, paper_id: &str, k: usize) -> Recommendations {
        self.recommend(paper_id, Method::Cluster, k)
    }

    pub fn hybrid(&self, paper_id: &str, k: usize) -> Recommendations {
        self.recommend(paper_id, Method::Hybrid, k)
    }

    /// Nearest papers to an already embedded query; nothing is excluded.
    pub fn search_vector(&self, query: &[f32], k: usize) -> Recommendations {
        let candidates = self
            .artifact
            .index()
            .search(query, k)
            .into_iter()
            .map(|n| Candidate {
                paper_id: n.paper_id,
                score: n.similarity,
                method: Method::Content,
                breakdown: None,
            })
            .collect();
        Recommendations::ok(rank(candidates, k))
    }

    /// Index neighbors of the query paper, minus the paper itself.
    fn content_candidates(&self, slot: usize, k: usize) -> Vec<Candidate> {
        let query = self.artifact.embeddings().row(slot);
        let own_id = &self.artifact.paper_ids()[slot];
        self.artifact
            .index()
            .search(query, k + 1)
            .into_iter()
            .filter(|n| &n.paper_id != own_id)
            .take(k)
            .map(|n| Candidate {
                paper_id: n.paper_id,
                score: n.similarity,
                method: Method::Content,
                breakdown: None,
            })
            .collect()
    }

    /// Other members of the query paper's cluster, scored by their own
    /// recency and the cluster's popularity.
    fn cluster_candidates(&self, slot: usize, k: usize) -> Vec<Candidate> {
        let clusters = self.artifact.clusters();
        let Some(cluster) = clusters.cluster_of(slot) else {
            return Vec::new();
        };
        let popularity = clusters.popularity(cluster).unwrap_or(0.0);
        let mut candidates: Vec<Candidate> = clusters
            .members(cluster)
            .iter()
            .filter(|&&member| member != slot)
            .map(|&member| Candidate {
                paper_id: self.artifact.paper_ids()[member].clone(),
                score: self.config.cluster_time_weight * self.artifact.recency(member)
                    + self.config.cluster_popularity_weight * popularity,
                method: Method::Cluster,
                breakdown: None,
            })
            .collect();
        candidates.sort_by(|a, b| by_score_then_id(a.score, &a.paper_id, b.score, &b.paper_id));
        candidates.truncate(k);
        candidates
    }

    fn hybrid_candidates(&self, slot: usize, k: usize) -> Vec<Candidate> {
        let fetch = k.saturating_mul(self.config.hybrid_candidate_factor.max(1));
        let content = self.content_candidates(slot, fetch);
        let cluster = self.cluster_candidates(slot, fetch);

        let max_cluster = cluster.iter().map(|c| c.score).fold(0.0f32, f32::max);
        let normalize = |score: f32| if max_cluster > 0.0 { score / max_cluster } else { 0.0 };

        let content_weight = self.config.hybrid_content_weight;
        let cluster_weight = self.config.hybrid_cluster_weight;
        let weight_sum = content_weight + cluster_weight;

        let mut merged: AHashMap<String, ScoreBreakdown> = AHashMap::with_capacity(content.len() + cluster.len());
        for c in content {
            merged.entry(c.paper_id).or_insert(ScoreBreakdown { content: None, cluster: None }).content = Some(c.score);
        }
        for c in cluster {
            merged.entry(c.paper_id).or_insert(ScoreBreakdown { content: None, cluster: None }).cluster =
                Some(normalize(c.score));
        }

        merged
            .into_iter()
            .map(|(paper_id, parts)| {
                let (score, method) = match (parts.content, parts.cluster) {
                    (Some(content), Some(cluster)) => {
                        let combined = if weight_sum > 0.0 {
                            (content_weight * content + cluster_weight * cluster) / weight_sum
                        } else {
                            content
                        };
                        (combined, Method::Hybrid)
                    }
                    (Some(content), None) => (content, Method::Content),
                    (None, Some(cluster)) => (cluster, Method::Cluster),
                    (None, None) => (0.0, Method::Hybrid),
                };
                Candidate {
                    paper_id,
                    score,
                    method,
                    breakdown: Some(parts),
                }
            })
            .collect()
    }
}
