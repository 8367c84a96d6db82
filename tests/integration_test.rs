// Integration tests for papersim
use papersim::prelude::*;
use papersim_core::index::NearestNeighbors;
use papersim_core::{ClusterModel, EmbeddingModel, HashingModel, IndexKind, Recommender};
use std::sync::Arc;
use tempfile::TempDir;

fn hashing_provider() -> EmbeddingProvider {
    EmbeddingProvider::with_model(Box::new(HashingModel::new("it-hash-128", 128, true, true).unwrap()), 8)
}

fn sample_papers() -> Vec<Paper> {
    vec![
        Paper::new("2401.0001", "Quantum error correction with surface codes", "Logical qubits and decoders")
            .with_categories(["quant-ph"])
            .with_published("2024-12-15"),
        Paper::new("2401.0002", "Fault tolerant quantum computing", "Surface code thresholds for qubits")
            .with_categories(["quant-ph"])
            .with_published("2024-11-02"),
        Paper::new("2401.0003", "Protein structure prediction", "Deep learning for folding proteins")
            .with_categories(["q-bio.BM", "cs.LG"])
            .with_published("2023-06-20"),
        Paper::new("2401.0004", "Graph neural networks for molecules", "Message passing on molecular graphs")
            .with_categories(["cs.LG"])
            .with_published("2024-08-30"),
        Paper::new("2401.0005", "Dark energy survey results", "Cosmological constraints from weak lensing")
            .with_categories(["astro-ph.CO"]),
        Paper::new("2401.0006", "Galaxy cluster lensing", "Mass profiles from weak gravitational lensing")
            .with_categories(["astro-ph.CO"])
            .with_published("not a date"),
    ]
}

fn engine_with(papers: Vec<Paper>, cache_dir: &std::path::Path) -> RecommendationEngine {
    RecommendationEngine::new(
        EngineConfig::default(),
        hashing_provider(),
        Arc::new(InMemoryCorpus::new(papers)),
    )
    .unwrap()
    .with_cache(IndexCache::new(cache_dir))
}

#[test]
fn test_content_self_match_for_every_paper() {
    for kind in [IndexKind::Flat, IndexKind::Hnsw] {
        let mut config = EngineConfig::default();
        config.index.kind = kind;
        let artifact =
            Artifact::build(sample_papers(), &hashing_provider(), &config, chrono::Utc::now()).unwrap();
        for (slot, id) in artifact.paper_ids().iter().enumerate() {
            let hits = artifact.index().search(artifact.embeddings().row(slot), 1);
            assert_eq!(&hits[0].paper_id, id, "{:?}", kind);
            assert!((hits[0].similarity - 1.0).abs() < 1e-4);
        }
    }
}

#[test]
fn test_content_recommendations_exclude_query_and_respect_k() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(sample_papers(), dir.path());
    engine.initialize().unwrap();

    for paper in sample_papers() {
        for k in [0, 1, 3, 10] {
            let recs = engine.recommend(&paper.id, Method::Content, k);
            assert!(recs.is_ok());
            assert!(recs.results.len() <= k);
            assert!(recs.results.iter().all(|r| r.paper_id != paper.id));
            for (i, r) in recs.results.iter().enumerate() {
                assert_eq!(r.rank, i + 1);
            }
        }
    }
}

#[test]
fn test_rebuild_is_deterministic() {
    let config = EngineConfig::default();
    let a = Artifact::build(sample_papers(), &hashing_provider(), &config, chrono::Utc::now()).unwrap();
    let b = Artifact::build(sample_papers(), &hashing_provider(), &config, chrono::Utc::now()).unwrap();
    assert_eq!(a.clusters().assignments(), b.clusters().assignments());
}

#[test]
fn test_partition_and_popularity_bounds() {
    let artifact =
        Artifact::build(sample_papers(), &hashing_provider(), &EngineConfig::default(), chrono::Utc::now()).unwrap();
    let clusters = artifact.clusters();
    let total: usize = (0..clusters.cluster_count() as u32).map(|c| clusters.members(c).len()).sum();
    assert_eq!(total, artifact.len());
    assert_eq!(clusters.cluster_count(), 3);
    for c in 0..clusters.cluster_count() as u32 {
        let p = clusters.popularity(c).unwrap();
        assert!((0.0..=1.0).contains(&p));
    }

    let single = Artifact::build(
        vec![Paper::new("solo", "Only paper", "")],
        &hashing_provider(),
        &EngineConfig::default(),
        chrono::Utc::now(),
    )
    .unwrap();
    assert_eq!(single.clusters().cluster_count(), 1);
    assert!((0.0..=1.0).contains(&single.clusters().popularity(0).unwrap()));
}

/// A and B point the same way, C is orthogonal to both.
struct ThreePaperModel;

impl EmbeddingModel for ThreePaperModel {
    fn name(&self) -> &str {
        "three"
    }

    fn dimension(&self) -> usize {
        2
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        match text {
            "a" => vec![1.0, 0.1],
            "b" => vec![1.0, 0.3],
            _ => vec![0.0, 1.0],
        }
    }
}

#[test]
fn test_three_paper_scenario() {
    let provider = EmbeddingProvider::with_model(Box::new(ThreePaperModel), 4);
    let config = EngineConfig::default();
    let papers = vec![Paper::new("A", "a", ""), Paper::new("B", "b", ""), Paper::new("C", "c", "")];
    let artifact = Artifact::build(papers, &provider, &config, chrono::Utc::now()).unwrap();
    let clusters = ClusterModel::from_assignments(artifact.embeddings(), vec![0, 0, 1]).unwrap();
    let artifact = artifact.with_clusters(clusters, &config.popularity).unwrap();
    let recommender = Recommender::new(&artifact, &config.fusion);

    let by_cluster = recommender.recommend("A", Method::Cluster, 5);
    let ids: Vec<_> = by_cluster.results.iter().map(|r| r.paper_id.as_str()).collect();
    assert_eq!(ids, vec!["B"]);

    let by_content = recommender.recommend("A", Method::Content, 5);
    let ids: Vec<_> = by_content.results.iter().map(|r| r.paper_id.as_str()).collect();
    assert_eq!(ids, vec!["B", "C"]);
    assert!(by_content.results[0].score > by_content.results[1].score);
}

#[test]
fn test_hybrid_scores_are_bounded() {
    let artifact =
        Artifact::build(sample_papers(), &hashing_provider(), &EngineConfig::default(), chrono::Utc::now()).unwrap();
    let fusion = EngineConfig::default().fusion;
    let recommender = Recommender::new(&artifact, &fusion);
    for id in artifact.paper_ids() {
        for r in recommender.recommend(id, Method::Hybrid, 5).results {
            let parts = r.breakdown.unwrap();
            if let (Some(content), Some(cluster)) = (parts.content, parts.cluster) {
                assert!(r.score >= content.min(cluster) - 1e-6);
                assert!(r.score <= content.max(cluster) + 1e-6);
            }
        }
    }
}

#[test]
fn test_empty_corpus_is_not_initialized() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(Vec::new(), dir.path());
    assert_eq!(engine.initialize().unwrap(), EngineState::NotInitialized);

    let recs = engine.recommend("anything", Method::Content, 5);
    assert!(recs.results.is_empty());
    assert_eq!(recs.reason().as_deref(), Some("not initialized"));
}

#[test]
fn test_unknown_paper_is_not_found() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(sample_papers(), dir.path());
    engine.initialize().unwrap();
    let recs = engine.recommend("9999.9999", Method::Hybrid, 5);
    assert_eq!(
        recs.status,
        QueryStatus::NotFound {
            paper_id: "9999.9999".to_string()
        }
    );
    assert!(recs.results.is_empty());
}

#[test]
fn test_search_by_text_returns_at_most_size() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(sample_papers(), dir.path());
    engine.initialize().unwrap();

    let recs = engine.search_by_text("quantum computing", 10);
    assert!(recs.is_ok());
    assert_eq!(recs.results.len(), 6);
    assert!(recs.results[0].paper_id == "2401.0001" || recs.results[0].paper_id == "2401.0002");

    let empty = engine.search_by_text("   ", 10);
    assert_eq!(empty.reason().as_deref(), Some("empty query"));
}

#[test]
fn test_cache_round_trip_and_corruption_recovery() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(sample_papers(), dir.path());
    engine.initialize().unwrap();
    let original = engine.current().unwrap();

    let cache = IndexCache::new(dir.path());
    let loaded = cache.load(&EngineConfig::default().recency).unwrap().unwrap();
    assert_eq!(loaded.paper_ids(), original.paper_ids());
    assert_eq!(loaded.embeddings(), original.embeddings());

    // damage the published generation
    let current = cache.current_generation().unwrap().unwrap();
    std::fs::write(dir.path().join(&current).join("embeddings.bin"), b"truncated").unwrap();
    assert!(matches!(
        cache.load(&EngineConfig::default().recency),
        Err(Error::CacheCorrupt(_))
    ));

    // a fresh engine rebuilds instead of serving the damaged artifact
    let recovered = engine_with(sample_papers(), dir.path());
    assert_eq!(recovered.initialize().unwrap(), EngineState::Ready);
    assert_eq!(recovered.stats().corpus_size, 6);
    assert!(cache.load(&EngineConfig::default().recency).unwrap().is_some());
}

#[test]
fn test_ingest_then_reload_from_cache() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(sample_papers(), dir.path());
    engine.initialize().unwrap();
    let report = engine
        .ingest(vec![Paper::new("2401.0007", "Quantum decoders", "Neural decoding of surface codes")
            .with_categories(["quant-ph"])])
        .unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.corpus_size, 7);

    let reloaded = engine_with(sample_papers(), dir.path());
    reloaded.initialize().unwrap();
    assert_eq!(reloaded.stats().corpus_size, 7);
    assert!(reloaded.recommend("2401.0007", Method::Content, 3).is_ok());
}

#[test]
fn test_jsonl_corpus_end_to_end() {
    let dir = TempDir::new().unwrap();
    let corpus = JsonlCorpus::new(dir.path().join("papers.jsonl"));
    corpus.append(&sample_papers()).unwrap();
    assert_eq!(corpus.list_papers(None).unwrap().len(), 6);

    let engine = RecommendationEngine::new(EngineConfig::default(), hashing_provider(), Arc::new(corpus))
        .unwrap()
        .with_cache(IndexCache::new(dir.path().join("cache")));
    engine.initialize().unwrap();
    let topics = engine.trending_topics(10);
    assert_eq!(topics.len(), 3);
    assert_eq!(topics.iter().map(|t| t.size).sum::<usize>(), 6);

    // ingested papers land in the file and survive a full rebuild
    engine
        .ingest(vec![Paper::new("2401.0007", "Quantum decoders", "Neural decoding of surface codes")])
        .unwrap();
    let on_disk = JsonlCorpus::new(dir.path().join("papers.jsonl"));
    assert_eq!(on_disk.list_papers(None).unwrap().len(), 7);
    engine.rebuild(true).unwrap();
    assert_eq!(engine.stats().corpus_size, 7);
    assert!(engine.recommend("2401.0007", Method::Content, 3).is_ok());
}
