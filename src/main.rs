use clap::{Parser, Subcommand};
use papersim_core::{EmbeddingProvider, EngineConfig, Method};
use papersim_storage::{read_jsonl, IndexCache, JsonlCorpus, RecommendationEngine};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Semantic recommendations over a corpus of scientific papers
#[derive(Parser, Debug)]
#[command(name = "papersim")]
#[command(about = "Semantic recommendation index for scientific papers", long_about = None)]
struct Args {
    /// Corpus file, one JSON paper per line
    #[arg(long, global = true, default_value = "./data/papers.jsonl")]
    corpus: PathBuf,

    /// Directory holding the index cache
    #[arg(long, global = true, default_value = "./data/cache")]
    cache_dir: PathBuf,

    /// JSON engine configuration; defaults apply to omitted fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the cached index or build it from the corpus
    Build {
        /// Discard the cache and rebuild from scratch
        #[arg(long)]
        force: bool,
    },
    /// Add the papers in a JSONL file to the corpus and the index
    Ingest { file: PathBuf },
    /// Papers related to a paper already in the index
    Recommend {
        paper_id: String,
        #[arg(long, default_value = "hybrid")]
        method: Method,
        #[arg(short, default_value_t = 10)]
        k: usize,
    },
    /// Papers closest to a free-text query
    Search {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(short, default_value_t = 10)]
        k: usize,
    },
    /// Corpus size, dimension, cluster count and build time
    Stats,
    /// Most popular topic clusters
    Topics {
        #[arg(short, default_value_t = 5)]
        n: usize,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let provider = EmbeddingProvider::from_config(&config.embedding)?;
    let corpus = Arc::new(JsonlCorpus::new(&args.corpus));
    let engine = RecommendationEngine::new(config, provider, corpus.clone())?.with_cache(IndexCache::new(&args.cache_dir));

    match args.command {
        Command::Build { force } => {
            let outcome = if force {
                Some(engine.rebuild(true)?)
            } else {
                engine.initialize()?;
                None
            };
            print_json(&serde_json::json!({
                "outcome": outcome,
                "stats": engine.stats(),
            }))
        }
        Command::Ingest { file } => {
            let papers = read_jsonl(&file)?;
            if !corpus.path().exists() {
                // start an empty corpus so the source can be listed
                corpus.append(&[])?;
            }
            engine.initialize()?;
            let report = engine.ingest(papers)?;
            info!("Ingested {} papers into {:?}", report.added, corpus.path());
            print_json(&report)
        }
        Command::Recommend { paper_id, method, k } => {
            engine.initialize()?;
            let recs = engine.recommend(&paper_id, method, k);
            print_json(&serde_json::json!({
                "paper_id": paper_id,
                "method": method,
                "results": recs.results,
                "reason": recs.reason(),
            }))
        }
        Command::Search { query, k } => {
            engine.initialize()?;
            let query = query.join(" ");
            let recs = engine.search_by_text(&query, k);
            print_json(&serde_json::json!({
                "query": query,
                "results": recs.results,
                "reason": recs.reason(),
            }))
        }
        Command::Stats => {
            engine.initialize()?;
            print_json(&engine.stats())
        }
        Command::Topics { n } => {
            engine.initialize()?;
            print_json(&engine.trending_topics(n))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries the JSON output
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting papersim v{}", env!("CARGO_PKG_VERSION"));
    info!("Corpus: {:?}, cache: {:?}", args.corpus, args.cache_dir);

    // index builds are CPU-bound and blocking
    tokio::task::spawn_blocking(move || run(args)).await?
}
