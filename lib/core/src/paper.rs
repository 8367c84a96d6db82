//! Paper records and the corpus collaborator seam.
//!
//! Papers are owned by whatever system fetches them; this crate only reads
//! them through [`PaperSource`].

use crate::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A paper as delivered by the corpus collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Paper {
    /// Unique identifier (e.g. an arXiv id)
    pub id: String,

    pub title: String,

    #[serde(rename = "abstract", default)]
    pub abstract_text: String,

    /// Category tags such as `cs.LG`
    #[serde(default)]
    pub categories: BTreeSet<String>,

    /// Raw publication timestamp; parsed lazily so one bad date never
    /// rejects the whole record.
    #[serde(default)]
    pub published: Option<String>,
}

impl Paper {
    pub fn new(id: impl Into<String>, title: impl Into<String>, abstract_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            abstract_text: abstract_text.into(),
            categories: BTreeSet::new(),
            published: None,
        }
    }

    #[must_use]
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_published(mut self, published: impl Into<String>) -> Self {
        self.published = Some(published.into());
        self
    }

    /// Parsed publication time, `None` when missing or unparseable.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published.as_deref().and_then(parse_timestamp)
    }

    /// Text fed to the embedding model: title and abstract, normalized.
    pub fn embedding_text(&self) -> String {
        normalize_text(&format!("{} {}", self.title, self.abstract_text))
    }
}

/// Accepts RFC 3339 and the common date-only / naive forms.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Lowercase, trim, and collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Optional restriction passed to [`PaperSource::list_papers`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperFilter {
    /// Keep papers carrying at least one of these categories
    pub categories: Option<BTreeSet<String>>,
    /// Keep papers published strictly after this instant
    pub published_after: Option<DateTime<Utc>>,
}

impl PaperFilter {
    pub fn matches(&self, paper: &Paper) -> bool {
        if let Some(wanted) = &self.categories {
            if wanted.is_disjoint(&paper.categories) {
                return false;
            }
        }
        if let Some(after) = self.published_after {
            match paper.published_at() {
                Some(published) if published > after => {}
                _ => return false,
            }
        }
        true
    }
}

/// The corpus collaborator. Listed once per rebuild; ingested papers are
/// written through it so later rebuilds see them.
pub trait PaperSource: Send + Sync {
    fn list_papers(&self, filter: Option<&PaperFilter>) -> Result<Vec<Paper>>;

    /// Durably add `papers`. Callers pass only ids the source does not hold.
    fn add_papers(&self, papers: &[Paper]) -> Result<()>;
}

/// Corpus held in memory, mostly for tests and embedding callers.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    papers: RwLock<Vec<Paper>>,
}

impl InMemoryCorpus {
    pub fn new(papers: Vec<Paper>) -> Self {
        Self {
            papers: RwLock::new(papers),
        }
    }

    pub fn add(&self, paper: Paper) {
        self.papers.write().push(paper);
    }

    pub fn len(&self) -> usize {
        self.papers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.papers.read().is_empty()
    }
}

impl PaperSource for InMemoryCorpus {
    fn list_papers(&self, filter: Option<&PaperFilter>) -> Result<Vec<Paper>> {
        let papers = self.papers.read();
        Ok(match filter {
            Some(f) => papers.iter().filter(|p| f.matches(p)).cloned().collect(),
            None => papers.clone(),
        })
    }

    fn add_papers(&self, papers: &[Paper]) -> Result<()> {
        self.papers.write().extend_from_slice(papers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-03-01T12:00:00Z").is_some());
        assert!(parse_timestamp("2024-03-01T12:00:00+02:00").is_some());
        assert!(parse_timestamp("2024-03-01 12:00:00").is_some());
        assert_eq!(parse_timestamp("2024-03-01").map(|d| d.day()), Some(1));
        assert!(parse_timestamp("last tuesday").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_embedding_text_is_normalized() {
        let paper = Paper::new("p1", "  Deep   LEARNING ", "for\tProteins");
        assert_eq!(paper.embedding_text(), "deep learning for proteins");
    }

    #[test]
    fn test_filter_categories_and_dates() {
        let paper = Paper::new("p1", "t", "a")
            .with_categories(["cs.LG", "stat.ML"])
            .with_published("2024-05-01");

        let by_cat = PaperFilter {
            categories: Some(["cs.LG".to_string()].into_iter().collect()),
            published_after: None,
        };
        assert!(by_cat.matches(&paper));

        let other_cat = PaperFilter {
            categories: Some(["q-bio.BM".to_string()].into_iter().collect()),
            published_after: None,
        };
        assert!(!other_cat.matches(&paper));

        let after = PaperFilter {
            categories: None,
            published_after: parse_timestamp("2024-06-01"),
        };
        assert!(!after.matches(&paper));
        assert!(!after.matches(&Paper::new("p2", "t", "a")));
    }

    #[test]
    fn test_in_memory_corpus() {
        let corpus = InMemoryCorpus::default();
        assert!(corpus.is_empty());
        corpus.add(Paper::new("a", "t", "x"));
        assert_eq!(corpus.list_papers(None).unwrap().len(), 1);
        corpus
            .add_papers(&[Paper::new("b", "t", "y"), Paper::new("c", "t", "z")])
            .unwrap();
        assert_eq!(corpus.len(), 3);
    }

    #[test]
    fn test_paper_json_uses_abstract_key() {
        let json = r#"{"id":"x","title":"T","abstract":"A","categories":["cs.AI"]}"#;
        let paper: Paper = serde_json::from_str(json).unwrap();
        assert_eq!(paper.abstract_text, "A");
        assert!(paper.published.is_none());
    }
}
