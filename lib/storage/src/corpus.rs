// JSON-lines corpus file: one paper object per line.

use papersim_core::{Error, Paper, PaperFilter, PaperSource, Result};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read every paper in a JSONL file. Blank lines are ignored and malformed
/// lines are logged and skipped.
pub fn read_jsonl<P: AsRef<Path>>(path: P) -> Result<Vec<Paper>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| Error::Source(format!("{}: {}", path.display(), e)))?;

    let mut papers = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Paper>(&line) {
            Ok(paper) => papers.push(paper),
            Err(e) => warn!("{}:{}: skipping malformed paper: {}", path.display(), line_no + 1, e),
        }
    }
    debug!("Read {} papers from {}", papers.len(), path.display());
    Ok(papers)
}

/// Corpus collaborator backed by a JSONL file.
#[derive(Debug, Clone)]
pub struct JsonlCorpus {
    path: PathBuf,
}

impl JsonlCorpus {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append papers to the file, creating it if needed.
    pub fn append(&self, papers: &[Paper]) -> Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for paper in papers {
            serde_json::to_writer(&mut writer, paper).map_err(|e| Error::Serialization(e.to_string()))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl PaperSource for JsonlCorpus {
    fn list_papers(&self, filter: Option<&PaperFilter>) -> Result<Vec<Paper>> {
        let papers = read_jsonl(&self.path)?;
        Ok(match filter {
            Some(f) => papers.into_iter().filter(|p| f.matches(p)).collect(),
            None => papers,
        })
    }

    fn add_papers(&self, papers: &[Paper]) -> Result<()> {
        self.append(papers)
    }
}
