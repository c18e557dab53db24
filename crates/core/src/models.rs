use crate::chunking::ChunkingConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Extracted,
    Empty,
    Failed,
}

/// One logical source file. The id is stable across re-ingestion of the same path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub source_path: String,
    pub title: String,
    pub modified_at: DateTime<Utc>,
    pub fingerprint: String,
    pub status: ExtractionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    /// `"{title} > {section}"`, also the first line of `text`.
    pub context: String,
    pub body: String,
    /// Context plus body; this is what gets embedded.
    pub text: String,
    pub token_count: usize,
    /// Tokens of `body` repeated from the previous chunk.
    pub overlap_prev: usize,
    /// Tokens of `body` repeated at the start of the next chunk.
    pub overlap_next: usize,
}

pub fn chunk_id(document_id: &str, chunk_index: u32) -> String {
    format!("{document_id}-{chunk_index}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub fingerprint: String,
    pub model: String,
    pub source_path: String,
    pub snippet: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TermIndexEntry {
    pub document_id: String,
    pub source_path: String,
    pub title: String,
    pub modified_at: DateTime<Utc>,
    pub fingerprint: String,
    pub text: String,
    /// Set when the text was (re)written but its embeddings could not be.
    #[serde(default)]
    pub embeddings_stale: bool,
    pub indexed_at: DateTime<Utc>,
}

/// What a store already holds for a given fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDocument {
    pub document_id: String,
    pub source_path: String,
    pub fingerprint: String,
    pub embeddings_stale: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Lexical,
    Vector,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Lexical => f.write_str("lexical"),
            SearchMode::Vector => f.write_str("vector"),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LexicalHit {
    pub document_id: String,
    pub source_path: String,
    pub title: String,
    pub score: f64,
    pub snippet: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub source_path: String,
    pub score: f64,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub document_id: String,
    pub chunk_id: Option<String>,
    pub source_path: String,
    pub title: Option<String>,
    /// Normalized lexical score, 0.0 when the document had no lexical match.
    pub lexical_score: f64,
    /// Normalized vector score, 0.0 when no chunk was among the neighbors.
    pub vector_score: f64,
    pub fused_score: f64,
    pub raw_lexical_score: Option<f64>,
    pub raw_vector_score: Option<f64>,
    pub snippet: String,
    pub modes: Vec<SearchMode>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub hits: Vec<SearchHit>,
    /// The side that failed when ranking fell back to a single source.
    pub degraded: Option<SearchMode>,
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
}

/// Per-run ingestion switches.
#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub overwrite_on_duplicate: bool,
    pub full_text: bool,
    pub embeddings: bool,
    /// Only documents modified strictly after this instant are processed.
    pub modified_after: Option<DateTime<Utc>>,
    pub workers: usize,
    pub chunking: ChunkingConfig,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            overwrite_on_duplicate: false,
            full_text: true,
            embeddings: true,
            modified_after: None,
            workers: 4,
            chunking: ChunkingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub discovered: usize,
    pub processed: usize,
    pub skipped_duplicate: usize,
    pub skipped_filtered: usize,
    pub skipped_empty: usize,
    pub failed: usize,
    pub chunks_indexed: usize,
    pub chunks_failed: usize,
    pub cancelled: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "discovered={} processed={} skipped_duplicate={} skipped_filtered={} skipped_empty={} failed={} chunks_indexed={} chunks_failed={}",
            self.discovered,
            self.processed,
            self.skipped_duplicate,
            self.skipped_filtered,
            self.skipped_empty,
            self.failed,
            self.chunks_indexed,
            self.chunks_failed,
        )?;
        if self.cancelled {
            f.write_str(" cancelled=true")?;
        }
        Ok(())
    }
}
