//! Query-time hybrid search.
//!
//! The lexical and vector sides run concurrently. Vector hits are chunks, so
//! they are collapsed to the best chunk per document before both sides are
//! min-max normalized and combined with a weighted sum. A failing side
//! degrades the result to single-source ranking.

use crate::config::RetrievalConfig;
use crate::embeddings::{embed_with_retry, Embedder, RetryPolicy};
use crate::models::{LexicalHit, RetrievalResult, SearchHit, SearchMode, SearchQuery, VectorHit};
use crate::query::{content_terms, lexical_query, snippet_around};
use crate::traits::{TermIndex, VectorStore};
use crate::{EmbedError, SearchError};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct HybridRetriever {
    term_index: Arc<dyn TermIndex>,
    vector_store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
    retry: RetryPolicy,
}

impl HybridRetriever {
    pub fn new(
        term_index: Arc<dyn TermIndex>,
        vector_store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            term_index,
            vector_store,
            embedder,
            config: RetrievalConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<RetrievalResult, SearchError> {
        if query.text.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }
        if query.top_k == 0 {
            return Err(SearchError::Request("top_k must be at least 1".to_string()));
        }
        self.config.weights.validate()?;

        let lexical_k = query.top_k.max(self.config.candidate_k_lexical);
        let vector_k = query.top_k.max(self.config.candidate_k_vector);
        let lexical_text = lexical_query(&query.text);

        let (lexical, vector) = tokio::join!(
            self.term_index.search(&lexical_text, lexical_k),
            self.vector_side(&query.text, vector_k)
        );

        let (lexical, vector, degraded) = match (lexical, vector) {
            (Ok(lexical), Ok(vector)) => (lexical, vector, None),
            (Err(error), Ok(vector)) => {
                warn!(%error, "lexical search failed, ranking by vector similarity only");
                (Vec::new(), vector, Some(SearchMode::Lexical))
            }
            (Ok(lexical), Err(error)) => {
                warn!(%error, "vector search failed, ranking by term score only");
                (lexical, Vec::new(), Some(SearchMode::Vector))
            }
            (Err(lexical), Err(vector)) => {
                return Err(SearchError::Retrieval {
                    lexical: lexical.to_string(),
                    vector: vector.to_string(),
                })
            }
        };

        debug!(
            query = %query.text,
            lexical = lexical.len(),
            vector = vector.len(),
            "fusing candidates"
        );

        let terms = content_terms(&query.text);
        Ok(RetrievalResult {
            query: query.text.clone(),
            lexical_candidates: lexical.len(),
            vector_candidates: vector.len(),
            hits: self.fuse(lexical, vector, &terms, query.top_k),
            degraded,
        })
    }

    async fn vector_side(&self, text: &str, limit: usize) -> Result<Vec<VectorHit>, SearchError> {
        let vector = embed_with_retry(self.embedder.as_ref(), &[text.to_string()], &self.retry)
            .await?
            .pop()
            .ok_or(EmbedError::CountMismatch {
                expected: 1,
                actual: 0,
            })?;
        self.vector_store
            .search(&vector, self.embedder.model_id(), limit)
            .await
    }

    fn fuse(
        &self,
        lexical: Vec<LexicalHit>,
        vector: Vec<VectorHit>,
        terms: &[String],
        top_k: usize,
    ) -> Vec<SearchHit> {
        let lexical = best_per_document(lexical, |hit| &hit.document_id, |hit| hit.score);
        let vector = best_per_document(vector, |hit| &hit.document_id, |hit| hit.score);
        let lexical_norm = normalize(lexical.values().map(|hit| hit.score));
        let vector_norm = normalize(vector.values().map(|hit| hit.score));
        let weights = self.config.weights;

        let mut candidates: BTreeMap<&str, (Option<(&LexicalHit, f64)>, Option<(&VectorHit, f64)>)> =
            BTreeMap::new();
        for (hit, norm) in lexical.values().zip(lexical_norm) {
            candidates.entry(hit.document_id.as_str()).or_default().0 = Some((hit, norm));
        }
        for (hit, norm) in vector.values().zip(vector_norm) {
            candidates.entry(hit.document_id.as_str()).or_default().1 = Some((hit, norm));
        }

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .map(|(document_id, (lexical, vector))| {
                let lexical_score = lexical.map_or(0.0, |(_, norm)| norm);
                let vector_score = vector.map_or(0.0, |(_, norm)| norm);

                let mut modes = Vec::with_capacity(2);
                if lexical.is_some() {
                    modes.push(SearchMode::Lexical);
                }
                if vector.is_some() {
                    modes.push(SearchMode::Vector);
                }

                let snippet = match (vector, lexical) {
                    (Some((chunk, _)), _) if !chunk.snippet.is_empty() => chunk.snippet.clone(),
                    (_, Some((hit, _))) => lexical_snippet(hit, terms, self.config.snippet_words),
                    _ => String::new(),
                };

                SearchHit {
                    document_id: document_id.to_string(),
                    chunk_id: vector.map(|(chunk, _)| chunk.chunk_id.clone()),
                    source_path: lexical
                        .map(|(hit, _)| hit.source_path.clone())
                        .or_else(|| vector.map(|(chunk, _)| chunk.source_path.clone()))
                        .unwrap_or_default(),
                    title: lexical.map(|(hit, _)| hit.title.clone()),
                    lexical_score,
                    vector_score,
                    fused_score: weights.lexical * lexical_score + weights.vector * vector_score,
                    raw_lexical_score: lexical.map(|(hit, _)| hit.score),
                    raw_vector_score: vector.map(|(chunk, _)| chunk.score),
                    snippet,
                    modes,
                }
            })
            .collect();

        hits.sort_by(rank_order);
        hits.truncate(top_k);
        hits
    }
}

/// Fused score, then normalized lexical, then raw lexical, all descending;
/// then document id ascending.
fn rank_order(left: &SearchHit, right: &SearchHit) -> Ordering {
    right
        .fused_score
        .total_cmp(&left.fused_score)
        .then_with(|| right.lexical_score.total_cmp(&left.lexical_score))
        .then_with(|| {
            let left_raw = left.raw_lexical_score.unwrap_or(f64::NEG_INFINITY);
            let right_raw = right.raw_lexical_score.unwrap_or(f64::NEG_INFINITY);
            right_raw.total_cmp(&left_raw)
        })
        .then_with(|| left.document_id.cmp(&right.document_id))
}

fn lexical_snippet(hit: &LexicalHit, terms: &[String], max_words: usize) -> String {
    match (&hit.snippet, &hit.text) {
        (Some(snippet), _) if !snippet.is_empty() => snippet.clone(),
        (_, Some(text)) => snippet_around(text, terms, max_words),
        _ => String::new(),
    }
}

/// Keeps the highest-scoring hit of each document; ties keep the first seen.
fn best_per_document<T>(
    hits: Vec<T>,
    document_id: impl Fn(&T) -> &String,
    score: impl Fn(&T) -> f64,
) -> BTreeMap<String, T> {
    let mut best: BTreeMap<String, T> = BTreeMap::new();
    for hit in hits {
        match best.get(document_id(&hit)) {
            Some(current) if score(current) >= score(&hit) => {}
            _ => {
                best.insert(document_id(&hit).clone(), hit);
            }
        }
    }
    best
}

/// Min-max scaling into [0, 1]; a set of equal scores maps to 1.0.
fn normalize(scores: impl Iterator<Item = f64>) -> Vec<f64> {
    let scores: Vec<f64> = scores.collect();
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;

    scores
        .into_iter()
        .map(|score| if range > 0.0 { (score - min) / range } else { 1.0 })
        .collect()
}
