//! In-process [`TermIndex`] and [`VectorStore`] implementations.
//!
//! Used by tests and by local runs without external services. The term index
//! ranks with Okapi BM25 (k1 = 1.2, b = 0.75); the vector store does a
//! brute-force cosine scan.

use crate::embeddings::cosine_similarity;
use crate::models::{EmbeddingRecord, IndexedDocument, LexicalHit, TermIndexEntry, VectorHit};
use crate::query::{snippet_around, tokenize};
use crate::traits::{TermIndex, VectorStore};
use crate::SearchError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const K1: f64 = 1.2;
const B: f64 = 0.75;
const SNIPPET_WORDS: usize = 60;

fn poisoned(store: &str) -> SearchError {
    SearchError::NotReady(format!("{store} lock poisoned"))
}

struct StoredEntry {
    entry: TermIndexEntry,
    term_counts: HashMap<String, usize>,
    length: usize,
}

#[derive(Default)]
pub struct MemoryTermIndex {
    entries: RwLock<BTreeMap<String, StoredEntry>>,
}

impl MemoryTermIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, StoredEntry>>, SearchError> {
        self.entries.read().map_err(|_| poisoned("term index"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, StoredEntry>>, SearchError> {
        self.entries.write().map_err(|_| poisoned("term index"))
    }

    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, document_id: &str) -> Option<TermIndexEntry> {
        self.read()
            .ok()?
            .get(document_id)
            .map(|stored| stored.entry.clone())
    }

    pub fn entries(&self) -> Vec<TermIndexEntry> {
        self.read()
            .map(|entries| entries.values().map(|stored| stored.entry.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TermIndex for MemoryTermIndex {
    async fn ensure_ready(&self) -> Result<(), SearchError> {
        self.read().map(|_| ())
    }

    async fn upsert(&self, entry: &TermIndexEntry) -> Result<(), SearchError> {
        let terms = tokenize(&entry.text);
        let mut term_counts = HashMap::new();
        for term in &terms {
            *term_counts.entry(term.clone()).or_insert(0) += 1;
        }

        self.write()?.insert(
            entry.document_id.clone(),
            StoredEntry {
                entry: entry.clone(),
                term_counts,
                length: terms.len(),
            },
        );
        Ok(())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IndexedDocument>, SearchError> {
        Ok(self
            .read()?
            .values()
            .find(|stored| stored.entry.fingerprint == fingerprint)
            .map(|stored| IndexedDocument {
                document_id: stored.entry.document_id.clone(),
                source_path: stored.entry.source_path.clone(),
                fingerprint: stored.entry.fingerprint.clone(),
                embeddings_stale: stored.entry.embeddings_stale,
            }))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>, SearchError> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let entries = self.read()?;
        if entries.is_empty() || terms.is_empty() {
            return Ok(Vec::new());
        }

        let total = entries.len() as f64;
        let average_length =
            entries.values().map(|stored| stored.length).sum::<usize>() as f64 / total;

        let mut scored: Vec<(f64, &StoredEntry)> = entries
            .values()
            .filter_map(|stored| {
                let score: f64 = terms
                    .iter()
                    .filter_map(|term| {
                        let frequency = *stored.term_counts.get(term)? as f64;
                        let containing = entries
                            .values()
                            .filter(|other| other.term_counts.contains_key(term))
                            .count() as f64;
                        let idf = ((total - containing + 0.5) / (containing + 0.5) + 1.0).ln();
                        let norm = 1.0 - B + B * stored.length as f64 / average_length.max(1.0);
                        Some(idf * frequency * (K1 + 1.0) / (frequency + K1 * norm))
                    })
                    .sum();
                (score > 0.0).then_some((score, stored))
            })
            .collect();

        scored.sort_by(|left, right| {
            right
                .0
                .total_cmp(&left.0)
                .then_with(|| left.1.entry.document_id.cmp(&right.1.entry.document_id))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, stored)| LexicalHit {
                document_id: stored.entry.document_id.clone(),
                source_path: stored.entry.source_path.clone(),
                title: stored.entry.title.clone(),
                score,
                snippet: Some(snippet_around(&stored.entry.text, &terms, SNIPPET_WORDS)),
                text: None,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    records: RwLock<BTreeMap<String, EmbeddingRecord>>,
    dimensions: RwLock<Option<usize>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, EmbeddingRecord>>, SearchError> {
        self.records.read().map_err(|_| poisoned("vector store"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, EmbeddingRecord>>, SearchError> {
        self.records.write().map_err(|_| poisoned("vector store"))
    }

    pub fn len(&self) -> usize {
        self.read().map(|records| records.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records_for(&self, document_id: &str) -> Vec<EmbeddingRecord> {
        let mut records: Vec<EmbeddingRecord> = self
            .read()
            .map(|records| {
                records
                    .values()
                    .filter(|record| record.document_id == document_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|record| record.chunk_index);
        records
    }

    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .map(|records| records.values().map(|record| record.document_id.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_ready(&self, dimensions: usize) -> Result<(), SearchError> {
        let mut configured = self.dimensions.write().map_err(|_| poisoned("vector store"))?;
        match *configured {
            Some(expected) if expected != dimensions => Err(SearchError::DimensionMismatch {
                expected,
                actual: dimensions,
            }),
            _ => {
                *configured = Some(dimensions);
                Ok(())
            }
        }
    }

    async fn upsert(&self, records: &[EmbeddingRecord]) -> Result<(), SearchError> {
        let expected = *self.dimensions.read().map_err(|_| poisoned("vector store"))?;
        if let Some(expected) = expected {
            if let Some(record) = records.iter().find(|record| record.vector.len() != expected) {
                return Err(SearchError::DimensionMismatch {
                    expected,
                    actual: record.vector.len(),
                });
            }
        }

        let mut stored = self.write()?;
        for record in records {
            stored.insert(record.chunk_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_chunks_from(&self, document_id: &str, from_index: u32) -> Result<(), SearchError> {
        self.write()?.retain(|_, record| {
            record.document_id != document_id || record.chunk_index < from_index
        });
        Ok(())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IndexedDocument>, SearchError> {
        Ok(self
            .read()?
            .values()
            .find(|record| record.fingerprint == fingerprint)
            .map(|record| IndexedDocument {
                document_id: record.document_id.clone(),
                source_path: record.source_path.clone(),
                fingerprint: record.fingerprint.clone(),
                embeddings_stale: false,
            }))
    }

    async fn search(
        &self,
        vector: &[f32],
        model: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>, SearchError> {
        let records = self.read()?;
        let mut hits: Vec<VectorHit> = records
            .values()
            .filter(|record| record.model == model && record.vector.len() == vector.len())
            .map(|record| VectorHit {
                chunk_id: record.chunk_id.clone(),
                document_id: record.document_id.clone(),
                chunk_index: record.chunk_index,
                source_path: record.source_path.clone(),
                score: f64::from(cosine_similarity(vector, &record.vector)),
                snippet: record.snippet.clone(),
            })
            .collect();

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.chunk_id.cmp(&right.chunk_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}
