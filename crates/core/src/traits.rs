use crate::models::{EmbeddingRecord, IndexedDocument, LexicalHit, TermIndexEntry, VectorHit};
use crate::SearchError;
use async_trait::async_trait;

/// Full-text collaborator: one entry per document id, ranked by the engine's
/// own term scoring.
#[async_trait]
pub trait TermIndex: Send + Sync {
    /// Creates the index if needed; fails when the service is unreachable.
    async fn ensure_ready(&self) -> Result<(), SearchError>;

    /// Insert or replace the entry keyed by `entry.document_id`.
    async fn upsert(&self, entry: &TermIndexEntry) -> Result<(), SearchError>;

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IndexedDocument>, SearchError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>, SearchError>;
}

/// Nearest-neighbor collaborator over chunk embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Creates the collection for `dimensions` if needed; fails when the
    /// service is unreachable or an existing collection has another size.
    async fn ensure_ready(&self, dimensions: usize) -> Result<(), SearchError>;

    /// Insert or replace records keyed by `chunk_id`.
    async fn upsert(&self, records: &[EmbeddingRecord]) -> Result<(), SearchError>;

    /// Removes chunks of `document_id` with `chunk_index >= from_index`.
    async fn delete_chunks_from(&self, document_id: &str, from_index: u32) -> Result<(), SearchError>;

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IndexedDocument>, SearchError>;

    /// Neighbors of `vector` among records written by `model`.
    async fn search(
        &self,
        vector: &[f32],
        model: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>, SearchError>;
}
