pub mod chunking;
pub mod config;
pub mod controller;
pub mod embedding_gate;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod query;
pub mod rag;
pub mod retrieval;
pub mod run_record;
pub mod stores;
pub mod traits;

pub use chunking::{
    clean_text, normalize_whitespace, CharRatioTokenCounter, Chunker, ChunkingConfig, Chunks,
    ModelTokenCounter, TokenCounter, WhitespaceTokenCounter,
};
pub use config::{EmbeddingGateConfig, FusionWeights, HttpClientConfig, RagConfig, RetrievalConfig};
pub use controller::{CancellationFlag, IndexController};
pub use embedding_gate::{EmbeddingGate, EmbeddingHandle, EmbeddingOutcome};
pub use embeddings::{
    embed_with_retry, verify_embedder, CharacterNgramEmbedder, Embedder, HttpEmbedder, RetryPolicy,
};
pub use error::{EmbedError, GenerationError, IngestError, RunRecordError, SearchError};
pub use extractor::{
    DocumentExtractor, ExtractedText, ExtractorRegistry, HtmlExtractor, PdfExtractor,
    PlainTextExtractor,
};
pub use ingest::{discover_documents, parse_prevrun_dt};
pub use models::{
    Chunk, DocumentRecord, EmbeddingRecord, IngestionOptions, RetrievalResult, RunSummary,
    SearchHit, SearchMode, SearchQuery, TermIndexEntry,
};
pub use query::is_question;
pub use rag::{assemble_context, Generator, HttpGenerator, RagAnswer, RagPipeline};
pub use retrieval::HybridRetriever;
pub use run_record::{RunRecord, RunRecordStore};
pub use stores::{MemoryTermIndex, MemoryVectorStore, OpenSearchTermIndex, QdrantVectorStore};
pub use traits::{TermIndex, VectorStore};
