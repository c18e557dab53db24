//! Ingestion run driver.
//!
//! Extraction and chunking run on a bounded pool of blocking workers. The
//! controller loop alone decides, per prepared document and per enabled
//! index, whether the content is already stored there and under which
//! document id it is written; the writes then run
//! as tasks that embed through the [`EmbeddingGate`] and upsert into the
//! enabled indexes. Counters, the in-run fingerprint claims and the run
//! record belong to the loop.

use crate::chunking::{clean_text, Chunker, TokenCounter, WhitespaceTokenCounter};
use crate::config::EmbeddingGateConfig;
use crate::embedding_gate::{EmbeddingGate, EmbeddingHandle};
use crate::embeddings::{verify_embedder, Embedder};
use crate::extractor::ExtractorRegistry;
use crate::ingest::{discover_documents, document_id, file_title, fingerprint, is_eligible, modified_at};
use crate::models::{
    chunk_id, Chunk, DocumentRecord, EmbeddingRecord, ExtractionStatus, IndexedDocument,
    IngestionOptions, RunSummary, TermIndexEntry,
};
use crate::run_record::{RunRecord, RunRecordStore};
use crate::traits::{TermIndex, VectorStore};
use crate::{IngestError, SearchError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Shared stop signal; checked before each document starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct PreparedDocument {
    document: DocumentRecord,
    text: String,
    chunks: Vec<Chunk>,
}

impl PreparedDocument {
    /// Moves the document and its chunks under another id.
    fn reassign(&mut self, document_id: &str) {
        if self.document.document_id == document_id {
            return;
        }
        self.document.document_id = document_id.to_string();
        for chunk in &mut self.chunks {
            chunk.document_id = document_id.to_string();
            chunk.chunk_id = chunk_id(document_id, chunk.chunk_index);
        }
    }
}

enum Prepared {
    Ready(Box<PreparedDocument>),
    Filtered,
    /// Extraction failed or yielded no text; `status` tells which.
    Unindexable(Box<DocumentRecord>, Option<IngestError>),
    Cancelled,
}

/// Which indexes still need this content.
struct WritePlan {
    document_id: String,
    term_index: bool,
    vector_store: bool,
}

struct WriteOutcome {
    source_path: String,
    document_id: String,
    chunks_indexed: usize,
    chunks_failed: usize,
    error: Option<String>,
}

#[derive(Clone)]
struct WriteTargets {
    term_index: Option<Arc<dyn TermIndex>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    embeddings: Option<EmbeddingHandle>,
}

pub struct IndexController {
    term_index: Arc<dyn TermIndex>,
    vector_store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    extractors: ExtractorRegistry,
    token_counter: Arc<dyn TokenCounter>,
    gate_config: EmbeddingGateConfig,
    cancellation: CancellationFlag,
}

impl IndexController {
    pub fn new(
        term_index: Arc<dyn TermIndex>,
        vector_store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            term_index,
            vector_store,
            embedder,
            extractors: ExtractorRegistry::with_defaults()?,
            token_counter: Arc::new(WhitespaceTokenCounter),
            gate_config: EmbeddingGateConfig::default(),
            cancellation: CancellationFlag::new(),
        })
    }

    pub fn with_extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_token_counter(mut self, token_counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = token_counter;
        self
    }

    pub fn with_gate_config(mut self, gate_config: EmbeddingGateConfig) -> Self {
        self.gate_config = gate_config;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    /// Ingests every eligible document under `target`.
    ///
    /// Per-document failures are counted in the summary. An `Err` means the
    /// run could not start or its state could not be persisted. `run_record`
    /// is advanced to this run's start time only when the run completes
    /// without cancellation.
    pub async fn run(
        &self,
        target: &Path,
        options: &IngestionOptions,
        run_record: Option<&RunRecordStore>,
    ) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();

        if !options.full_text && !options.embeddings {
            info!("full-text and embedding indexing are both disabled; nothing to do");
            return Ok(RunSummary::default());
        }

        let chunker = Chunker::new(options.chunking, Arc::clone(&self.token_counter))?;
        self.ensure_ready(options).await?;

        let files = discover_documents(target, &self.extractors)?;
        info!(
            target = %target.display(),
            discovered = files.len(),
            modified_after = ?options.modified_after,
            "ingestion run started"
        );

        let gate = options
            .embeddings
            .then(|| EmbeddingGate::spawn(Arc::clone(&self.embedder), self.gate_config.clone()));

        let mut summary = RunSummary {
            discovered: files.len(),
            ..RunSummary::default()
        };
        let mut preparing = self.spawn_preparation(files, &chunker, options.workers, options.modified_after);
        let mut writing: JoinSet<WriteOutcome> = JoinSet::new();
        let mut claims: HashMap<String, String> = HashMap::new();

        while let Some(joined) = preparing.join_next().await {
            let mut prepared = match joined {
                Ok((_, Ok(Prepared::Ready(prepared)))) => prepared,
                Ok((_, Ok(Prepared::Filtered))) => {
                    summary.skipped_filtered += 1;
                    continue;
                }
                Ok((_, Ok(Prepared::Unindexable(document, error)))) => {
                    match (document.status, error) {
                        (ExtractionStatus::Failed, Some(error)) => {
                            warn!(path = %document.source_path, %error, "extraction failed");
                            summary.failed += 1;
                        }
                        _ => {
                            info!(path = %document.source_path, "no text extracted, skipping");
                            summary.skipped_empty += 1;
                        }
                    }
                    continue;
                }
                Ok((_, Ok(Prepared::Cancelled))) => continue,
                Ok((path, Err(error))) => {
                    warn!(path = %path.display(), %error, "document preparation failed");
                    summary.failed += 1;
                    continue;
                }
                Err(error) => {
                    warn!(%error, "preparation task failed");
                    summary.failed += 1;
                    continue;
                }
            };

            if self.cancellation.is_cancelled() {
                continue;
            }

            let fingerprint = prepared.document.fingerprint.clone();
            if let Some(owner) = claims.get(&fingerprint) {
                debug!(
                    path = %prepared.document.source_path,
                    document_id = %owner,
                    "same content already claimed in this run"
                );
                summary.skipped_duplicate += 1;
                continue;
            }

            let plan = match self.plan_writes(&prepared.document, options).await {
                Ok(plan) => plan,
                Err(error) => {
                    warn!(path = %prepared.document.source_path, %error, "duplicate lookup failed");
                    summary.failed += 1;
                    continue;
                }
            };

            if !plan.term_index && !plan.vector_store {
                if plan.document_id != prepared.document.document_id {
                    warn!(
                        path = %prepared.document.source_path,
                        document_id = %prepared.document.document_id,
                        duplicate_of = %plan.document_id,
                        "content already indexed under another document; \
                         any earlier entry for this path is left as it was"
                    );
                } else {
                    debug!(path = %prepared.document.source_path, "already indexed, skipping");
                }
                claims.insert(fingerprint, plan.document_id);
                summary.skipped_duplicate += 1;
                continue;
            }

            claims.insert(fingerprint, plan.document_id.clone());
            prepared.reassign(&plan.document_id);

            let targets = WriteTargets {
                term_index: plan.term_index.then(|| Arc::clone(&self.term_index)),
                vector_store: plan.vector_store.then(|| Arc::clone(&self.vector_store)),
                embeddings: plan
                    .vector_store
                    .then(|| gate.as_ref().map(EmbeddingGate::handle))
                    .flatten(),
            };
            writing.spawn(write_document(*prepared, targets));
        }

        while let Some(joined) = writing.join_next().await {
            match joined {
                Ok(outcome) => {
                    summary.chunks_indexed += outcome.chunks_indexed;
                    summary.chunks_failed += outcome.chunks_failed;
                    match outcome.error {
                        None => {
                            info!(
                                path = %outcome.source_path,
                                document_id = %outcome.document_id,
                                chunks = outcome.chunks_indexed,
                                "document indexed"
                            );
                            summary.processed += 1;
                        }
                        Some(error) => {
                            warn!(
                                path = %outcome.source_path,
                                document_id = %outcome.document_id,
                                %error,
                                "document indexing failed"
                            );
                            summary.failed += 1;
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "write task failed");
                    summary.failed += 1;
                }
            }
        }

        if let Some(gate) = gate {
            gate.shutdown().await;
        }

        summary.cancelled = self.cancellation.is_cancelled();
        if summary.cancelled {
            warn!(%summary, "ingestion run cancelled; run record not advanced");
            return Ok(summary);
        }

        if let Some(store) = run_record {
            store.save(&RunRecord::advanced_to(started_at)).await?;
        }
        info!(%summary, "ingestion run finished");
        Ok(summary)
    }

    async fn ensure_ready(&self, options: &IngestionOptions) -> Result<(), IngestError> {
        if options.full_text {
            self.term_index
                .ensure_ready()
                .await
                .map_err(|error| IngestError::Fatal(format!("term index not ready: {error}")))?;
        }

        if options.embeddings {
            verify_embedder(self.embedder.as_ref(), &self.gate_config.retry)
                .await
                .map_err(|error| IngestError::Fatal(format!("embedder not ready: {error}")))?;
            self.vector_store
                .ensure_ready(self.embedder.dimensions())
                .await
                .map_err(|error| IngestError::Fatal(format!("vector store not ready: {error}")))?;
        }
        Ok(())
    }

    /// Asks each enabled index whether it already holds this content.
    ///
    /// An index that has the fingerprint is skipped unless overwriting is on.
    /// A term entry flagged stale is rewritten when embeddings are enabled so
    /// the flag clears once vectors exist. The write goes to the id the
    /// content is already stored under, if any.
    async fn plan_writes(
        &self,
        document: &DocumentRecord,
        options: &IngestionOptions,
    ) -> Result<WritePlan, SearchError> {
        let in_terms: Option<IndexedDocument> = if options.full_text {
            self.term_index.find_by_fingerprint(&document.fingerprint).await?
        } else {
            None
        };
        let in_vectors: Option<IndexedDocument> = if options.embeddings {
            self.vector_store.find_by_fingerprint(&document.fingerprint).await?
        } else {
            None
        };

        let overwrite = options.overwrite_on_duplicate;
        let stale = in_terms.as_ref().is_some_and(|existing| existing.embeddings_stale);
        let term_index = options.full_text
            && (in_terms.is_none() || overwrite || (stale && options.embeddings));
        let vector_store = options.embeddings && (in_vectors.is_none() || overwrite);

        let document_id = in_terms
            .or(in_vectors)
            .map(|existing| existing.document_id)
            .unwrap_or_else(|| document.document_id.clone());

        if overwrite && document_id != document.document_id {
            debug!(
                path = %document.source_path,
                document_id = %document_id,
                "overwriting existing document with identical content"
            );
        } else if stale && term_index {
            debug!(
                path = %document.source_path,
                document_id = %document_id,
                "reprocessing document with stale embeddings"
            );
        }

        Ok(WritePlan {
            document_id,
            term_index,
            vector_store,
        })
    }

    fn spawn_preparation(
        &self,
        files: Vec<PathBuf>,
        chunker: &Chunker,
        workers: usize,
        modified_after: Option<DateTime<Utc>>,
    ) -> JoinSet<(PathBuf, Result<Prepared, IngestError>)> {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut preparing = JoinSet::new();

        for path in files {
            let permits = Arc::clone(&permits);
            let cancellation = self.cancellation.clone();
            let extractors = self.extractors.clone();
            let chunker = chunker.clone();

            preparing.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (path, Ok(Prepared::Cancelled));
                };
                if cancellation.is_cancelled() {
                    return (path, Ok(Prepared::Cancelled));
                }

                let task_path = path.clone();
                let result = tokio::task::spawn_blocking(move || {
                    prepare_document(&task_path, &extractors, &chunker, modified_after)
                })
                .await
                .unwrap_or_else(|error| Err(IngestError::Worker(error.to_string())));
                (path, result)
            });
        }

        preparing
    }
}

fn prepare_document(
    path: &Path,
    extractors: &ExtractorRegistry,
    chunker: &Chunker,
    modified_after: Option<DateTime<Utc>>,
) -> Result<Prepared, IngestError> {
    let modified = modified_at(path)?;
    if !is_eligible(modified, modified_after) {
        return Ok(Prepared::Filtered);
    }

    let mut document = DocumentRecord {
        document_id: document_id(path),
        source_path: path.display().to_string(),
        title: file_title(path)?,
        modified_at: modified,
        fingerprint: String::new(),
        status: ExtractionStatus::Extracted,
    };

    let extracted = match extractors.extract(path) {
        Ok(extracted) => extracted,
        Err(error) => {
            document.status = ExtractionStatus::Failed;
            return Ok(Prepared::Unindexable(Box::new(document), Some(error)));
        }
    };
    let text = clean_text(&extracted.text);
    if text.trim().is_empty() {
        document.status = ExtractionStatus::Empty;
        return Ok(Prepared::Unindexable(Box::new(document), None));
    }

    if let Some(title) = extracted.title {
        document.title = title;
    }
    document.fingerprint = fingerprint(&text);

    let chunks: Vec<Chunk> = chunker
        .chunk(&document, &text, extracted.section_path.as_deref())
        .collect();
    if chunks.is_empty() {
        document.status = ExtractionStatus::Empty;
        return Ok(Prepared::Unindexable(Box::new(document), None));
    }

    Ok(Prepared::Ready(Box::new(PreparedDocument {
        document,
        text,
        chunks,
    })))
}

/// Embeds and writes one document. Vectors are written only when every
/// chunk embedded; otherwise the previous vectors stay and the term entry is
/// flagged stale so a later run repairs it.
async fn write_document(prepared: PreparedDocument, targets: WriteTargets) -> WriteOutcome {
    let PreparedDocument {
        document,
        text,
        chunks,
    } = prepared;

    let mut outcome = WriteOutcome {
        source_path: document.source_path.clone(),
        document_id: document.document_id.clone(),
        chunks_indexed: 0,
        chunks_failed: 0,
        error: None,
    };

    let mut embeddings_current = true;
    if let (Some(handle), Some(store)) = (&targets.embeddings, &targets.vector_store) {
        match embed_and_store(handle, store.as_ref(), &document, &chunks).await {
            Ok(written) => outcome.chunks_indexed = written,
            Err((failed, error)) => {
                embeddings_current = false;
                outcome.chunks_failed = failed;
                outcome.error = Some(error);
            }
        }
    }

    if let Some(term_index) = &targets.term_index {
        let entry = TermIndexEntry {
            document_id: document.document_id.clone(),
            source_path: document.source_path.clone(),
            title: document.title.clone(),
            modified_at: document.modified_at,
            fingerprint: document.fingerprint.clone(),
            text,
            embeddings_stale: !embeddings_current,
            indexed_at: Utc::now(),
        };
        if let Err(error) = term_index.upsert(&entry).await {
            let message = format!("term index write failed: {error}");
            outcome.error = Some(match outcome.error.take() {
                Some(previous) => format!("{previous}; {message}"),
                None => message,
            });
        }
    }

    outcome
}

async fn embed_and_store(
    handle: &EmbeddingHandle,
    store: &dyn VectorStore,
    document: &DocumentRecord,
    chunks: &[Chunk],
) -> Result<usize, (usize, String)> {
    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let embedded = handle
        .embed(texts)
        .await
        .map_err(|error| (chunks.len(), error.to_string()))?;

    if !embedded.is_complete() {
        return Err((
            embedded.failed_count(),
            format!(
                "{} of {} chunks failed to embed: {}",
                embedded.failed_count(),
                chunks.len(),
                embedded.failures.join("; ")
            ),
        ));
    }

    let records: Vec<EmbeddingRecord> = chunks
        .iter()
        .zip(embedded.vectors)
        .filter_map(|(chunk, vector)| {
            Some(EmbeddingRecord {
                chunk_id: chunk.chunk_id.clone(),
                document_id: chunk.document_id.clone(),
                chunk_index: chunk.chunk_index,
                fingerprint: document.fingerprint.clone(),
                model: handle.model_id().to_string(),
                source_path: document.source_path.clone(),
                snippet: chunk.body.clone(),
                vector: vector?,
            })
        })
        .collect();

    store
        .upsert(&records)
        .await
        .map_err(|error| (chunks.len(), format!("vector store write failed: {error}")))?;

    let surplus_from = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
    if let Err(error) = store.delete_chunks_from(&document.document_id, surplus_from).await {
        warn!(document_id = %document.document_id, %error, "stale chunks not removed");
    }
    Ok(records.len())
}
