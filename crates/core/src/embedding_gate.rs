//! Single-owner embedding channel.
//!
//! One task owns the [`Embedder`]. Ingestion workers submit whole documents
//! through a bounded `mpsc` queue and wait on a `oneshot` reply. The owner
//! splits each job into model batches and admits at most `max_in_flight`
//! batches at a time, so a shared accelerator never sees more concurrent
//! calls than configured.

use crate::config::EmbeddingGateConfig;
use crate::embeddings::{embed_with_retry, Embedder};
use crate::error::EmbedError;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Per-text results of one job, in submission order.
#[derive(Debug, Default)]
pub struct EmbeddingOutcome {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failures: Vec<String>,
}

impl EmbeddingOutcome {
    pub fn failed_count(&self) -> usize {
        self.vectors.iter().filter(|vector| vector.is_none()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_count() == 0
    }
}

struct EmbedJob {
    texts: Vec<String>,
    reply: oneshot::Sender<EmbeddingOutcome>,
}

/// Cloneable submission side of the gate.
#[derive(Clone)]
pub struct EmbeddingHandle {
    tx: mpsc::Sender<EmbedJob>,
    model_id: Arc<str>,
    dimensions: usize,
}

impl std::fmt::Debug for EmbeddingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingHandle")
            .field("model_id", &self.model_id)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl EmbeddingHandle {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embeds `texts`, keeping their order. Chunks whose batch failed after
    /// retries come back as `None`.
    pub async fn embed(&self, texts: Vec<String>) -> Result<EmbeddingOutcome, EmbedError> {
        if texts.is_empty() {
            return Ok(EmbeddingOutcome::default());
        }

        let (reply, response) = oneshot::channel();
        self.tx
            .send(EmbedJob { texts, reply })
            .await
            .map_err(|_| EmbedError::GateClosed)?;
        response.await.map_err(|_| EmbedError::GateClosed)
    }
}

pub struct EmbeddingGate {
    handle: EmbeddingHandle,
    owner: JoinHandle<()>,
}

impl EmbeddingGate {
    /// Spawns the owner task on the current tokio runtime.
    pub fn spawn(embedder: Arc<dyn Embedder>, config: EmbeddingGateConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let handle = EmbeddingHandle {
            tx,
            model_id: Arc::from(embedder.model_id()),
            dimensions: embedder.dimensions(),
        };
        let owner = tokio::spawn(run_owner(embedder, config, rx));
        Self { handle, owner }
    }

    pub fn handle(&self) -> EmbeddingHandle {
        self.handle.clone()
    }

    /// Closes the queue and waits for accepted jobs to finish. Handles cloned
    /// out of the gate keep the queue open until they are dropped.
    pub async fn shutdown(self) {
        drop(self.handle);
        if let Err(error) = self.owner.await {
            warn!(%error, "embedding gate owner task ended abnormally");
        }
    }
}

async fn run_owner(
    embedder: Arc<dyn Embedder>,
    config: EmbeddingGateConfig,
    mut rx: mpsc::Receiver<EmbedJob>,
) {
    let max_in_flight = config.max_in_flight.max(1);
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let config = Arc::new(config);
    let mut jobs = tokio::task::JoinSet::new();

    while let Some(job) = rx.recv().await {
        let embedder = Arc::clone(&embedder);
        let permits = Arc::clone(&permits);
        let config = Arc::clone(&config);
        jobs.spawn(async move {
            let outcome = embed_job(embedder.as_ref(), &config, &permits, job.texts).await;
            // The submitter may have gone away; nothing to do then.
            let _ = job.reply.send(outcome);
        });
    }

    while jobs.join_next().await.is_some() {}
}

async fn embed_job(
    embedder: &dyn Embedder,
    config: &EmbeddingGateConfig,
    permits: &Semaphore,
    texts: Vec<String>,
) -> EmbeddingOutcome {
    let mut outcome = EmbeddingOutcome {
        vectors: Vec::with_capacity(texts.len()),
        failures: Vec::new(),
    };

    for batch in texts.chunks(config.batch_size.max(1)) {
        let result = match permits.acquire().await {
            Ok(_permit) => embed_with_retry(embedder, batch, &config.retry).await,
            Err(_) => Err(EmbedError::GateClosed),
        };

        match result {
            Ok(vectors) => outcome.vectors.extend(vectors.into_iter().map(Some)),
            Err(error) => {
                debug!(batch_len = batch.len(), %error, "embedding batch failed");
                outcome.failures.push(error.to_string());
                outcome.vectors.extend(std::iter::repeat_with(|| None).take(batch.len()));
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails any batch containing "POISON"; tracks peak concurrency.
    #[derive(Default)]
    struct RecordingEmbedder {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for RecordingEmbedder {
        fn model_id(&self) -> &str {
            "recording"
        }

        fn dimensions(&self) -> usize {
            3
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if texts.iter().any(|text| text.contains("POISON")) {
                return Err(EmbedError::Unavailable("engineered failure".to_string()));
            }
            Ok(texts
                .iter()
                .map(|text| vec![text.len() as f32, 1.0, 0.0])
                .collect())
        }
    }

    fn config(batch_size: usize, max_in_flight: usize) -> EmbeddingGateConfig {
        EmbeddingGateConfig {
            batch_size,
            queue_depth: 4,
            max_in_flight,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submitters_are_serialized() {
        let embedder = Arc::new(RecordingEmbedder::default());
        let gate = EmbeddingGate::spawn(embedder.clone(), config(1, 1));

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let handle = gate.handle();
            let first = format!("doc {worker} a");
            tasks.push(tokio::spawn(async move {
                handle.embed(vec![first, "b".to_string()]).await
            }));
        }
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(outcome.is_complete());
            assert_eq!(outcome.vectors.len(), 2);
        }

        gate.shutdown().await;
        assert_eq!(embedder.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_batches_are_marked_and_the_rest_still_embedded() {
        let gate = EmbeddingGate::spawn(Arc::new(RecordingEmbedder::default()), config(2, 1));
        let outcome = gate
            .handle()
            .embed(texts(&["one", "two", "POISON", "four", "five"]))
            .await
            .unwrap();

        assert_eq!(outcome.vectors.len(), 5);
        assert!(outcome.vectors[0].is_some());
        assert!(outcome.vectors[1].is_some());
        assert!(outcome.vectors[2].is_none());
        assert!(outcome.vectors[3].is_none());
        assert!(outcome.vectors[4].is_some());
        assert_eq!(outcome.failed_count(), 2);
        assert_eq!(outcome.failures.len(), 1);
        gate.shutdown().await;
    }

    #[tokio::test]
    async fn order_is_preserved_across_batches() {
        let gate = EmbeddingGate::spawn(Arc::new(RecordingEmbedder::default()), config(2, 1));
        let input = texts(&["a", "bb", "ccc", "dddd", "eeeee"]);
        let outcome = gate.handle().embed(input.clone()).await.unwrap();

        let lengths: Vec<f32> = outcome
            .vectors
            .iter()
            .map(|vector| vector.as_ref().unwrap()[0])
            .collect();
        assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(gate.handle().model_id(), "recording");
        gate.shutdown().await;
    }
}
