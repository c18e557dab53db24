use crate::config::HttpClientConfig;
use crate::error::EmbedError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// A pure function from text to a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored next to every vector; vectors of different models are
    /// never compared.
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
    model_id: String,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("char-trigram-{dimensions}"),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

/// Client for an OpenAI-compatible `POST {endpoint}/v1/embeddings` service.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    url: Url,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        dimensions: usize,
        api_key: Option<String>,
        http: &HttpClientConfig,
    ) -> Result<Self, EmbedError> {
        let url = Url::parse(endpoint)
            .and_then(|base| base.join("v1/embeddings"))
            .map_err(|error| EmbedError::Unavailable(format!("invalid endpoint {endpoint}: {error}")))?;

        Ok(Self {
            client: http.build_client()?,
            url,
            model: model.into(),
            dimensions,
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .json(&json!({ "model": self.model, "input": texts }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(EmbedError::Service {
                    status: status.as_u16(),
                    body,
                })
            } else {
                Err(EmbedError::Rejected {
                    status: status.as_u16(),
                    body,
                })
            };
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| EmbedError::MalformedResponse(error.to_string()))?;
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Embeds `texts`, retrying transient failures, and checks the shape of the
/// answer against the model's declared dimensions.
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match embedder.embed_batch(texts).await {
            Ok(vectors) => {
                validate_vectors(embedder.dimensions(), texts.len(), &vectors)?;
                return Ok(vectors);
            }
            Err(error) if error.is_transient() && attempt < attempts => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, %error, "embedding attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn validate_vectors(dimensions: usize, expected: usize, vectors: &[Vec<f32>]) -> Result<(), EmbedError> {
    if vectors.len() != expected {
        return Err(EmbedError::CountMismatch {
            expected,
            actual: vectors.len(),
        });
    }
    if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimensions) {
        return Err(EmbedError::Dimension {
            expected: dimensions,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Startup check: the model answers and its vectors have the declared size.
pub async fn verify_embedder(embedder: &dyn Embedder, policy: &RetryPolicy) -> Result<(), EmbedError> {
    embed_with_retry(embedder, &["Hello World".to_string()], policy)
        .await
        .map(|_| ())
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let norm_left = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let norm_right = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm_left == 0.0 || norm_right == 0.0 {
        return 0.0;
    }
    dot / (norm_left * norm_right)
}
