//! Retrieval-augmented answers: fused hits become a bounded prompt for an
//! external text generator.

use crate::config::{HttpClientConfig, RagConfig};
use crate::error::GenerationError;
use crate::models::{RetrievalResult, SearchHit, SearchQuery};
use crate::retrieval::HybridRetriever;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// The query followed by the hit snippets in rank order, cut to `max_words`.
pub fn assemble_context(query: &str, hits: &[SearchHit], max_words: usize) -> String {
    std::iter::once(query)
        .chain(hits.iter().map(|hit| hit.snippet.as_str()))
        .flat_map(str::split_whitespace)
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Client for an OpenAI-compatible `POST {endpoint}/v1/chat/completions`.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: Client,
    url: Url,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpGenerator {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        rag: &RagConfig,
        http: &HttpClientConfig,
    ) -> Result<Self, GenerationError> {
        let url = Url::parse(endpoint)
            .and_then(|base| base.join("v1/chat/completions"))
            .map_err(|error| GenerationError::InvalidEndpoint(format!("{endpoint}: {error}")))?;

        // Temperatures outside 0.1..=0.9 fall back to 0.6.
        let tenths = match rag.temperature_tenths {
            tenths @ 1..=9 => tenths,
            _ => 6,
        };

        Ok(Self {
            client: http.build_client()?,
            url,
            model: model.into(),
            api_key,
            system_prompt: rag.system_prompt.clone(),
            max_output_tokens: rag.max_output_tokens,
            temperature: f32::from(tenths) / 10.0,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut request = self.client.post(self.url.clone()).json(&json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": self.system_prompt},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.max_output_tokens,
            "temperature": self.temperature,
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Service {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| GenerationError::MalformedResponse(error.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| GenerationError::MalformedResponse("no choices".to_string()))
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub retrieval: RetrievalResult,
    pub answer: Option<String>,
    /// Why no answer was produced although hits were found.
    pub generation_error: Option<String>,
}

pub struct RagPipeline {
    retriever: HybridRetriever,
    generator: Arc<dyn Generator>,
    config: RagConfig,
}

impl RagPipeline {
    pub fn new(retriever: HybridRetriever, generator: Arc<dyn Generator>, config: RagConfig) -> Self {
        Self {
            retriever,
            generator,
            config,
        }
    }

    /// Retrieves the top `top_k` hits and, when there are any, asks the
    /// generator for an answer. A generator failure still returns the hits.
    pub async fn answer(&self, query: &str, top_k: usize) -> Result<RagAnswer, SearchError> {
        let retrieval = self.retriever.search(&SearchQuery::new(query, top_k)).await?;
        if retrieval.hits.is_empty() {
            info!(query, "no hits, skipping generation");
            return Ok(RagAnswer {
                retrieval,
                answer: None,
                generation_error: None,
            });
        }

        let prompt = assemble_context(query, &retrieval.hits, self.config.max_context_words);
        match self.generator.generate(&prompt).await {
            Ok(answer) => Ok(RagAnswer {
                retrieval,
                answer: Some(answer),
                generation_error: None,
            }),
            Err(error) => {
                warn!(query, %error, "generation failed, returning hits only");
                Ok(RagAnswer {
                    retrieval,
                    answer: None,
                    generation_error: Some(error.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::TermIndexEntry;
    use crate::stores::{MemoryTermIndex, MemoryVectorStore};
    use crate::traits::TermIndex;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Generator for Recorder {
        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt.to_string());
            }
            if self.fail {
                return Err(GenerationError::MalformedResponse("offline".to_string()));
            }
            Ok("summary".to_string())
        }
    }

    fn hit(snippet: &str) -> SearchHit {
        SearchHit {
            document_id: "d".to_string(),
            chunk_id: None,
            source_path: "/d.txt".to_string(),
            title: None,
            lexical_score: 1.0,
            vector_score: 0.0,
            fused_score: 0.5,
            raw_lexical_score: Some(1.0),
            raw_vector_score: None,
            snippet: snippet.to_string(),
            modes: Vec::new(),
        }
    }

    async fn pipeline(generator: Arc<Recorder>) -> Result<RagPipeline, SearchError> {
        let terms = Arc::new(MemoryTermIndex::new());
        terms
            .upsert(&TermIndexEntry {
                document_id: "pump".to_string(),
                source_path: "/docs/pump.txt".to_string(),
                title: "Pump".to_string(),
                modified_at: Utc::now(),
                fingerprint: "fp".to_string(),
                text: "pump seals wear out after two years".to_string(),
                embeddings_stale: false,
                indexed_at: Utc::now(),
            })
            .await?;
        let retriever = HybridRetriever::new(
            terms,
            Arc::new(MemoryVectorStore::new()),
            Arc::new(CharacterNgramEmbedder::new(16)),
        );
        Ok(RagPipeline::new(retriever, generator, RagConfig::default()))
    }

    #[test]
    fn context_starts_with_the_query_and_is_bounded() {
        let hits = vec![hit("first snippet words"), hit("second snippet")];
        assert_eq!(
            assemble_context("why  pumps?", &hits, 100),
            "why pumps? first snippet words second snippet"
        );
        assert_eq!(assemble_context("why pumps?", &hits, 3), "why pumps? first");
    }

    #[tokio::test]
    async fn answer_uses_retrieved_snippets() -> Result<(), SearchError> {
        let generator = Arc::new(Recorder::default());
        let rag = pipeline(generator.clone()).await?;

        let answer = rag.answer("when do pump seals wear?", 3).await?;
        assert_eq!(answer.answer.as_deref(), Some("summary"));
        let prompts = generator.prompts.lock().map(|p| p.clone()).unwrap_or_default();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with("when do pump seals wear?"));
        assert!(prompts[0].contains("two years"));
        Ok(())
    }

    #[tokio::test]
    async fn no_hits_skips_generation() -> Result<(), SearchError> {
        let generator = Arc::new(Recorder::default());
        let rag = pipeline(generator.clone()).await?;

        let answer = rag.answer("zebra", 3).await?;
        assert!(answer.answer.is_none());
        assert!(generator.prompts.lock().map(|p| p.is_empty()).unwrap_or(false));
        Ok(())
    }

    #[tokio::test]
    async fn generator_failure_keeps_hits() -> Result<(), SearchError> {
        let generator = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let rag = pipeline(generator).await?;

        let answer = rag.answer("pump seals", 3).await?;
        assert!(answer.answer.is_none());
        assert!(answer.generation_error.is_some());
        assert_eq!(answer.retrieval.hits.len(), 1);
        Ok(())
    }

    #[test]
    fn out_of_range_temperature_falls_back() -> Result<(), GenerationError> {
        let rag = RagConfig {
            temperature_tenths: 0,
            ..RagConfig::default()
        };
        let generator = HttpGenerator::new(
            "http://localhost:8000",
            "local",
            None,
            &rag,
            &HttpClientConfig::default(),
        )?;
        assert!((generator.temperature - 0.6).abs() < f32::EPSILON);
        assert_eq!(generator.url.as_str(), "http://localhost:8000/v1/chat/completions");
        Ok(())
    }
}
