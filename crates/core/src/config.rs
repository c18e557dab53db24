//! Tunables for the HTTP collaborators, the embedding gate, retrieval and
//! the generation step. Every struct has a `Default` matching the stock
//! deployment; the CLI overrides individual fields from flags.

use crate::embeddings::RetryPolicy;
use crate::error::SearchError;
use reqwest::Client;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// When false, invalid or self-signed certificates are accepted.
    pub verify_tls: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            verify_tls: false,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<Client, reqwest::Error> {
        Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .danger_accept_invalid_certs(!self.verify_tls)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingGateConfig {
    /// Texts per model call.
    pub batch_size: usize,
    /// Pending jobs before submitters wait.
    pub queue_depth: usize,
    /// Model calls allowed to run at once; 1 serializes all embedding work.
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingGateConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            queue_depth: 64,
            max_in_flight: 1,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub lexical: f64,
    pub vector: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            lexical: 0.5,
            vector: 0.5,
        }
    }
}

impl FusionWeights {
    pub fn validate(&self) -> Result<(), SearchError> {
        let finite = self.lexical.is_finite() && self.vector.is_finite();
        if !finite || self.lexical < 0.0 || self.vector < 0.0 {
            return Err(SearchError::Request(format!(
                "fusion weights must be finite and non-negative, got lexical={} vector={}",
                self.lexical, self.vector
            )));
        }
        if self.lexical + self.vector == 0.0 {
            return Err(SearchError::Request(
                "at least one fusion weight must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    pub weights: FusionWeights,
    /// Minimum lexical candidates fetched regardless of `top_k`.
    pub candidate_k_lexical: usize,
    /// Minimum vector neighbors fetched; several may belong to one document.
    pub candidate_k_vector: usize,
    /// Words of lexical text kept around matched terms in a snippet.
    pub snippet_words: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            candidate_k_lexical: 20,
            candidate_k_vector: 50,
            snippet_words: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RagConfig {
    /// Prompt size limit in words, ten below the generator's input window.
    pub max_context_words: usize,
    pub system_prompt: String,
    pub max_output_tokens: u32,
    pub temperature_tenths: u8,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            max_context_words: 2048 - 10,
            system_prompt:
                "Provide a concise, objective summary of the input text focusing on main points."
                    .to_string(),
            max_output_tokens: 512,
            temperature_tenths: 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_are_equal() {
        let weights = FusionWeights::default();
        assert_eq!(weights.lexical, weights.vector);
        assert!(weights.validate().is_ok());
    }

    #[test]
    fn degenerate_weights_are_rejected() {
        let zero = FusionWeights {
            lexical: 0.0,
            vector: 0.0,
        };
        let negative = FusionWeights {
            lexical: -0.1,
            vector: 1.0,
        };
        assert!(zero.validate().is_err());
        assert!(negative.validate().is_err());
    }

    #[test]
    fn client_builds_with_tls_verification_off() {
        assert!(HttpClientConfig::default().build_client().is_ok());
    }
}
