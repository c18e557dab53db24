use crate::config::HttpClientConfig;
use crate::models::{IndexedDocument, LexicalHit, TermIndexEntry};
use crate::traits::TermIndex;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use url::Url;

const BACKEND: &str = "opensearch";

/// Term index backed by an OpenSearch index, one `_doc` per document id.
pub struct OpenSearchTermIndex {
    client: Client,
    endpoint: Url,
    index_name: String,
}

impl OpenSearchTermIndex {
    pub fn new(
        endpoint: &str,
        index_name: impl Into<String>,
        http: &HttpClientConfig,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            client: http.build_client()?,
            endpoint: Url::parse(endpoint)?,
            index_name: index_name.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, SearchError> {
        Ok(self.endpoint.join(&format!("{}/{path}", self.index_name))?)
    }

    fn index_url(&self) -> Result<Url, SearchError> {
        Ok(self.endpoint.join(&self.index_name)?)
    }
}

fn backend_error(status: StatusCode, body: String) -> SearchError {
    SearchError::BackendResponse {
        backend: BACKEND.to_string(),
        details: format!("{status}: {body}"),
    }
}

fn str_field(source: &Value, field: &str) -> String {
    source
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl TermIndex for OpenSearchTermIndex {
    async fn ensure_ready(&self) -> Result<(), SearchError> {
        let response = self.client.head(self.index_url()?).send().await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status(), String::new()));
        }

        let response = self
            .client
            .put(self.index_url()?)
            .json(&json!({
                "settings": {
                    "number_of_shards": 1,
                    "number_of_replicas": 0
                },
                "mappings": {
                    "properties": {
                        "text": {"type": "text", "analyzer": "english"},
                        "title": {"type": "text", "analyzer": "english"},
                        "document_id": {"type": "keyword"},
                        "source_path": {"type": "keyword"},
                        "fingerprint": {"type": "keyword"},
                        "embeddings_stale": {"type": "boolean"},
                        "modified_at": {"type": "date"},
                        "indexed_at": {"type": "date"}
                    }
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(SearchError::Request(format!(
                "open-search index setup failed with {status}: {}",
                response.text().await.unwrap_or_default()
            )));
        }

        Ok(())
    }

    async fn upsert(&self, entry: &TermIndexEntry) -> Result<(), SearchError> {
        let response = self
            .client
            .put(self.url(&format!("_doc/{}", entry.document_id))?)
            .query(&[("refresh", "true")])
            .json(entry)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(backend_error(status, response.text().await.unwrap_or_default()));
        }
        Ok(())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IndexedDocument>, SearchError> {
        let body = json!({
            "size": 1,
            "_source": ["document_id", "source_path", "fingerprint", "embeddings_stale"],
            "query": {"term": {"fingerprint": fingerprint}}
        });

        let response = self.client.post(self.url("_search")?).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(backend_error(status, response.text().await.unwrap_or_default()));
        }

        let response_json: Value = response.json().await?;
        Ok(response_json
            .pointer("/hits/hits/0/_source")
            .map(|source| IndexedDocument {
                document_id: str_field(source, "document_id"),
                source_path: str_field(source, "source_path"),
                fingerprint: str_field(source, "fingerprint"),
                embeddings_stale: source
                    .get("embeddings_stale")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>, SearchError> {
        let body = json!({
            "size": limit,
            "_source": ["document_id", "source_path", "title", "text"],
            "query": {
                "multi_match": {
                    "query": query,
                    "fields": ["title^2", "text"]
                }
            },
            "highlight": {
                "fields": {
                    "text": {"fragment_size": 200, "number_of_fragments": 3}
                }
            }
        });

        let response = self.client.post(self.url("_search")?).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(backend_error(status, response.text().await.unwrap_or_default()));
        }

        let response_json: Value = response.json().await?;
        let hits = response_json
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::with_capacity(hits.len());
        for raw in hits {
            let source = raw.get("_source").cloned().unwrap_or(Value::Null);
            let snippet = raw
                .pointer("/highlight/text")
                .and_then(Value::as_array)
                .map(|fragments| {
                    fragments
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|fragment| fragment.replace("<em>", "").replace("</em>", ""))
                        .collect::<Vec<_>>()
                        .join(" … ")
                })
                .filter(|snippet| !snippet.is_empty());
            let text = source.get("text").and_then(Value::as_str).map(str::to_string);

            result.push(LexicalHit {
                document_id: str_field(&source, "document_id"),
                source_path: str_field(&source, "source_path"),
                title: str_field(&source, "title"),
                score: raw.get("_score").and_then(Value::as_f64).unwrap_or(0.0),
                snippet,
                text,
            });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_joined_under_the_index() -> Result<(), SearchError> {
        let index = OpenSearchTermIndex::new(
            "http://localhost:9200/",
            "documents",
            &HttpClientConfig::default(),
        )?;
        assert_eq!(index.index_url()?.as_str(), "http://localhost:9200/documents");
        assert_eq!(
            index.url("_doc/abc")?.as_str(),
            "http://localhost:9200/documents/_doc/abc"
        );
        Ok(())
    }

    #[test]
    fn malformed_endpoint_is_rejected() {
        let result = OpenSearchTermIndex::new("not a url", "documents", &HttpClientConfig::default());
        assert!(matches!(result, Err(SearchError::Url(_))));
    }
}
