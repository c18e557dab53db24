use crate::config::HttpClientConfig;
use crate::models::{EmbeddingRecord, IndexedDocument, VectorHit};
use crate::traits::VectorStore;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

const BACKEND: &str = "qdrant";

/// Vector store backed by a Qdrant collection with cosine distance.
pub struct QdrantVectorStore {
    endpoint: Url,
    collection: String,
    client: Client,
}

/// Qdrant only accepts integers or UUIDs as point ids.
pub fn point_id(chunk_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes())
}

impl QdrantVectorStore {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        http: &HttpClientConfig,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            collection: collection.into(),
            client: http.build_client()?,
        })
    }

    fn url(&self, path: &str) -> Result<Url, SearchError> {
        let suffix = if path.is_empty() {
            format!("collections/{}", self.collection)
        } else {
            format!("collections/{}/{path}", self.collection)
        };
        Ok(self.endpoint.join(&suffix)?)
    }
}

async fn checked(response: Response) -> Result<Value, SearchError> {
    let status = response.status();
    if !status.is_success() {
        return Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("{status}: {}", response.text().await.unwrap_or_default()),
        });
    }
    Ok(response.json().await?)
}

fn str_payload(point: &Value, field: &str) -> String {
    point
        .pointer(&format!("/payload/{field}"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_ready(&self, dimensions: usize) -> Result<(), SearchError> {
        let response = self.client.get(self.url("")?).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            let response = self
                .client
                .put(self.url("")?)
                .json(&json!({
                    "vectors": {"size": dimensions, "distance": "Cosine"}
                }))
                .send()
                .await?;
            checked(response).await?;

            for field in ["document_id", "fingerprint", "model"] {
                let response = self
                    .client
                    .put(self.url("index")?)
                    .query(&[("wait", "true")])
                    .json(&json!({"field_name": field, "field_schema": "keyword"}))
                    .send()
                    .await?;
                checked(response).await?;
            }
            return Ok(());
        }

        let info = checked(response).await?;
        let existing = info
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .ok_or_else(|| SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: "collection info has no vector size".to_string(),
            })?;

        if existing as usize != dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: existing as usize,
                actual: dimensions,
            });
        }
        Ok(())
    }

    async fn upsert(&self, records: &[EmbeddingRecord]) -> Result<(), SearchError> {
        if records.is_empty() {
            return Ok(());
        }

        let points: Vec<Value> = records
            .iter()
            .map(|record| {
                json!({
                    "id": point_id(&record.chunk_id),
                    "vector": record.vector,
                    "payload": {
                        "chunk_id": record.chunk_id,
                        "document_id": record.document_id,
                        "chunk_index": record.chunk_index,
                        "fingerprint": record.fingerprint,
                        "model": record.model,
                        "source_path": record.source_path,
                        "snippet": record.snippet,
                    },
                })
            })
            .collect();

        let response = self
            .client
            .put(self.url("points")?)
            .query(&[("wait", "true")])
            .json(&json!({ "points": points }))
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn delete_chunks_from(&self, document_id: &str, from_index: u32) -> Result<(), SearchError> {
        let response = self
            .client
            .post(self.url("points/delete")?)
            .query(&[("wait", "true")])
            .json(&json!({
                "filter": {
                    "must": [
                        {"key": "document_id", "match": {"value": document_id}},
                        {"key": "chunk_index", "range": {"gte": from_index}}
                    ]
                }
            }))
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IndexedDocument>, SearchError> {
        let response = self
            .client
            .post(self.url("points/scroll")?)
            .json(&json!({
                "filter": {
                    "must": [{"key": "fingerprint", "match": {"value": fingerprint}}]
                },
                "limit": 1,
                "with_payload": true,
                "with_vector": false,
            }))
            .send()
            .await?;

        let parsed = checked(response).await?;
        Ok(parsed.pointer("/result/points/0").map(|point| IndexedDocument {
            document_id: str_payload(point, "document_id"),
            source_path: str_payload(point, "source_path"),
            fingerprint: str_payload(point, "fingerprint"),
            embeddings_stale: false,
        }))
    }

    async fn search(
        &self,
        vector: &[f32],
        model: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>, SearchError> {
        let response = self
            .client
            .post(self.url("points/search")?)
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "with_payload": true,
                "filter": {
                    "must": [{"key": "model", "match": {"value": model}}]
                },
            }))
            .send()
            .await?;

        let parsed = checked(response).await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .iter()
            .map(|hit| VectorHit {
                chunk_id: str_payload(hit, "chunk_id"),
                document_id: str_payload(hit, "document_id"),
                chunk_index: hit
                    .pointer("/payload/chunk_index")
                    .and_then(Value::as_u64)
                    .and_then(|index| u32::try_from(index).ok())
                    .unwrap_or_default(),
                source_path: str_payload(hit, "source_path"),
                score: hit.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                snippet: str_payload(hit, "snippet"),
            })
            .collect())
    }
}
