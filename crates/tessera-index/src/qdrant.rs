//! [`VectorStoreGateway`] over the Qdrant REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tessera_core::{TesseraError, VectorStoreConfig};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{Candidate, Point, PointPayload, VectorStoreGateway};

/// Qdrant client.
///
/// # Examples
///
/// ```
/// use tessera_core::VectorStoreConfig;
/// use tessera_index::qdrant::QdrantStore;
///
/// let store = QdrantStore::with_config(&VectorStoreConfig::default()).unwrap();
/// ```
pub struct QdrantStore {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for QdrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantStore")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct WirePoint<'a> {
    id: String,
    vector: &'a [f32],
    payload: &'a PointPayload,
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: serde_json::Value,
    score: f64,
    #[serde(default)]
    payload: Option<PointPayload>,
}

#[derive(Deserialize)]
struct CountResult {
    count: u64,
}

impl QdrantStore {
    /// Create a client from a [`VectorStoreConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] if the HTTP client cannot be built.
    pub fn with_config(config: &VectorStoreConfig) -> Result<Self, TesseraError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TesseraError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{path}", self.url));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(
        &self,
        operation: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TesseraError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TesseraError::ServiceUnavailable(format!(
                    "qdrant {operation} timed out after {}s",
                    self.timeout.as_secs()
                ))
            } else {
                TesseraError::VectorStore(format!("qdrant {operation} failed: {e}"))
            }
        })?;

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read response body".into());
        if status == StatusCode::NOT_FOUND {
            return Err(TesseraError::Config(format!(
                "qdrant {operation}: collection not found: {body}"
            )));
        }
        Err(TesseraError::VectorStore(format!(
            "qdrant {operation} returned {status}: {body}"
        )))
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<T, TesseraError> {
        let parsed: QdrantResponse<T> = response.json().await.map_err(|e| {
            TesseraError::VectorStore(format!("failed to parse qdrant {operation} response: {e}"))
        })?;
        Ok(parsed.result)
    }
}

#[async_trait]
impl VectorStoreGateway for QdrantStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        dimensions: usize,
    ) -> Result<(), TesseraError> {
        let path = format!("/collections/{collection}");
        match self
            .send("get collection", self.request(reqwest::Method::GET, &path))
            .await
        {
            Ok(response) => {
                let info: CollectionInfo = Self::parse("get collection", response).await?;
                let stored = info.config.params.vectors.size;
                if stored != dimensions {
                    return Err(TesseraError::DimensionMismatch {
                        expected: stored,
                        actual: dimensions,
                    });
                }
                Ok(())
            }
            Err(TesseraError::Config(_)) => {
                debug!(collection, dimensions, "creating qdrant collection");
                let body = json!({ "vectors": { "size": dimensions, "distance": "Cosine" } });
                self.send(
                    "create collection",
                    self.request(reqwest::Method::PUT, &path).json(&body),
                )
                .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<(), TesseraError> {
        if points.is_empty() {
            return Ok(());
        }
        let wire: Vec<WirePoint<'_>> = points
            .iter()
            .map(|p| WirePoint {
                id: p.id.to_string(),
                vector: &p.vector,
                payload: &p.payload,
            })
            .collect();
        let path = format!("/collections/{collection}/points?wait=true");
        self.send(
            "upsert",
            self.request(reqwest::Method::PUT, &path)
                .json(&json!({ "points": wire })),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<Candidate>, TesseraError> {
        let path = format!("/collections/{collection}/points/search");
        let body = json!({
            "vector": vector,
            "limit": limit,
            "score_threshold": min_score,
            "with_payload": true,
        });
        let response = self
            .send("search", self.request(reqwest::Method::POST, &path).json(&body))
            .await?;
        let hits: Vec<ScoredPoint> = Self::parse("search", response).await?;

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            let id = match hit.id.as_str().map(Uuid::parse_str) {
                Some(Ok(id)) => id,
                _ => {
                    warn!(id = %hit.id, "skipping qdrant point with non-uuid id");
                    continue;
                }
            };
            candidates.push(Candidate {
                id,
                score: hit.score,
                payload: hit.payload.unwrap_or_default(),
            });
        }
        Ok(candidates)
    }

    async fn count(&self, collection: &str) -> Result<u64, TesseraError> {
        let path = format!("/collections/{collection}/points/count");
        let response = self
            .send(
                "count",
                self.request(reqwest::Method::POST, &path)
                    .json(&json!({ "exact": true })),
            )
            .await?;
        let result: CountResult = Self::parse("count", response).await?;
        Ok(result.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::point_id;

    #[test]
    fn wire_point_serializes_uuid_and_payload() {
        let payload = PointPayload {
            file_path: "src/lib.rs".into(),
            content_hash: "abc".into(),
            ..PointPayload::default()
        };
        let vector = vec![0.5f32, 0.25];
        let wire = WirePoint {
            id: point_id("src/lib.rs").to_string(),
            vector: &vector,
            payload: &payload,
        };
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["id"], point_id("src/lib.rs").to_string());
        assert_eq!(json["payload"]["file_path"], "src/lib.rs");
        assert_eq!(json["vector"][1], 0.25);
    }

    #[test]
    fn search_response_parses() {
        let id = point_id("src/auth.rs");
        let body = format!(
            r#"{{"result": [{{"id": "{id}", "score": 0.82, "payload": {{"file_path": "src/auth.rs", "preview": "fn login"}}}}], "status": "ok", "time": 0.001}}"#
        );
        let parsed: QdrantResponse<Vec<ScoredPoint>> = serde_json::from_str(&body).unwrap();
        let hit = &parsed.result[0];
        assert_eq!(hit.id.as_str().unwrap(), id.to_string());
        assert_eq!(hit.payload.as_ref().unwrap().preview, "fn login");
    }

    #[test]
    fn collection_info_parses_vector_size() {
        let body = r#"{"result": {"status": "green", "config": {"params": {"vectors": {"size": 768, "distance": "Cosine"}}}}}"#;
        let parsed: QdrantResponse<CollectionInfo> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.result.config.params.vectors.size, 768);
    }

    #[test]
    fn count_response_parses() {
        let parsed: QdrantResponse<CountResult> =
            serde_json::from_str(r#"{"result": {"count": 42}}"#).unwrap();
        assert_eq!(parsed.result.count, 42);
    }
}
