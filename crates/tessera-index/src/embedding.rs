//! Embedding provider gateway and its HTTP client.
//!
//! [`HttpEmbeddingClient`] speaks two wire formats: the batch-style
//! `POST {base}/embeddings` used by Voyage and OpenAI, and Ollama's
//! single-prompt `POST {base}/api/embeddings`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_core::{EmbeddingConfig, TesseraError};
use tracing::debug;

/// Turns text into fixed-width vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a document.
    ///
    /// # Errors
    ///
    /// Returns a transient error ([`TesseraError::Embedding`] or
    /// [`TesseraError::Timeout`]) when the call fails, or
    /// [`TesseraError::DimensionMismatch`] when the vector has the wrong width.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TesseraError>;

    /// Embed a search query. Defaults to [`embed`](Self::embed).
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, TesseraError> {
        self.embed(text).await
    }

    /// Width of every vector this provider returns.
    fn dimensions(&self) -> usize;

    /// Model name.
    fn model(&self) -> &str;
}

/// Wire format spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Voyage AI (`input_type` aware).
    Voyage,
    /// OpenAI-compatible `/embeddings`.
    OpenAi,
    /// Local Ollama server.
    Ollama,
}

impl ProviderKind {
    /// Parse a provider name from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] for an unknown provider.
    pub fn parse(name: &str) -> Result<Self, TesseraError> {
        match name.to_lowercase().as_str() {
            "voyage" => Ok(Self::Voyage),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(TesseraError::Config(format!(
                "unknown embedding provider '{other}' (expected voyage, openai, or ollama)"
            ))),
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::Voyage => "https://api.voyageai.com/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434",
        }
    }

    fn api_key_env(self) -> Option<&'static str> {
        match self {
            Self::Voyage => Some("VOYAGE_API_KEY"),
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Ollama => None,
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_type: Option<&'a str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDataItem>,
}

#[derive(Deserialize)]
struct EmbedDataItem {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embedding: Vec<f32>,
}

/// [`EmbeddingProvider`] over HTTP.
///
/// # Examples
///
/// ```
/// use tessera_core::EmbeddingConfig;
/// use tessera_index::embedding::{EmbeddingProvider, HttpEmbeddingClient};
///
/// let client = HttpEmbeddingClient::with_config(&EmbeddingConfig::default()).unwrap();
/// assert_eq!(client.model(), "nomic-embed-text");
/// assert_eq!(client.dimensions(), 768);
/// ```
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    kind: ProviderKind,
    api_key: Option<String>,
    base_url: String,
    model: String,
    dimensions: usize,
    max_input_chars: usize,
    timeout: Duration,
}

impl std::fmt::Debug for HttpEmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingClient")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl HttpEmbeddingClient {
    /// Create a client from an [`EmbeddingConfig`].
    ///
    /// Hosted providers fall back to `VOYAGE_API_KEY` / `OPENAI_API_KEY`
    /// when no key is configured.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Config`] for an unknown provider or a missing
    /// API key.
    pub fn with_config(config: &EmbeddingConfig) -> Result<Self, TesseraError> {
        let kind = ProviderKind::parse(&config.provider)?;
        let api_key = match kind.api_key_env() {
            Some(var) => Some(
                config
                    .api_key
                    .clone()
                    .or_else(|| std::env::var(var).ok())
                    .ok_or_else(|| {
                        TesseraError::Config(format!(
                            "embedding API key not found: set embedding.api_key in .tessera.toml or {var} env var"
                        ))
                    })?,
            ),
            None => config.api_key.clone(),
        };

        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TesseraError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            kind,
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| kind.default_base_url().to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            max_input_chars: config.max_input_chars,
            timeout,
        })
    }

    /// Wire format in use.
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn request(&self, text: &str, input_type: &str) -> Result<Vec<f32>, TesseraError> {
        let text = truncate_chars(text, self.max_input_chars);
        let builder = match self.kind {
            ProviderKind::Ollama => self
                .client
                .post(format!("{}/api/embeddings", self.base_url))
                .json(&OllamaRequest {
                    model: &self.model,
                    prompt: text,
                }),
            ProviderKind::Voyage | ProviderKind::OpenAi => self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .json(&EmbedRequest {
                    model: &self.model,
                    input: vec![text],
                    input_type: (self.kind == ProviderKind::Voyage).then_some(input_type),
                }),
        };
        let builder = match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".into());
            return Err(TesseraError::Embedding(format!(
                "embedding API returned {status}: {body}"
            )));
        }

        let embedding = match self.kind {
            ProviderKind::Ollama => {
                let parsed: OllamaResponse = response.json().await.map_err(|e| {
                    TesseraError::Embedding(format!("failed to parse response: {e}"))
                })?;
                parsed.embedding
            }
            ProviderKind::Voyage | ProviderKind::OpenAi => {
                let parsed: EmbedResponse = response.json().await.map_err(|e| {
                    TesseraError::Embedding(format!("failed to parse response: {e}"))
                })?;
                parsed
                    .data
                    .into_iter()
                    .next()
                    .map(|item| item.embedding)
                    .ok_or_else(|| {
                        TesseraError::Embedding("empty response from embedding API".into())
                    })?
            }
        };

        if embedding.len() != self.dimensions {
            return Err(TesseraError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        debug!(model = %self.model, chars = text.len(), "embedded text");
        Ok(embedding)
    }

    fn transport_error(&self, e: reqwest::Error) -> TesseraError {
        if e.is_timeout() {
            TesseraError::timeout("embedding request", self.timeout.as_secs())
        } else {
            TesseraError::Embedding(format!("HTTP request failed: {e}"))
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TesseraError> {
        self.request(text, "document").await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, TesseraError> {
        self.request(text, "query").await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Longest prefix of `text` with at most `max_chars` characters.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
