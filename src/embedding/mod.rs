//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and its implementations:
//! - **[`DisabledEmbedder`]**: returns errors; used when embeddings are not configured.
//! - **[`HttpEmbedder`]**: calls a remote embedding service, one of
//!   - `tei`: HuggingFace text-embeddings-inference (`POST {url}/embed`),
//!   - `openai`: an OpenAI-compatible `POST {url}/embeddings`,
//!   - `ollama`: a local Ollama instance (`POST {url}/api/embed`).
//!
//! Also provides vector utilities used by the index:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`]: decode those bytes back into a `Vec<f32>`
//!
//! # Provider Selection
//!
//! ```rust
//! # use polarion_copilot::config::EmbeddingConfig;
//! # use polarion_copilot::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

/// Turns texts into vectors.
///
/// Implementations must return exactly one vector per input text, in input
/// order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded alongside each index.
    fn model_name(&self) -> &str;

    /// Vector dimensionality, if known before the first call.
    fn dims(&self) -> Option<usize>;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding response".to_string()))
}

// ============ Disabled ============

/// Always fails. Used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> Option<usize> {
        None
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ HTTP providers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Tei,
    OpenAi,
    Ollama,
}

impl Wire {
    fn label(&self) -> &'static str {
        match self {
            Wire::Tei => "TEI",
            Wire::OpenAi => "OpenAI",
            Wire::Ollama => "Ollama",
        }
    }
}

/// Embedding provider backed by an HTTP service.
pub struct HttpEmbedder {
    wire: Wire,
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: Option<usize>,
    api_key: Option<String>,
    max_retries: u32,
}

impl HttpEmbedder {
    /// # Errors
    ///
    /// Fails for an unknown provider, a missing model where one is
    /// required, or a missing OpenAI API key.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let wire = match config.provider.as_str() {
            "tei" => Wire::Tei,
            "openai" => Wire::OpenAi,
            "ollama" => Wire::Ollama,
            other => bail!("Unknown embedding provider: {}", other),
        };

        let model = match (wire, &config.model) {
            (_, Some(model)) => model.clone(),
            (Wire::Tei, None) => "tei".to_string(),
            (_, None) => bail!("embedding.model required for {} provider", wire.label()),
        };

        let base = match (wire, &config.url) {
            (_, Some(url)) => url.trim_end_matches('/').to_string(),
            (Wire::Tei, None) => bail!("embedding.url required for TEI provider"),
            (Wire::OpenAi, None) => "https://api.openai.com/v1".to_string(),
            (Wire::Ollama, None) => "http://localhost:11434".to_string(),
        };
        let endpoint = match wire {
            Wire::Tei => format!("{}/embed", base),
            Wire::OpenAi => format!("{}/embeddings", base),
            Wire::Ollama => format!("{}/api/embed", base),
        };

        let key_var = config
            .api_key_env
            .clone()
            .or_else(|| (wire == Wire::OpenAi).then(|| "OPENAI_API_KEY".to_string()));
        let api_key = key_var.as_deref().and_then(|var| std::env::var(var).ok());
        if wire == Wire::OpenAi && api_key.is_none() {
            bail!(
                "{} environment variable not set",
                key_var.as_deref().unwrap_or("OPENAI_API_KEY")
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            wire,
            client,
            endpoint,
            model,
            dims: config.dims,
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn body(&self, texts: &[String]) -> Value {
        match self.wire {
            Wire::Tei => serde_json::json!({ "inputs": texts, "truncate": true }),
            Wire::OpenAi | Wire::Ollama => serde_json::json!({
                "model": self.model,
                "input": texts,
            }),
        }
    }

    fn parse(&self, json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        match self.wire {
            Wire::Tei => parse_tei_response(json),
            Wire::OpenAi => parse_openai_response(json),
            Wire::Ollama => parse_ollama_response(json),
        }
    }

    async fn call(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = self.body(texts);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
                        return self.parse(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let message = format!("{} API error {}: {}", self.wire.label(), status, body_text);

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(message);
                        continue;
                    }
                    return Err(EmbeddingError::Rejected(message));
                }
                Err(e) => {
                    last_err = Some(format!(
                        "{} connection error ({}): {}",
                        self.wire.label(),
                        self.endpoint,
                        e
                    ));
                }
            }
        }

        Err(EmbeddingError::Unavailable(last_err.unwrap_or_else(|| {
            "embedding failed after retries".to_string()
        })))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.call(texts).await?;
        check_shape(texts.len(), self.dims, &vectors)?;
        Ok(vectors)
    }
}

/// Verify one vector per input and, when known, the dimensionality.
pub fn check_shape(
    expected_len: usize,
    dims: Option<usize>,
    vectors: &[Vec<f32>],
) -> Result<(), EmbeddingError> {
    if vectors.len() != expected_len {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {} vectors, got {}",
            expected_len,
            vectors.len()
        )));
    }
    if let Some(dims) = dims {
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} dimensions, got {}",
                dims,
                bad.len()
            )));
        }
    }
    Ok(())
}

fn parse_vector(value: &Value, what: &str) -> Result<Vec<f32>, EmbeddingError> {
    value
        .as_array()
        .ok_or_else(|| EmbeddingError::InvalidResponse(format!("{what}: embedding is not an array")))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::InvalidResponse(format!("{what}: non-numeric value")))
        })
        .collect()
}

/// TEI returns a bare array of vectors.
fn parse_tei_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    json.as_array()
        .ok_or_else(|| EmbeddingError::InvalidResponse("TEI: expected an array".to_string()))?
        .iter()
        .map(|v| parse_vector(v, "TEI"))
        .collect()
}

/// OpenAI returns `data[].embedding` with an `index` per entry.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json.get("data").and_then(Value::as_array).ok_or_else(|| {
        EmbeddingError::InvalidResponse("OpenAI: missing data array".to_string())
    })?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item.get("embedding").ok_or_else(|| {
            EmbeddingError::InvalidResponse("OpenAI: missing embedding".to_string())
        })?;
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }

    // Sort by index to ensure order matches input
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    json.get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            EmbeddingError::InvalidResponse("Ollama: missing embeddings array".to_string())
        })?
        .iter()
        .map(|v| parse_vector(v, "Ollama"))
        .collect()
}

/// Create the [`Embedder`] selected by `embedding.provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"tei"`, `"openai"`, `"ollama"` | [`HttpEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "tei" | "openai" | "ollama" => Ok(Box::new(HttpEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as little-endian f32 bytes.
///
/// ```rust
/// use polarion_copilot::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode bytes produced by [`vec_to_blob`]. Trailing partial values are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
