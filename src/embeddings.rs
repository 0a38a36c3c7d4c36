use crate::config::AppSettings;
use crate::models::{EmbeddingRequest, EmbeddingResponse};
use crate::openai::endpoint_url;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tracing::{debug, error, instrument};
use url::Url;

pub const EMBEDDINGS_PATH: &str = "embeddings";

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {body}")]
    Api { status: StatusCode, body: String },
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Failed to deserialize response: {0}")]
    Deserialization(reqwest::Error),
    #[error("Expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

/// Maps texts to vectors. One output vector per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Client for an OpenAI-compatible `/embeddings` endpoint, such as a llama.cpp
/// server running the provisioned GGUF model.
#[derive(Debug)]
pub struct EmbeddingApiClient {
    client: Client,
    embeddings_url: Url,
    model: String,
    api_key: Option<String>,
}

impl EmbeddingApiClient {
    pub fn new(settings: &AppSettings) -> Result<Self, EmbeddingError> {
        let embeddings_url = endpoint_url(&settings.embedding_url, EMBEDDINGS_PATH)?;
        Ok(Self {
            client: Client::builder().build()?,
            embeddings_url,
            model: settings.embedding_model.clone(),
            api_key: settings.embedding_api_key.clone(),
        })
    }
}

#[async_trait]
impl Embedder for EmbeddingApiClient {
    #[instrument(skip(self, inputs), fields(count = inputs.len()))]
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let payload = EmbeddingRequest {
            model: self.model.clone(),
            input: inputs.to_vec(),
        };

        let mut request = self
            .client
            .post(self.embeddings_url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }

        debug!("Requesting {} embeddings from {}", inputs.len(), self.embeddings_url);
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
            error!("Embedding API Error: {} - {}", status, body);
            return Err(EmbeddingError::Api { status, body });
        }

        let mut parsed = response
            .json::<EmbeddingResponse>()
            .await
            .map_err(EmbeddingError::Deserialization)?;

        if parsed.data.len() != inputs.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: inputs.len(),
                actual: parsed.data.len(),
            });
        }

        // Servers are allowed to return the data out of order
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Cosine similarity; mismatched lengths and zero-norm vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
