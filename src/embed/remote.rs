//! Remote embedding producers speaking the OpenAI and Ollama HTTP shapes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EmbedError, Embedder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFlavor {
    /// `POST {url}` with `{"model", "input": [text]}`,
    /// response `{"data": [{"embedding": [...]}]}`.
    OpenAi,
    /// `POST {url}` with `{"model", "prompt": text}`,
    /// response `{"embedding": [...]}`.
    Ollama,
}

pub struct RemoteEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dimension: usize,
    flavor: RemoteFlavor,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
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

impl RemoteEmbedder {
    pub fn new(
        flavor: RemoteFlavor,
        url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
            dimension,
            flavor,
        })
    }

    fn map_error(err: reqwest::Error) -> EmbedError {
        if err.is_timeout() {
            EmbedError::Timeout
        } else if err.is_status() {
            let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
            if (400..500).contains(&status) {
                EmbedError::BadInput(err.to_string())
            } else {
                EmbedError::Unavailable(err.to_string())
            }
        } else {
            EmbedError::Unavailable(err.to_string())
        }
    }

    fn check_dimension(&self, vector: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
        if vector.len() != self.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(vector)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::BadInput("empty text".into()));
        }
        debug!(model = %self.model, chars = text.len(), "remote embed");
        match self.flavor {
            RemoteFlavor::OpenAi => {
                let response = self
                    .client
                    .post(&self.url)
                    .json(&OpenAiRequest {
                        model: &self.model,
                        input: [text],
                    })
                    .send()
                    .await
                    .map_err(Self::map_error)?
                    .error_for_status()
                    .map_err(Self::map_error)?;
                let body: OpenAiResponse =
                    response.json().await.map_err(Self::map_error)?;
                let first = body
                    .data
                    .into_iter()
                    .next()
                    .ok_or_else(|| EmbedError::Unavailable("empty data array".into()))?;
                self.check_dimension(first.embedding)
            }
            RemoteFlavor::Ollama => {
                let response = self
                    .client
                    .post(&self.url)
                    .json(&OllamaRequest {
                        model: &self.model,
                        prompt: text,
                    })
                    .send()
                    .await
                    .map_err(Self::map_error)?
                    .error_for_status()
                    .map_err(Self::map_error)?;
                let body: OllamaResponse =
                    response.json().await.map_err(Self::map_error)?;
                self.check_dimension(body.embedding)
            }
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
