//! Face-probability scoring of uploaded images through a hosted prediction model.

use crate::config::AnnotatorConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("prediction request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("prediction endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("empty prediction response")]
    EmptyResponse,

    #[error("unexpected prediction response: {0}")]
    UnexpectedResponse(String),
}

/// Scores an image; the pipeline treats failures as "no score"
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageAnnotator: Send + Sync {
    async fn face_probability(&self, image: &[u8]) -> Result<f64, AnnotateError>;
}

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    instances: Vec<Instance<'a>>,
}

#[derive(Debug, Serialize)]
struct Instance<'a> {
    image_bytes: ImageBytes,
    key: &'a str,
}

#[derive(Debug, Serialize)]
struct ImageBytes {
    b64: String,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    scores: Vec<f64>,
}

/// HTTP client for a `:predict` style endpoint
pub struct PredictionClient {
    http: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl PredictionClient {
    /// `None` when no endpoint is configured
    pub fn from_config(
        config: &AnnotatorConfig,
        timeout: Duration,
    ) -> Result<Option<Self>, AnnotateError> {
        let Some(endpoint) = config.endpoint.clone() else {
            return Ok(None);
        };

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Some(Self {
            http,
            endpoint,
            bearer_token: config.bearer_token.clone(),
        }))
    }
}

#[async_trait]
impl ImageAnnotator for PredictionClient {
    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn face_probability(&self, image: &[u8]) -> Result<f64, AnnotateError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&prediction_request(image));
        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AnnotateError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let score = parse_face_score(&body)?;
        debug!(score, "Received prediction");
        Ok(score)
    }
}

fn prediction_request(image: &[u8]) -> PredictionRequest<'static> {
    PredictionRequest {
        instances: vec![Instance {
            image_bytes: ImageBytes {
                b64: STANDARD.encode(image),
            },
            // Only used by the model host for request tracking
            key: "1",
        }],
    }
}

/// First score of the first prediction is the face probability
fn parse_face_score(body: &str) -> Result<f64, AnnotateError> {
    if body.trim().is_empty() {
        return Err(AnnotateError::EmptyResponse);
    }

    let response: PredictionResponse = serde_json::from_str(body)
        .map_err(|e| AnnotateError::UnexpectedResponse(e.to_string()))?;

    response
        .predictions
        .first()
        .and_then(|prediction| prediction.scores.first().copied())
        .ok_or_else(|| AnnotateError::UnexpectedResponse(body.to_string()))
}
