use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::document::Document;

pub const DEFAULT_ENDPOINT: &str = "https://ismp.crpt.ru/api/v3/lk/documents/create";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Registry returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout() || e.is_connect(),
            TransportError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
            TransportError::Encode(_) => false,
        }
    }
}

/// Delivers an admitted document to the registry.
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport {
    async fn send(&self, document: &Document) -> Result<String, TransportError>;
}

pub struct HttpTransport {
    client: Client,
    endpoint_url: String,
}

impl HttpTransport {
    pub fn new(endpoint_url: String, timeout_ms: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;

        Ok(Self { client, endpoint_url })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }
}

impl Transport for HttpTransport {
    async fn send(&self, document: &Document) -> Result<String, TransportError> {
        let body = serde_json::to_vec(document)?;

        let response = self
            .client
            .post(&self.endpoint_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        debug!(status = status.as_u16(), bytes = text.len(), "Registry responded");

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: normalize_body(&text),
            });
        }

        Ok(normalize_body(&text))
    }
}

// Lines are trimmed and joined, as the registry client has always read them.
fn normalize_body(text: &str) -> String {
    text.lines().map(str::trim).collect()
}
