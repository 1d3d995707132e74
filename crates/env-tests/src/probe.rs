//! HTTP probe with caller-supplied validation.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Maximum length for response body in error messages.
const MAX_ERROR_BODY_LEN: usize = 256;

/// Default request timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe errors.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("HTTP request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Validation failed for {url}: status {status}, body: {body}")]
    ValidationFailed {
        url: String,
        status: u16,
        body: String,
    },
}

/// Per-request options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// A response the validator accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

/// Decides whether a `(status, body)` pair is acceptable.
pub type Validator = dyn Fn(u16, &str) -> bool + Send + Sync;

/// Issues a GET and checks the response.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn get_with_validation(
        &self,
        url: &str,
        options: &ProbeOptions,
        validator: &Validator,
    ) -> Result<ProbeResponse, ProbeError>;
}

/// Validator accepting exactly `status` with a body containing `expected`.
pub fn status_and_body_contains(
    status: u16,
    expected: impl Into<String>,
) -> impl Fn(u16, &str) -> bool + Send + Sync {
    let expected = expected.into();
    move |actual_status: u16, body: &str| actual_status == status && body.contains(&expected)
}

/// `reqwest`-backed probe.
#[derive(Debug, Clone, Default)]
pub struct ReqwestProbe {
    http_client: Client,
}

impl ReqwestProbe {
    pub fn new() -> Self {
        Self {
            http_client: Client::new(),
        }
    }

    /// Use a preconfigured client.
    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get_with_validation(
        &self,
        url: &str,
        options: &ProbeOptions,
        validator: &Validator,
    ) -> Result<ProbeResponse, ProbeError> {
        let request_error = |source| ProbeError::Request {
            url: url.to_string(),
            source,
        };

        let response = self
            .http_client
            .get(url)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(request_error)?;

        debug!(url = %url, status, body_len = body.len(), "Probe response received");

        if !validator(status, &body) {
            return Err(ProbeError::ValidationFailed {
                url: url.to_string(),
                status,
                body: truncate_body(&body),
            });
        }

        info!(url = %url, status, "Probe passed");
        Ok(ProbeResponse { status, body })
    }
}

/// Truncate a body for inclusion in an error message.
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LEN {
        return body.to_string();
    }

    let mut end = MAX_ERROR_BODY_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", body.get(..end).unwrap_or_default())
}
